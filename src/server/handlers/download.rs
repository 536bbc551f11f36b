use crate::downloader::{DownloadJob, JobSpec, JobStatus, QualityTier, QueueStats};
use crate::server::{ApiError, ApiResult, AppState};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ApiResponse;

/// 创建下载任务请求
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDownloadRequest {
    /// 必填字段缺失时按空串处理，交给 `JobSpec::validate` 报告
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    /// 曲库中的曲目ID
    #[serde(default, alias = "track_id")]
    pub external_reference: String,
    /// 缺省时使用配置中的默认音质
    #[serde(default)]
    pub quality: Option<QualityTier>,
}

impl CreateDownloadRequest {
    fn into_spec(self, default_quality: QualityTier) -> JobSpec {
        JobSpec {
            title: self.title,
            artist: self.artist,
            album: self.album,
            external_reference: self.external_reference,
            quality: self.quality.unwrap_or(default_quality),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateDownloadResponse {
    pub job_id: String,
}

/// 批量下载请求
#[derive(Debug, Deserialize)]
pub struct CreateBatchDownloadRequest {
    pub items: Vec<CreateDownloadRequest>,
}

/// 批量下载错误项
#[derive(Debug, Serialize)]
pub struct BatchDownloadError {
    /// 在请求列表中的位置
    pub index: usize,
    pub title: String,
    pub reason: String,
}

/// 批量下载响应
#[derive(Debug, Serialize)]
pub struct BatchDownloadResponse {
    /// 成功创建的任务ID（保持请求顺序）
    pub job_ids: Vec<String>,
    pub failed: Vec<BatchDownloadError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusFilterQuery {
    #[serde(default)]
    pub status: Option<String>,
}

impl StatusFilterQuery {
    fn parse(&self) -> Result<Option<JobStatus>, ApiError> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => s
                .parse::<JobStatus>()
                .map(Some)
                .map_err(|_| ApiError::bad_request(format!("无效的任务状态: {}", s))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelDownloadResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct ClearFinishedResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct QueueStateResponse {
    pub paused: bool,
}

async fn default_quality(app_state: &AppState) -> QualityTier {
    app_state.config.read().await.download.default_quality
}

/// POST /api/v1/downloads
/// 创建下载任务
pub async fn create_download(
    State(app_state): State<AppState>,
    Json(req): Json<CreateDownloadRequest>,
) -> ApiResult<CreateDownloadResponse> {
    let spec = req.into_spec(default_quality(&app_state).await);
    let job_id = app_state.download_manager.enqueue(spec).await?;
    info!("创建下载任务成功: {}", job_id);
    Ok(Json(ApiResponse::success(CreateDownloadResponse { job_id })))
}

/// POST /api/v1/downloads/batch
/// 批量创建下载任务，每一项独立校验
pub async fn create_batch_download(
    State(app_state): State<AppState>,
    Json(req): Json<CreateBatchDownloadRequest>,
) -> ApiResult<BatchDownloadResponse> {
    let quality = default_quality(&app_state).await;
    let titles: Vec<String> = req.items.iter().map(|item| item.title.clone()).collect();
    let specs = req
        .items
        .into_iter()
        .map(|item| item.into_spec(quality))
        .collect();

    let results = app_state.download_manager.enqueue_batch(specs).await;

    let mut response = BatchDownloadResponse {
        job_ids: Vec::new(),
        failed: Vec::new(),
    };
    for (index, (result, title)) in results.into_iter().zip(titles).enumerate() {
        match result {
            Ok(job_id) => response.job_ids.push(job_id),
            Err(e) => {
                warn!("批量下载第 {} 项创建失败: {}", index, e);
                response.failed.push(BatchDownloadError {
                    index,
                    title,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        "批量下载: 成功 {} 项, 失败 {} 项",
        response.job_ids.len(),
        response.failed.len()
    );
    Ok(Json(ApiResponse::success(response)))
}

/// GET /api/v1/downloads?status=
/// 获取下载任务列表
pub async fn list_downloads(
    State(app_state): State<AppState>,
    Query(query): Query<StatusFilterQuery>,
) -> ApiResult<Vec<DownloadJob>> {
    let filter = query.parse()?;
    let jobs = app_state.download_manager.list_jobs(filter).await;
    Ok(Json(ApiResponse::success(jobs)))
}

/// GET /api/v1/downloads/stats
pub async fn download_stats(State(app_state): State<AppState>) -> ApiResult<QueueStats> {
    Ok(Json(ApiResponse::success(
        app_state.download_manager.stats().await,
    )))
}

/// GET /api/v1/downloads/:id
/// 获取指定下载任务
pub async fn get_download(
    State(app_state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<DownloadJob> {
    match app_state.download_manager.get_job(&job_id).await {
        Some(job) => Ok(Json(ApiResponse::success(job))),
        None => Err(ApiError::not_found(format!("任务不存在: {}", job_id))),
    }
}

/// POST /api/v1/downloads/:id/cancel
/// 取消下载任务，执行中的任务最多等待一个宽限期
pub async fn cancel_download(
    State(app_state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<CancelDownloadResponse> {
    let status = app_state.download_manager.cancel(&job_id).await?;
    Ok(Json(ApiResponse::success(CancelDownloadResponse {
        job_id,
        status,
    })))
}

/// DELETE /api/v1/downloads/:id
/// 移除已结束的任务
pub async fn delete_download(
    State(app_state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<DownloadJob> {
    let job = app_state.download_manager.remove_job(&job_id).await?;
    Ok(Json(ApiResponse::success(job)))
}

/// DELETE /api/v1/downloads/finished?status=
/// 批量清除已结束的任务，不指定状态时清除全部终态任务
pub async fn clear_finished(
    State(app_state): State<AppState>,
    Query(query): Query<StatusFilterQuery>,
) -> ApiResult<ClearFinishedResponse> {
    let status = query.parse()?;
    if let Some(status) = status {
        if !status.is_terminal() {
            return Err(ApiError::bad_request(format!(
                "只能清除已结束的任务: {}",
                status.as_str()
            )));
        }
    }
    let removed = app_state.download_manager.clear_finished(status).await;
    Ok(Json(ApiResponse::success(ClearFinishedResponse { removed })))
}

/// POST /api/v1/downloads/pause
pub async fn pause_downloads(State(app_state): State<AppState>) -> ApiResult<QueueStateResponse> {
    app_state.download_manager.pause_all().await;
    Ok(Json(ApiResponse::success(QueueStateResponse { paused: true })))
}

/// POST /api/v1/downloads/resume
pub async fn resume_downloads(State(app_state): State<AppState>) -> ApiResult<QueueStateResponse> {
    app_state.download_manager.resume_all().await;
    Ok(Json(ApiResponse::success(QueueStateResponse {
        paused: app_state.download_manager.is_paused().await,
    })))
}

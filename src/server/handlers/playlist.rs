use super::events::subscription_to_sse;
use crate::playlist::CandidateTrack;
use crate::server::{ApiError, AppState};
use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::Json;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

/// 校验请求
#[derive(Debug, Deserialize)]
pub struct ValidatePlaylistRequest {
    pub tracks: Vec<CandidateTrack>,
}

#[derive(Debug, Deserialize)]
pub struct GeneratePlaylistQuery {
    pub username: String,
    #[serde(default)]
    pub playlist_type: Option<String>,
}

fn new_batch_id() -> String {
    format!("batch-{}", uuid::Uuid::new_v4())
}

/// POST /api/v1/playlists/validate
/// 校验客户端提交的曲目，进度以 SSE 推送，最后一条为 complete 或 error
pub async fn validate_playlist(
    State(app_state): State<AppState>,
    Json(req): Json<ValidatePlaylistRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let batch_id = new_batch_id();
    info!("校验歌单: batch={}, 曲目数={}", batch_id, req.tracks.len());

    // 先订阅再启动，避免丢失第一批事件
    let subscription = app_state.broadcaster.subscribe(&batch_id);
    let pipeline = Arc::clone(&app_state.validation_pipeline);
    tokio::spawn(async move {
        // 结果已通过事件推送
        let _ = pipeline.run(&batch_id, req.tracks).await;
    });

    subscription_to_sse(subscription)
}

/// GET /api/v1/playlists/generate?username=&playlist_type=
/// 生成推荐歌单并逐条校验
pub async fn generate_playlist(
    State(app_state): State<AppState>,
    Query(query): Query<GeneratePlaylistQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let username = query.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::bad_request("用户名不能为空"));
    }
    let playlist_type = match query.playlist_type.filter(|t| !t.trim().is_empty()) {
        Some(t) => t,
        None => app_state
            .config
            .read()
            .await
            .validation
            .default_playlist_type
            .clone(),
    };

    let batch_id = new_batch_id();
    info!(
        "生成推荐歌单: user={}, type={}, batch={}",
        username, playlist_type, batch_id
    );

    let subscription = app_state.broadcaster.subscribe(&batch_id);
    let pipeline = Arc::clone(&app_state.validation_pipeline);
    let source = Arc::clone(&app_state.candidate_source);
    tokio::spawn(async move {
        let _ = pipeline
            .generate_and_run(source.as_ref(), &batch_id, &username, &playlist_type)
            .await;
    });

    Ok(subscription_to_sse(subscription))
}

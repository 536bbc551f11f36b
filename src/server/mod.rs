// Web服务器模块

pub mod error;
pub mod events;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// CORS 配置，包含 "*" 时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的 CORS 来源 {}: {}", origin, e);
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

/// 构建完整路由（API 前缀 /api/v1）
pub fn build_router(app_state: AppState, cors_origins: &[String]) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins));

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        // 下载队列
        .route(
            "/downloads",
            post(handlers::create_download).get(handlers::list_downloads),
        )
        .route("/downloads/batch", post(handlers::create_batch_download))
        .route("/downloads/stats", get(handlers::download_stats))
        .route("/downloads/pause", post(handlers::pause_downloads))
        .route("/downloads/resume", post(handlers::resume_downloads))
        .route("/downloads/finished", delete(handlers::clear_finished))
        .route(
            "/downloads/:id",
            get(handlers::get_download).delete(handlers::delete_download),
        )
        .route("/downloads/:id/cancel", post(handlers::cancel_download))
        // 进度事件（SSE）
        .route("/events/:subject_id", get(handlers::subscribe_events))
        // 歌单校验（SSE）
        .route("/playlists/validate", post(handlers::validate_playlist))
        .route("/playlists/generate", get(handlers::generate_playlist))
        .route("/endpoints", get(handlers::list_endpoints))
        .with_state(app_state);

    Router::new().nest("/api/v1", api_routes).layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::downloader::{
        EndpointRegistry, JobLease, TransferError, TransferExecutor, TransferOutcome,
    };
    use crate::playlist::{
        Availability, AvailabilityChecker, AvailabilityError, CandidateTrack,
        StaticCandidateSource,
    };
    use crate::server::events::ProgressBroadcaster;
    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// 标题为 "slow" 的任务一直等到被取消
    struct InstantExecutor;

    #[async_trait]
    impl TransferExecutor for InstantExecutor {
        async fn execute(
            &self,
            lease: &JobLease,
            _endpoint: &str,
            cancel: &CancellationToken,
        ) -> Result<TransferOutcome, TransferError> {
            if lease.target().title == "slow" {
                cancel.cancelled().await;
                return Err(TransferError::Cancelled);
            }
            lease.report_progress(10, Some(10)).await;
            Ok(TransferOutcome {
                output_path: PathBuf::from("/music/out.flac"),
                bytes_written: 10,
                sha256: None,
                skipped: false,
            })
        }
    }

    struct PrefixChecker;

    #[async_trait]
    impl AvailabilityChecker for PrefixChecker {
        async fn check(&self, track: &CandidateTrack) -> Result<Availability, AvailabilityError> {
            if track.title.starts_with("missing") {
                Ok(Availability::NotFound)
            } else {
                Ok(Availability::Found {
                    external_id: format!("id-{}", track.title),
                    album: None,
                })
            }
        }
    }

    async fn spawn_app() -> (String, AppState) {
        let mut config = AppConfig::default();
        config.download.max_concurrent_tasks = 1;
        config.download.cancel_grace_secs = 1;

        let state = AppState::from_parts(
            config,
            Arc::new(InstantExecutor),
            Arc::new(PrefixChecker),
            Arc::new(StaticCandidateSource::new(vec![
                CandidateTrack::new("one", "A"),
                CandidateTrack::new("missing-two", "B"),
            ])),
            Arc::new(EndpointRegistry::new(vec![("http://catalog".into(), 0)])),
            Arc::new(ProgressBroadcaster::new(64, Duration::from_secs(5))),
        );

        let app = build_router(state.clone(), &["*".to_string()]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api/v1", addr), state)
    }

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    /// 读取 SSE 响应中的所有 data 记录
    async fn sse_records(response: reqwest::Response) -> Vec<Value> {
        let body = response.text().await.unwrap();
        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).unwrap())
            .collect()
    }

    async fn wait_status(base: &str, job_id: &str, status: &str) {
        for _ in 0..200 {
            let job: Value = client()
                .get(format!("{}/downloads/{}", base, job_id))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if job["data"]["status"] == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("任务 {} 未进入状态 {}", job_id, status);
    }

    #[tokio::test]
    async fn test_submit_and_query() {
        let (base, _state) = spawn_app().await;
        let client = client();

        let health: Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "ok");

        let created: Value = client
            .post(format!("{}/downloads", base))
            .json(&json!({"title": "Song", "artist": "Artist", "track_id": "42"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["code"], 0);
        let job_id = created["data"]["job_id"].as_str().unwrap().to_string();
        wait_status(&base, &job_id, "completed").await;

        let job: Value = client
            .get(format!("{}/downloads/{}", base, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(job["data"]["quality"], "LOSSLESS");
        assert_eq!(job["data"]["external_reference"], "42");

        let listed: Value = client
            .get(format!("{}/downloads?status=completed", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let bad_filter = client
            .get(format!("{}/downloads?status=bogus", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_filter.status(), StatusCode::BAD_REQUEST);

        let stats: Value = client
            .get(format!("{}/downloads/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["data"]["completed"], 1);

        let endpoints: Value = client
            .get(format!("{}/endpoints", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(endpoints["data"][0]["url"], "http://catalog");

        let cleared: Value = client
            .delete(format!("{}/downloads/finished?status=completed", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cleared["data"]["removed"], 1);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (base, _state) = spawn_app().await;
        let client = client();

        let invalid = client
            .post(format!("{}/downloads", base))
            .json(&json!({"title": " ", "artist": "A", "external_reference": "1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        let body: Value = invalid.json().await.unwrap();
        assert_eq!(body["code"], 400);

        let missing = client
            .post(format!("{}/downloads/nope/cancel", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let created: Value = client
            .post(format!("{}/downloads", base))
            .json(&json!({"title": "slow", "artist": "A", "external_reference": "1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let job_id = created["data"]["job_id"].as_str().unwrap().to_string();
        wait_status(&base, &job_id, "active").await;

        let conflict = client
            .delete(format!("{}/downloads/{}", base, job_id))
            .send()
            .await
            .unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let cancelled: Value = client
            .post(format!("{}/downloads/{}/cancel", base, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled["data"]["status"], "cancelled");

        let removed = client
            .delete(format!("{}/downloads/{}", base, job_id))
            .send()
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_required_field_is_invalid_spec() {
        let (base, state) = spawn_app().await;
        let client = client();

        let response = client
            .post(format!("{}/downloads", base))
            .json(&json!({"artist": "A", "external_reference": "1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], 400);
        assert!(body["message"].as_str().unwrap().contains("title"));

        let batch: Value = client
            .post(format!("{}/downloads/batch", base))
            .json(&json!({"items": [
                {"title": "Song", "artist": "A", "external_reference": "1"},
                {"title": "No Ref", "artist": "A"}
            ]}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(batch["data"]["job_ids"].as_array().unwrap().len(), 1);
        assert_eq!(batch["data"]["failed"][0]["index"], 1);
        assert_eq!(state.download_manager.list_jobs(None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_event_stream_for_job() {
        let (base, state) = spawn_app().await;
        let client = client();

        state.download_manager.pause_all().await;
        let created: Value = client
            .post(format!("{}/downloads", base))
            .json(&json!({"title": "Song", "artist": "A", "external_reference": "7"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let job_id = created["data"]["job_id"].as_str().unwrap().to_string();

        let response = client
            .get(format!("{}/events/{}", base, job_id))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // 等订阅建立后再恢复调度
        for _ in 0..100 {
            if state.broadcaster.subscriber_count(&job_id) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client
            .post(format!("{}/downloads/resume", base))
            .send()
            .await
            .unwrap();

        let records = sse_records(response).await;
        let kinds: Vec<&str> = records.iter().filter_map(|r| r["type"].as_str()).collect();
        assert_eq!(kinds.first(), Some(&"active"));
        assert_eq!(kinds.last(), Some(&"completed"));
        assert!(records.iter().all(|r| r["subject_id"] == job_id.as_str()));

        let unknown = client.get(format!("{}/events/unknown", base)).send().await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_playlist_validation_streams() {
        let (base, _state) = spawn_app().await;
        let client = client();

        let response = client
            .post(format!("{}/playlists/validate", base))
            .json(&json!({"tracks": [
                {"title": "a", "artist": "X"},
                {"title": "missing-b", "artist": "Y"},
                {"title": "c", "artist": "Z", "mbid": "m-1"}
            ]}))
            .send()
            .await
            .unwrap();
        let records = sse_records(response).await;
        let last = records.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["found_count"], 2);
        assert_eq!(last["tracks"][2]["mbid"], "m-1");
        assert_eq!(last["tracks"][1]["available"], false);

        let generated = client
            .get(format!("{}/playlists/generate?username=rob", base))
            .send()
            .await
            .unwrap();
        let records = sse_records(generated).await;
        let last = records.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["found_count"], 1);
        assert_eq!(last["total"], 2);

        let missing_user = client
            .get(format!("{}/playlists/generate?username=%20", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing_user.status(), StatusCode::BAD_REQUEST);
    }
}

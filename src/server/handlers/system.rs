use super::ApiResponse;
use crate::downloader::EndpointStatus;
use crate::server::AppState;
use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// GET /api/v1/health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/v1/endpoints
/// 曲库端点健康状态
pub async fn list_endpoints(State(app_state): State<AppState>) -> Json<ApiResponse<Vec<EndpointStatus>>> {
    Json(ApiResponse::success(app_state.registry.snapshot()))
}

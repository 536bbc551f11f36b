// API 错误

use super::handlers::ApiResponse;
use crate::downloader::QueueError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// 处理器统一的返回类型
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// 带 HTTP 状态码的错误，响应体仍是 `ApiResponse`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match err {
            QueueError::InvalidJobSpec(_) => StatusCode::BAD_REQUEST,
            QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
            QueueError::JobActive(_) => StatusCode::CONFLICT,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()>::error(self.status.as_u16() as i32, self.message);
        (self.status, Json(body)).into_response()
    }
}

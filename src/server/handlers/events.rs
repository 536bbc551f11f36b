use crate::server::events::Subscription;
use crate::server::{ApiError, AppState};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tracing::debug;

/// 订阅流 -> SSE 响应
///
/// 每条消息的 data 都是一个带 `type` 字段的 JSON，心跳由订阅自身产生
pub fn subscription_to_sse(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = subscription
        .into_stream()
        .map(|message| Ok(Event::default().data(message.to_json())));
    Sse::new(stream)
}

/// GET /api/v1/events/:subject_id
/// 订阅下载任务的进度事件（只推送订阅之后的事件）
pub async fn subscribe_events(
    State(app_state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = app_state.download_manager.subscribe(&subject_id).await?;
    debug!("新的 SSE 订阅: {}", subject_id);
    Ok(subscription_to_sse(subscription))
}

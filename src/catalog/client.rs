// 曲库服务客户端

use super::types::{extract_items, extract_stream_url, is_empty_response, TrackSummary};
use crate::downloader::engine::{Resolver, StreamLocation};
use crate::downloader::error::TransferError;
use crate::downloader::task::QualityTier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// 单个请求的超时（不含音频数据传输）
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// 曲库服务客户端，端点由调用方指定
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
}

impl CatalogClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// 共享的底层 HTTP 客户端（音频数据传输也复用它）
    pub fn http(&self) -> &Client {
        &self.client
    }

    async fn get_json(&self, url: &str, context: &str) -> Result<Value, TransferError> {
        debug!("请求曲库服务: {}", url);
        let response = self
            .client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::from_status(status, context));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransferError::Recoverable(format!("{} 响应解析失败: {}", context, e)))
    }

    /// 获取曲目信息（包含播放地址或 manifest）
    pub async fn get_track(
        &self,
        endpoint: &str,
        track_id: &str,
        quality: QualityTier,
    ) -> Result<Value, TransferError> {
        let url = format!(
            "{}/track/?id={}&quality={}",
            endpoint.trim_end_matches('/'),
            urlencoding::encode(track_id),
            quality.as_str()
        );
        self.get_json(&url, "获取曲目").await
    }

    /// 搜索曲目
    pub async fn search_tracks(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<Vec<TrackSummary>, TransferError> {
        let url = format!(
            "{}/search/?s={}",
            endpoint.trim_end_matches('/'),
            urlencoding::encode(query)
        );
        let value = self.get_json(&url, "搜索曲目").await?;
        Ok(extract_items(&value, "tracks")
            .iter()
            .filter_map(TrackSummary::from_value)
            .collect())
    }
}

#[async_trait]
impl Resolver for CatalogClient {
    async fn resolve(
        &self,
        endpoint: &str,
        external_reference: &str,
        quality: QualityTier,
    ) -> Result<StreamLocation, TransferError> {
        let data = self.get_track(endpoint, external_reference, quality).await?;
        if is_empty_response(&data) {
            return Err(TransferError::Fatal(format!(
                "曲目不存在: {}",
                external_reference
            )));
        }

        // 有曲目信息但没有播放地址，换一个端点可能成功
        let url = extract_stream_url(&data).ok_or_else(|| {
            TransferError::Recoverable(format!("未找到播放地址: {}", external_reference))
        })?;

        info!(
            "✓ 解析播放地址成功: track={}, quality={}, endpoint={}",
            external_reference, quality, endpoint
        );
        Ok(StreamLocation::new(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use base64::Engine as _;
    use serde_json::json;
    use std::collections::HashMap;

    async fn spawn_service() -> String {
        let app = Router::new()
            .route(
                "/track/",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    match q.get("id").map(String::as_str) {
                        Some("1") => {
                            let manifest = base64::engine::general_purpose::STANDARD
                                .encode(r#"{"urls":["https://cdn.example/1.flac"]}"#);
                            Json(json!([{"id": 1, "manifest": manifest}])).into_response()
                        }
                        Some("2") => Json(json!([{"id": 2, "title": "no stream"}])).into_response(),
                        Some("3") => Json(json!([])).into_response(),
                        _ => axum::http::StatusCode::NOT_FOUND.into_response(),
                    }
                }),
            )
            .route(
                "/search/",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let items = if q.get("s").map(String::as_str) == Some("Artist Song") {
                        json!([{"id": 42, "title": "Song", "artist": {"name": "Artist"}, "album": {"title": "LP"}}])
                    } else {
                        json!([])
                    };
                    Json(json!({"tracks": {"items": items}}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> CatalogClient {
        CatalogClient::from_client(Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test]
    async fn test_resolve_variants() {
        let base = spawn_service().await;
        let client = client();

        let location = client.resolve(&base, "1", QualityTier::Lossless).await.unwrap();
        assert_eq!(location.url, "https://cdn.example/1.flac");

        let err = client.resolve(&base, "2", QualityTier::Lossless).await.unwrap_err();
        assert!(matches!(err, TransferError::Recoverable(_)));

        let err = client.resolve(&base, "3", QualityTier::Lossless).await.unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));

        let err = client.resolve(&base, "404", QualityTier::Lossless).await.unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_level() {
        // 绑定后立即释放，端口大概率无人监听
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client()
            .resolve(&format!("http://{}", addr), "1", QualityTier::Lossless)
            .await
            .unwrap_err();
        assert!(err.is_connection_level(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_search_tracks() {
        let base = spawn_service().await;
        let tracks = client().search_tracks(&base, "Artist Song").await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "42");
        assert_eq!(tracks[0].album.as_deref(), Some("LP"));

        assert!(client().search_tracks(&base, "nothing").await.unwrap().is_empty());
    }
}

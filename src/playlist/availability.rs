//! 曲库可用性检查
//!
//! 默认实现按 "{歌手} {标题}" 搜索曲库，取第一条结果。
//! 请求失败时按端点注册表切换端点。所有端点都在连接层失败时返回
//! `ServiceUnavailable`，由流水线终止整个批次；限流、5xx、超时等只影响
//! 当前记录，返回 `Lookup`。

use super::types::CandidateTrack;
use crate::catalog::CatalogClient;
use crate::downloader::endpoint::EndpointRegistry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// 单条记录的检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Found {
        external_id: String,
        album: Option<String>,
    },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AvailabilityError {
    /// 曲库服务整体不可用，整个批次终止
    #[error("曲库服务不可用: {0}")]
    ServiceUnavailable(String),

    /// 单条记录查询失败，按未找到处理
    #[error("查询失败: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn check(&self, track: &CandidateTrack) -> Result<Availability, AvailabilityError>;
}

/// 基于曲库搜索接口的可用性检查
pub struct CatalogAvailabilityChecker {
    client: CatalogClient,
    registry: Arc<EndpointRegistry>,
}

impl CatalogAvailabilityChecker {
    pub fn new(client: CatalogClient, registry: Arc<EndpointRegistry>) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl AvailabilityChecker for CatalogAvailabilityChecker {
    async fn check(&self, track: &CandidateTrack) -> Result<Availability, AvailabilityError> {
        let query = track.search_query();
        let mut tried = HashSet::new();
        let mut last_error = String::from("没有配置任何曲库端点");
        // 出现过非连接层的失败说明服务仍可达
        let mut reachable_error: Option<String> = None;

        while tried.len() < self.registry.len() {
            let Some(endpoint) = self.registry.next_candidate(&tried) else {
                break;
            };
            if !tried.insert(endpoint.clone()) {
                break;
            }

            match self.client.search_tracks(&endpoint, &query).await {
                Ok(results) => {
                    self.registry.mark_success(&endpoint);
                    return Ok(match results.into_iter().next() {
                        Some(hit) => {
                            debug!("✓ 曲库中找到: {} -> {}", track.display_name(), hit.id);
                            Availability::Found {
                                external_id: hit.id,
                                album: hit.album,
                            }
                        }
                        None => {
                            debug!("✗ 曲库中未找到: {}", track.display_name());
                            Availability::NotFound
                        }
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("搜索失败，切换端点: endpoint={}, 错误: {}", endpoint, e);
                    if e.is_connection_level() {
                        self.registry.mark_suspected_down(&endpoint);
                        last_error = e.to_string();
                    } else {
                        reachable_error = Some(e.to_string());
                    }
                }
                Err(e) => return Err(AvailabilityError::Lookup(e.to_string())),
            }
        }

        match reachable_error {
            Some(e) => Err(AvailabilityError::Lookup(e)),
            None => Err(AvailabilityError::ServiceUnavailable(last_error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use crate::playlist::ValidationPipeline;
    use crate::server::events::ProgressBroadcaster;
    use axum::{Json, Router};
    use reqwest::Client;
    use serde_json::json;
    use std::collections::HashMap;

    async fn spawn_catalog() -> String {
        let app: Router = Router::new().route(
            "/search/",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let items = match q.get("s").map(String::as_str) {
                    Some("Daft Punk One More Time") => json!([{
                        "id": 3066136,
                        "title": "One More Time",
                        "album": {"title": "Discovery"}
                    }]),
                    Some(query) if query.ends_with("Busy") => {
                        return StatusCode::TOO_MANY_REQUESTS.into_response();
                    }
                    _ => json!([]),
                };
                Json(json!({"tracks": {"items": items}})).into_response()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn dead_endpoint() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    fn checker(endpoints: Vec<String>) -> CatalogAvailabilityChecker {
        let registry = EndpointRegistry::new(
            endpoints
                .into_iter()
                .enumerate()
                .map(|(i, url)| (url, i as u32))
                .collect(),
        );
        CatalogAvailabilityChecker::new(
            CatalogClient::from_client(Client::builder().no_proxy().build().unwrap()),
            Arc::new(registry),
        )
    }

    #[tokio::test]
    async fn test_found_after_failover() {
        let dead = dead_endpoint();
        let live = spawn_catalog().await;
        let checker = checker(vec![dead.clone(), live]);

        let result = checker
            .check(&CandidateTrack::new("One More Time", "Daft Punk"))
            .await
            .unwrap();
        assert_eq!(
            result,
            Availability::Found {
                external_id: "3066136".into(),
                album: Some("Discovery".into()),
            }
        );
        assert!(checker.registry.is_suspected_down(&dead));

        let missing = checker
            .check(&CandidateTrack::new("Unknown", "Nobody"))
            .await
            .unwrap();
        assert_eq!(missing, Availability::NotFound);
    }

    #[tokio::test]
    async fn test_all_endpoints_down() {
        let checker = checker(vec![dead_endpoint(), dead_endpoint()]);
        let err = checker
            .check(&CandidateTrack::new("Song", "Artist"))
            .await
            .unwrap_err();
        assert!(matches!(err, AvailabilityError::ServiceUnavailable(_)));

        let empty = self::checker(Vec::new());
        assert!(matches!(
            empty.check(&CandidateTrack::new("Song", "Artist")).await,
            Err(AvailabilityError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_record_is_lookup_error() {
        let checker = checker(vec![spawn_catalog().await, spawn_catalog().await]);
        let err = checker
            .check(&CandidateTrack::new("Busy", "Artist"))
            .await
            .unwrap_err();
        assert!(matches!(err, AvailabilityError::Lookup(_)));
        assert!(checker.registry.snapshot().iter().all(|s| !s.suspected_down));
    }

    #[tokio::test]
    async fn test_rate_limited_record_does_not_abort_batch() {
        let checker = checker(vec![spawn_catalog().await]);
        let pipeline = ValidationPipeline::new(
            Arc::new(checker),
            Arc::new(ProgressBroadcaster::default()),
            1,
        );

        let report = pipeline
            .run(
                "batch-busy",
                vec![
                    CandidateTrack::new("One More Time", "Daft Punk"),
                    CandidateTrack::new("Busy", "Artist"),
                    CandidateTrack::new("Unknown", "Nobody"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.found_count, 1);
        assert!(!report.tracks[1].available);
    }
}

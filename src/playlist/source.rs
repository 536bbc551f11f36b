//! 候选曲目来源
//!
//! 默认从 ListenBrainz 的 "created for" 推荐歌单中取曲目：
//! 1. `GET /1/user/{user}/playlists/createdfor` 找到类型匹配的最新歌单
//! 2. `GET /1/playlist/{mbid}` 读取 JSPF 曲目列表

use super::types::CandidateTrack;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// JSPF 中 MusicBrainz 扩展字段的键
const JSPF_PLAYLIST_EXTENSION: &str = "https://musicbrainz.org/doc/jspf#playlist";
const RECORDING_PREFIX: &str = "https://musicbrainz.org/recording/";
const PLAYLIST_PREFIX: &str = "https://listenbrainz.org/playlist/";

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// 为用户生成候选曲目列表
    async fn generate(&self, username: &str, playlist_type: &str) -> Result<Vec<CandidateTrack>>;
}

/// ListenBrainz 推荐歌单
pub struct ListenBrainzSource {
    client: Client,
    base_url: String,
}

impl ListenBrainzSource {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        debug!("请求 ListenBrainz: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("请求 ListenBrainz 失败: {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("ListenBrainz 返回错误状态 {}: {}", status, url);
        }
        response
            .json::<Value>()
            .await
            .context("解析 ListenBrainz 响应失败")
    }

    /// 找到类型匹配的最新歌单，返回歌单 MBID
    async fn find_playlist(&self, username: &str, playlist_type: &str) -> Result<String> {
        let url = format!(
            "{}/1/user/{}/playlists/createdfor",
            self.base_url,
            urlencoding::encode(username)
        );
        let data = self.get_json(&url).await?;
        let playlists = data
            .get("playlists")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        playlists
            .iter()
            .filter_map(|entry| entry.get("playlist"))
            .find(|playlist| playlist_matches(playlist, playlist_type))
            .and_then(|playlist| playlist.get("identifier").and_then(Value::as_str))
            .map(|identifier| identifier.trim_start_matches(PLAYLIST_PREFIX).trim_end_matches('/').to_string())
            .ok_or_else(|| anyhow!("用户 {} 没有类型为 {} 的推荐歌单", username, playlist_type))
    }
}

/// 歌单类型匹配
///
/// 优先比较 `source_patch`，`periodic-jams` 同时匹配每日和每周推荐，
/// 最后退回到标题包含类型名
fn playlist_matches(playlist: &Value, playlist_type: &str) -> bool {
    let wanted = playlist_type.to_lowercase();
    let patch = playlist
        .pointer(&format!(
            "/extension/{}/additional_metadata/algorithm_metadata/source_patch",
            JSPF_PLAYLIST_EXTENSION.replace('~', "~0").replace('/', "~1")
        ))
        .and_then(Value::as_str)
        .map(str::to_lowercase);

    if let Some(patch) = patch {
        if patch == wanted || (wanted == "periodic-jams" && patch.ends_with("-jams")) {
            return true;
        }
    }

    let title = playlist
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    let words = wanted.replace('-', " ");
    let words = words.trim_start_matches("periodic ");
    !words.is_empty() && title.contains(words)
}

/// JSPF 曲目 -> 候选曲目
fn parse_jspf_track(track: &Value) -> Option<CandidateTrack> {
    let title = track.get("title").and_then(Value::as_str)?.trim();
    let artist = track.get("creator").and_then(Value::as_str)?.trim();
    if title.is_empty() || artist.is_empty() {
        return None;
    }

    let identifier = match track.get("identifier") {
        Some(Value::Array(list)) => list.first().and_then(Value::as_str),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    };
    let mbid = identifier
        .filter(|id| id.starts_with(RECORDING_PREFIX))
        .map(|id| id.trim_start_matches(RECORDING_PREFIX).trim_end_matches('/').to_string());

    Some(CandidateTrack {
        title: title.to_string(),
        artist: artist.to_string(),
        album: track
            .get("album")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|a| !a.is_empty()),
        mbid,
    })
}

#[async_trait]
impl CandidateSource for ListenBrainzSource {
    async fn generate(&self, username: &str, playlist_type: &str) -> Result<Vec<CandidateTrack>> {
        let username = username.trim();
        if username.is_empty() {
            bail!("用户名不能为空");
        }

        let playlist_id = self.find_playlist(username, playlist_type).await?;
        let url = format!("{}/1/playlist/{}", self.base_url, playlist_id);
        let data = self.get_json(&url).await?;

        let tracks: Vec<CandidateTrack> = data
            .pointer("/playlist/track")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(parse_jspf_track).collect())
            .unwrap_or_default();

        info!(
            "从 ListenBrainz 获取推荐歌单: user={}, type={}, 曲目数={}",
            username,
            playlist_type,
            tracks.len()
        );
        Ok(tracks)
    }
}

/// 固定曲目列表
#[derive(Debug, Clone, Default)]
pub struct StaticCandidateSource {
    tracks: Vec<CandidateTrack>,
}

impl StaticCandidateSource {
    pub fn new(tracks: Vec<CandidateTrack>) -> Self {
        Self { tracks }
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn generate(&self, _username: &str, _playlist_type: &str) -> Result<Vec<CandidateTrack>> {
        Ok(self.tracks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn jspf_playlist(id: &str, title: &str, patch: &str) -> Value {
        json!({
            "playlist": {
                "identifier": format!("{}{}", PLAYLIST_PREFIX, id),
                "title": title,
                "extension": {
                    JSPF_PLAYLIST_EXTENSION: {
                        "additional_metadata": {
                            "algorithm_metadata": {"source_patch": patch}
                        }
                    }
                }
            }
        })
    }

    async fn spawn_listenbrainz() -> String {
        let app = Router::new()
            .route(
                "/1/user/:user/playlists/createdfor",
                get(|Path(user): Path<String>| async move {
                    if user != "rob" {
                        return Json(json!({"playlists": []}));
                    }
                    Json(json!({"playlists": [
                        jspf_playlist("exp-1", "Weekly Exploration for rob", "weekly-exploration"),
                        jspf_playlist("jams-1", "Weekly Jams for rob", "weekly-jams"),
                    ]}))
                }),
            )
            .route(
                "/1/playlist/:id",
                get(|Path(id): Path<String>| async move {
                    let tracks = if id == "jams-1" {
                        json!([
                            {
                                "title": "Windowlicker",
                                "creator": "Aphex Twin",
                                "album": "Windowlicker",
                                "identifier": ["https://musicbrainz.org/recording/abc-123"]
                            },
                            {"title": "", "creator": "Nobody"},
                            {"title": "Teardrop", "creator": "Massive Attack"}
                        ])
                    } else {
                        json!([{"title": "Other", "creator": "Someone"}])
                    };
                    Json(json!({"playlist": {"track": tracks}}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn source(base: &str) -> ListenBrainzSource {
        ListenBrainzSource::with_client(Client::builder().no_proxy().build().unwrap(), base)
    }

    #[tokio::test]
    async fn test_generate_periodic_jams() {
        let base = spawn_listenbrainz().await;
        let tracks = source(&base).generate("rob", "periodic-jams").await.unwrap();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].artist, "Aphex Twin");
        assert_eq!(tracks[0].mbid.as_deref(), Some("abc-123"));
        assert_eq!(tracks[0].album.as_deref(), Some("Windowlicker"));
        assert_eq!(tracks[1].mbid, None);

        let exploration = source(&base)
            .generate("rob", "weekly-exploration")
            .await
            .unwrap();
        assert_eq!(exploration[0].title, "Other");
    }

    #[tokio::test]
    async fn test_generate_errors() {
        let base = spawn_listenbrainz().await;
        assert!(source(&base).generate("alice", "periodic-jams").await.is_err());
        assert!(source(&base).generate("  ", "periodic-jams").await.is_err());
    }

    #[test]
    fn test_playlist_matches_by_title() {
        let playlist = json!({"title": "Daily Jams for rob, 2024-01-01"});
        assert!(playlist_matches(&playlist, "daily-jams"));
        assert!(playlist_matches(&playlist, "periodic-jams"));
        assert!(!playlist_matches(&playlist, "weekly-exploration"));
    }
}

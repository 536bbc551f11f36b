// 曲库服务响应解析
//
// 后端实例的响应结构并不统一（列表包裹、tracks.items、直接 items 都出现过），
// 这里统一按 serde_json::Value 宽松解析

use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// 搜索结果中的曲目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    /// 曲目ID（统一转成字符串）
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// 时长（秒）
    pub duration: Option<u64>,
    pub cover: Option<String>,
    pub quality: Option<String>,
}

impl TrackSummary {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = match value.get("id")? {
            Value::Number(n) => n.to_string(),
            Value::String(s) if !s.is_empty() => s.clone(),
            _ => return None,
        };

        let artist = value
            .get("artist")
            .and_then(|a| a.get("name"))
            .or_else(|| {
                value
                    .get("artists")
                    .and_then(|a| a.get(0))
                    .and_then(|a| a.get("name"))
            })
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let album = value.get("album");

        Some(Self {
            id,
            title: str_field(value, "title").unwrap_or_default(),
            artist,
            album: album.and_then(|a| str_field(a, "title")),
            duration: value.get("duration").and_then(Value::as_u64),
            cover: album.and_then(|a| str_field(a, "cover")),
            quality: str_field(value, "audioQuality"),
        })
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// 从搜索响应中取出条目列表
///
/// 支持三种形态：
/// - `[{ "<key>": { "items": [...] } }]` 或 `[{ "<key>": [...] }]`
/// - `{ "<key>": { "items": [...] } }`
/// - `{ "items": [...] }` 或直接是数组
pub fn extract_items<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    match value {
        Value::Array(list) => {
            let nested = list.first().and_then(|first| first.get(key));
            match nested {
                Some(Value::Object(obj)) => obj
                    .get("items")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
                Some(Value::Array(items)) => items.as_slice(),
                _ => list.as_slice(),
            }
        }
        Value::Object(obj) => obj
            .get(key)
            .filter(|v| v.is_object())
            .and_then(|v| v.get("items"))
            .or_else(|| obj.get("items"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

fn url_pattern() -> Option<&'static Regex> {
    static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    URL_RE
        .get_or_init(|| Regex::new(r#"https?://[^\s"<]+"#).ok())
        .as_ref()
}

/// 从曲目响应中提取播放地址
///
/// 优先使用 `OriginalTrackUrl`，其次解码 base64 `manifest`：
/// JSON 清单取 `urls[0]`，否则取正文中第一个 http(s) 地址
pub fn extract_stream_url(track_data: &Value) -> Option<String> {
    let entries: Vec<&Value> = match track_data {
        Value::Array(list) => list.iter().collect(),
        other => vec![other],
    };

    if let Some(url) = entries
        .iter()
        .find_map(|entry| entry.get("OriginalTrackUrl").and_then(Value::as_str))
    {
        return Some(url.to_string());
    }

    entries
        .iter()
        .filter_map(|entry| entry.get("manifest").and_then(Value::as_str))
        .find_map(decode_manifest)
}

fn decode_manifest(manifest: &str) -> Option<String> {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(manifest.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("manifest 解码失败: {}", e);
            return None;
        }
    };
    let decoded = String::from_utf8_lossy(&bytes);

    if let Ok(json) = serde_json::from_str::<Value>(&decoded) {
        if let Some(url) = json
            .get("urls")
            .and_then(|urls| urls.get(0))
            .and_then(Value::as_str)
        {
            return Some(url.to_string());
        }
    }

    url_pattern()?
        .find(&decoded)
        .map(|m| m.as_str().to_string())
}

/// 响应是否为空（null、空数组、空对象）
pub fn is_empty_response(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(list) => list.is_empty(),
        Value::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    #[test]
    fn test_original_track_url_preferred() {
        let data = json!([
            {"manifest": STANDARD.encode(r#"{"urls":["https://cdn/b.flac"]}"#)},
            {"OriginalTrackUrl": "https://cdn/a.flac"}
        ]);
        assert_eq!(extract_stream_url(&data).as_deref(), Some("https://cdn/a.flac"));
    }

    #[test]
    fn test_manifest_json_urls() {
        let data = json!({"manifest": STANDARD.encode(r#"{"mimeType":"audio/flac","urls":["https://cdn/x.flac?token=1"]}"#)});
        assert_eq!(extract_stream_url(&data).as_deref(), Some("https://cdn/x.flac?token=1"));
    }

    #[test]
    fn test_manifest_regex_fallback() {
        let mpd = r#"<MPD><BaseURL>https://cdn/seg/init.mp4</BaseURL></MPD>"#;
        let data = json!([{"manifest": STANDARD.encode(mpd)}]);
        assert_eq!(
            extract_stream_url(&data).as_deref(),
            Some("https://cdn/seg/init.mp4")
        );

        let bad = json!({"manifest": "%%%not-base64"});
        assert_eq!(extract_stream_url(&bad), None);
        assert_eq!(extract_stream_url(&json!({"title": "x"})), None);
    }

    #[test]
    fn test_extract_items_shapes() {
        let wrapped = json!([{"tracks": {"items": [{"id": 1}, {"id": 2}]}}]);
        assert_eq!(extract_items(&wrapped, "tracks").len(), 2);

        let nested_list = json!([{"tracks": [{"id": 1}]}]);
        assert_eq!(extract_items(&nested_list, "tracks").len(), 1);

        let plain_list = json!([{"id": 1}, {"id": 2}, {"id": 3}]);
        assert_eq!(extract_items(&plain_list, "tracks").len(), 3);

        let object = json!({"tracks": {"items": [{"id": 9}]}});
        assert_eq!(extract_items(&object, "tracks")[0]["id"], 9);

        let items = json!({"items": [{"id": 5}]});
        assert_eq!(extract_items(&items, "tracks").len(), 1);

        assert!(extract_items(&json!("nope"), "tracks").is_empty());
    }

    #[test]
    fn test_track_summary_parse() {
        let value = json!({
            "id": 77646168,
            "title": "Song",
            "duration": 215,
            "audioQuality": "LOSSLESS",
            "artists": [{"name": "Artist"}],
            "album": {"title": "Album", "cover": "ab-cd"}
        });
        let track = TrackSummary::from_value(&value).unwrap();
        assert_eq!(track.id, "77646168");
        assert_eq!(track.artist, "Artist");
        assert_eq!(track.album.as_deref(), Some("Album"));
        assert_eq!(track.duration, Some(215));

        assert!(TrackSummary::from_value(&json!({"title": "no id"})).is_none());
    }
}

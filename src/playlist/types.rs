use serde::{Deserialize, Serialize};

/// 待校验的候选曲目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTrack {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    /// MusicBrainz recording ID
    #[serde(default)]
    pub mbid: Option<String>,
}

impl CandidateTrack {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: None,
            mbid: None,
        }
    }

    /// "歌手 - 标题"
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }

    /// 曲库搜索关键词
    pub fn search_query(&self) -> String {
        format!("{} {}", self.artist, self.title)
    }
}

/// 校验后的曲目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedTrack {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub mbid: Option<String>,
    /// 曲库中的曲目ID，可直接作为下载任务的 external_reference
    pub external_id: Option<String>,
    pub available: bool,
}

impl ValidatedTrack {
    pub fn found(candidate: CandidateTrack, external_id: String, album: Option<String>) -> Self {
        Self {
            album: album.or(candidate.album),
            title: candidate.title,
            artist: candidate.artist,
            mbid: candidate.mbid,
            external_id: Some(external_id),
            available: true,
        }
    }

    pub fn not_found(candidate: CandidateTrack) -> Self {
        Self {
            title: candidate.title,
            artist: candidate.artist,
            album: candidate.album,
            mbid: candidate.mbid,
            external_id: None,
            available: false,
        }
    }
}

/// 一个校验批次的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub batch_id: String,
    /// 与输入顺序一致
    pub tracks: Vec<ValidatedTrack>,
    pub found_count: usize,
    pub total: usize,
}

impl ValidationReport {
    pub fn new(batch_id: impl Into<String>, tracks: Vec<ValidatedTrack>) -> Self {
        let found_count = tracks.iter().filter(|t| t.available).count();
        Self {
            batch_id: batch_id.into(),
            total: tracks.len(),
            tracks,
            found_count,
        }
    }
}

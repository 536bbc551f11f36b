use super::error::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 音质档位（从高到低）
///
/// 序列化名称与后端服务的 quality 参数一致
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    /// 高解析无损
    HiResLossless,
    /// 无损
    #[default]
    Lossless,
    /// 高码率有损
    High,
    /// 低码率有损
    Low,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::HiResLossless => "HI_RES_LOSSLESS",
            QualityTier::Lossless => "LOSSLESS",
            QualityTier::High => "HIGH",
            QualityTier::Low => "LOW",
        }
    }

    /// 输出文件扩展名
    pub fn file_extension(&self) -> &'static str {
        match self {
            QualityTier::HiResLossless | QualityTier::Lossless => "flac",
            QualityTier::High | QualityTier::Low => "m4a",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// 排队中
    Queued,
    /// 执行中（重试也保持该状态）
    Active,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("未知的任务状态: {}", other)),
        }
    }
}

/// 提交下载时的任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    /// 后端服务中的曲目标识
    pub external_reference: String,
    #[serde(default)]
    pub quality: QualityTier,
}

impl JobSpec {
    /// 校验必填字段
    pub fn validate(&self) -> Result<(), QueueError> {
        let missing: Vec<&str> = [
            ("title", &self.title),
            ("artist", &self.artist),
            ("external_reference", &self.external_reference),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(QueueError::InvalidJobSpec(format!(
                "缺少必填字段: {}",
                missing.join(", ")
            )))
        }
    }
}

/// 下载任务
///
/// 只由 `DownloadManager` 持有和修改，对外暴露的都是克隆出来的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    /// 任务ID
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub external_reference: String,
    pub quality: QualityTier,
    /// 任务状态
    pub status: JobStatus,
    /// 当前尝试的进度 (0.0 - 1.0)
    pub progress: f64,
    /// 当前尝试已写入的字节数
    pub bytes_written: u64,
    /// 尝试次数，排队时为 0
    pub attempt: u32,
    /// 当前或最近一次尝试使用的端点
    pub endpoint: Option<String>,
    /// 最近一次错误
    pub last_error: Option<String>,
    /// 输出文件路径
    pub output_path: Option<PathBuf>,
    /// 创建时间 (Unix timestamp, 毫秒)
    pub created_at: i64,
    /// 首次开始时间
    pub started_at: Option<i64>,
    /// 进入终态的时间
    pub finished_at: Option<i64>,
}

impl DownloadJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: spec.title.trim().to_string(),
            artist: spec.artist.trim().to_string(),
            album: spec
                .album
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            external_reference: spec.external_reference.trim().to_string(),
            quality: spec.quality,
            status: JobStatus::Queued,
            progress: 0.0,
            bytes_written: 0,
            attempt: 0,
            endpoint: None,
            last_error: None,
            output_path: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            finished_at: None,
        }
    }

    /// "歌手 - 标题"
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }

    /// queued -> active，尝试次数置为 1
    pub fn mark_active(&mut self) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Active;
        self.attempt = 1;
        self.progress = 0.0;
        self.bytes_written = 0;
        self.started_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    /// active 内部的重试：尝试次数 +1，进度清零
    pub fn mark_retrying(&mut self, error: impl Into<String>) -> bool {
        if self.status != JobStatus::Active {
            return false;
        }
        self.attempt += 1;
        self.progress = 0.0;
        self.bytes_written = 0;
        self.last_error = Some(error.into());
        true
    }

    /// 记录本次尝试使用的端点
    pub fn assign_endpoint(&mut self, endpoint: &str) {
        self.endpoint = Some(endpoint.to_string());
    }

    /// 更新进度，只在同一次尝试内单调递增
    ///
    /// 返回更新后的进度；任务不在执行中或尝试已过期时返回 None
    pub fn update_progress(&mut self, attempt: u32, bytes_written: u64, ratio: f64) -> Option<f64> {
        if self.status != JobStatus::Active || self.attempt != attempt {
            return None;
        }
        let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        self.progress = self.progress.max(ratio);
        self.bytes_written = self.bytes_written.max(bytes_written);
        Some(self.progress)
    }

    pub fn mark_completed(&mut self, output_path: Option<PathBuf>) -> bool {
        if self.status != JobStatus::Active {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 1.0;
        self.output_path = output_path;
        self.finished_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.status != JobStatus::Active {
            return false;
        }
        self.status = JobStatus::Failed;
        self.last_error = Some(error.into());
        self.finished_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    /// 任意非终态 -> cancelled
    pub fn mark_cancelled(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec() -> JobSpec {
        JobSpec {
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: Some("  ".to_string()),
            external_reference: "12345".to_string(),
            quality: QualityTier::Lossless,
        }
    }

    #[test]
    fn test_job_creation() {
        let job = DownloadJob::new(spec());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.progress, 0.0);
        assert!(job.album.is_none());
        assert_eq!(job.display_name(), "Artist - Song");
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().validate().is_ok());

        let mut bad = spec();
        bad.title = " ".to_string();
        bad.external_reference = String::new();
        match bad.validate() {
            Err(QueueError::InvalidJobSpec(msg)) => {
                assert!(msg.contains("title"));
                assert!(msg.contains("external_reference"));
                assert!(!msg.contains("artist"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_status_transitions() {
        let mut job = DownloadJob::new(spec());
        assert!(!job.mark_completed(None));
        assert!(job.mark_active());
        assert_eq!(job.attempt, 1);
        assert!(!job.mark_active());

        job.update_progress(1, 100, 0.4);
        assert!(job.mark_retrying("连接失败"));
        assert_eq!(job.attempt, 2);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.status, JobStatus::Active);

        assert!(job.mark_completed(Some(PathBuf::from("/tmp/a.flac"))));
        assert_eq!(job.progress, 1.0);

        // 终态不可再变
        assert!(!job.mark_failed("x"));
        assert!(!job.mark_cancelled());
        assert!(!job.mark_retrying("x"));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_stale_attempt_progress_ignored() {
        let mut job = DownloadJob::new(spec());
        job.mark_active();
        job.mark_retrying("timeout");
        assert_eq!(job.update_progress(1, 10, 0.9), None);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.update_progress(2, 10, 0.3), Some(0.3));
    }

    #[test]
    fn test_cancel_queued() {
        let mut job = DownloadJob::new(spec());
        assert!(job.mark_cancelled());
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!job.mark_active());
    }

    #[test]
    fn test_quality_order_and_names() {
        assert!(QualityTier::HiResLossless < QualityTier::Lossless);
        assert!(QualityTier::High < QualityTier::Low);
        assert_eq!(
            serde_json::to_string(&QualityTier::HiResLossless).unwrap(),
            "\"HI_RES_LOSSLESS\""
        );
        assert_eq!("Cancelled".parse::<JobStatus>(), Ok(JobStatus::Cancelled));
    }

    proptest! {
        #[test]
        fn progress_is_monotonic_within_attempt(ratios in proptest::collection::vec(-1.0f64..2.0, 1..50)) {
            let mut job = DownloadJob::new(spec());
            job.mark_active();
            let mut last = 0.0;
            for r in ratios {
                let p = job.update_progress(1, 0, r).unwrap();
                prop_assert!(p >= last);
                prop_assert!((0.0..=1.0).contains(&p));
                last = p;
            }
        }
    }
}

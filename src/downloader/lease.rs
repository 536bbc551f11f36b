use super::task::{DownloadJob, QualityTier};
use crate::server::events::{EventKind, EventPayload, ProgressBroadcaster, ProgressThrottler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// 传输目标（任务的不可变描述）
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub job_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub external_reference: String,
    pub quality: QualityTier,
}

impl TransferTarget {
    pub fn from_job(job: &DownloadJob) -> Self {
        Self {
            job_id: job.id.clone(),
            title: job.title.clone(),
            artist: job.artist.clone(),
            album: job.album.clone(),
            external_reference: job.external_reference.clone(),
            quality: job.quality,
        }
    }
}

/// 单次尝试的任务租约
///
/// 执行器只能通过租约上报进度。任务离开该次尝试后（重试、结束、强制取消）
/// 租约的上报会被忽略。
pub struct JobLease {
    target: TransferTarget,
    attempt: u32,
    job: Arc<Mutex<DownloadJob>>,
    broadcaster: Arc<ProgressBroadcaster>,
    throttler: parking_lot::Mutex<ProgressThrottler>,
}

impl JobLease {
    pub fn new(
        target: TransferTarget,
        attempt: u32,
        job: Arc<Mutex<DownloadJob>>,
        broadcaster: Arc<ProgressBroadcaster>,
        throttle_interval: Duration,
    ) -> Self {
        Self {
            target,
            attempt,
            job,
            broadcaster,
            throttler: parking_lot::Mutex::new(ProgressThrottler::new(throttle_interval)),
        }
    }

    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    pub fn job_id(&self) -> &str {
        &self.target.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 上报已写入字节数，total 未知时进度按 0 计
    pub async fn report_progress(&self, bytes_written: u64, total: Option<u64>) {
        let ratio = match total {
            Some(total) if total > 0 => bytes_written as f64 / total as f64,
            _ => 0.0,
        };

        let updated = {
            let mut job = self.job.lock().await;
            job.update_progress(self.attempt, bytes_written, ratio)
        };
        let Some(progress) = updated else {
            return;
        };

        if !self.throttler.lock().should_emit(progress) {
            return;
        }

        let mut payload = EventPayload::default()
            .with_progress(progress)
            .with_attempt(self.attempt);
        payload.total = total;
        self.broadcaster
            .publish(&self.target.job_id, EventKind::Progress, payload);
    }
}

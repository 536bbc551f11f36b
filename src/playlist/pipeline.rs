//! 歌单校验流水线
//!
//! 有界并发（与下载并发相互独立）逐条检查候选曲目，事件按批次ID发布：
//! `validating` -> `found` / `not_found` ... -> `complete`（或一次 `error`）

use super::availability::{Availability, AvailabilityChecker, AvailabilityError};
use super::source::CandidateSource;
use super::types::{CandidateTrack, ValidatedTrack, ValidationReport};
use crate::server::events::{EventKind, EventPayload, ProgressBroadcaster};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// 默认校验并发数
pub const DEFAULT_VALIDATION_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// 批次整体失败，部分结果不会上报
    #[error("校验批次终止: {0}")]
    PipelineAbort(String),
}

/// 校验流水线
pub struct ValidationPipeline {
    checker: Arc<dyn AvailabilityChecker>,
    broadcaster: Arc<ProgressBroadcaster>,
    max_concurrency: usize,
}

impl ValidationPipeline {
    pub fn new(
        checker: Arc<dyn AvailabilityChecker>,
        broadcaster: Arc<ProgressBroadcaster>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            checker,
            broadcaster,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// 从候选来源生成曲目后校验
    pub async fn generate_and_run(
        &self,
        source: &dyn CandidateSource,
        batch_id: &str,
        username: &str,
        playlist_type: &str,
    ) -> Result<ValidationReport, PipelineError> {
        info!("生成推荐歌单: user={}, type={}, batch={}", username, playlist_type, batch_id);
        match source.generate(username, playlist_type).await {
            Ok(candidates) => self.run(batch_id, candidates).await,
            Err(e) => Err(self.abort(batch_id, format!("生成歌单失败: {:#}", e))),
        }
    }

    /// 校验一个批次
    pub async fn run(
        &self,
        batch_id: &str,
        candidates: Vec<CandidateTrack>,
    ) -> Result<ValidationReport, PipelineError> {
        let total = candidates.len();
        info!("开始校验歌单: batch={}, 曲目数={}, 并发={}", batch_id, total, self.max_concurrency);

        if total == 0 {
            return Ok(self.complete(batch_id, Vec::new()));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let processed = Arc::new(AtomicUsize::new(0));
        let mut join_set = JoinSet::new();

        for (index, candidate) in candidates.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let processed = Arc::clone(&processed);
            let checker = Arc::clone(&self.checker);
            let broadcaster = Arc::clone(&self.broadcaster);
            let batch_id = batch_id.to_string();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| AvailabilityError::ServiceUnavailable(e.to_string()))?;

                let name = candidate.display_name();
                broadcaster.publish(
                    &batch_id,
                    EventKind::Validating,
                    EventPayload::message(name.clone())
                        .with_progress(ratio(processed.load(Ordering::SeqCst), total))
                        .with_total(total as u64),
                );

                let validated = match checker.check(&candidate).await {
                    Ok(Availability::Found { external_id, album }) => {
                        ValidatedTrack::found(candidate, external_id, album)
                    }
                    Ok(Availability::NotFound) => ValidatedTrack::not_found(candidate),
                    Err(AvailabilityError::Lookup(e)) => {
                        warn!("查询失败，按未找到处理: {} ({})", name, e);
                        ValidatedTrack::not_found(candidate)
                    }
                    Err(e) => return Err(e),
                };

                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                let (kind, message) = match &validated.external_id {
                    Some(id) => (EventKind::Found, format!("{} ({})", name, id)),
                    None => (EventKind::NotFound, name),
                };
                broadcaster.publish(
                    &batch_id,
                    kind,
                    EventPayload::message(message)
                        .with_progress(ratio(done, total))
                        .with_total(total as u64),
                );

                Ok((index, validated))
            });
        }

        let mut results: Vec<Option<ValidatedTrack>> = vec![None; total];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((index, track))) => results[index] = Some(track),
                // 先发布 error 结束 subject，之后仍在收尾的记录发布的事件会被丢弃
                Ok(Err(e)) => {
                    let err = self.abort(batch_id, e.to_string());
                    join_set.abort_all();
                    return Err(err);
                }
                Err(e) => {
                    let err = self.abort(batch_id, format!("校验任务异常退出: {}", e));
                    join_set.abort_all();
                    return Err(err);
                }
            }
        }

        let tracks: Vec<ValidatedTrack> = results.into_iter().flatten().collect();
        if tracks.len() != total {
            return Err(self.abort(batch_id, "部分曲目没有校验结果".to_string()));
        }
        Ok(self.complete(batch_id, tracks))
    }

    fn complete(&self, batch_id: &str, tracks: Vec<ValidatedTrack>) -> ValidationReport {
        let report = ValidationReport::new(batch_id, tracks);
        info!(
            "✓ 歌单校验完成: batch={}, 找到 {}/{}",
            batch_id, report.found_count, report.total
        );

        let mut payload = EventPayload::message(format!(
            "校验完成: 找到 {}/{}",
            report.found_count, report.total
        ))
        .with_progress(1.0)
        .with_total(report.total as u64);
        payload.tracks = Some(report.tracks.clone());
        payload.found_count = Some(report.found_count);
        self.broadcaster
            .publish(batch_id, EventKind::Complete, payload);
        report
    }

    /// 发布一次 error 事件并返回终止错误
    pub fn abort(&self, batch_id: &str, reason: String) -> PipelineError {
        error!("✗ 歌单校验终止: batch={}, 原因: {}", batch_id, reason);
        self.broadcaster.publish(
            batch_id,
            EventKind::Error,
            EventPayload::message(reason.clone()),
        );
        PipelineError::PipelineAbort(reason)
    }
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

//! 下载队列管理器
//!
//! - 任务表：`RwLock<HashMap<id, Arc<JobHandle>>>`，每个任务一把 `Mutex`
//! - 调度状态（等待队列、活跃集合、暂停标记）在同一把 `Mutex` 内
//! - 每个活跃任务一个 tokio 任务（worker），结束后释放槽位并唤醒调度器
//!
//! 任何代码路径都不会同时持有两把锁，也不会持锁进行网络 I/O

use super::endpoint::EndpointRegistry;
use super::engine::{TransferExecutor, TransferOutcome};
use super::error::{QueueError, TransferError};
use super::lease::{JobLease, TransferTarget};
use super::task::{DownloadJob, JobSpec, JobStatus};
use crate::config::{DownloadConfig, EventConfig};
use crate::server::events::{EventKind, EventPayload, ProgressBroadcaster, Subscription};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 取消时在宽限期之外额外等待 worker 收尾的时间
const CANCEL_SETTLE_MARGIN: Duration = Duration::from_secs(1);

/// 队列参数
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// 最大同时下载任务数
    pub max_concurrent: usize,
    /// 单个任务最大尝试次数（包含首次）
    pub max_attempts: u32,
    /// 取消宽限期
    pub cancel_grace: Duration,
    /// 终态任务保留上限，0 表示不限
    pub retention_limit: usize,
    /// 进度事件节流间隔
    pub progress_throttle: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default(), &EventConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(download: &DownloadConfig, events: &EventConfig) -> Self {
        Self {
            max_concurrent: download.max_concurrent_tasks.max(1),
            max_attempts: download.max_attempts.max(1),
            cancel_grace: download.cancel_grace(),
            retention_limit: download.retention_limit,
            progress_throttle: events.progress_throttle(),
        }
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
    pub paused: bool,
}

/// 任务表中的一项
struct JobHandle {
    /// 入队序号，用于稳定排序
    admission: u64,
    job: Arc<Mutex<DownloadJob>>,
    cancel: CancellationToken,
    /// 每次状态变化后广播，取消操作据此等待 worker 收尾
    status_tx: watch::Sender<JobStatus>,
}

impl JobHandle {
    fn new(admission: u64, job: DownloadJob) -> Self {
        let (status_tx, _) = watch::channel(job.status);
        Self {
            admission,
            job: Arc::new(Mutex::new(job)),
            cancel: CancellationToken::new(),
            status_tx,
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// 等待队列（FIFO）
    waiting_queue: VecDeque<String>,
    /// 占用槽位的任务
    active: HashSet<String>,
    paused: bool,
}

/// 下载管理器
#[derive(Clone)]
pub struct DownloadManager {
    jobs: Arc<RwLock<HashMap<String, Arc<JobHandle>>>>,
    scheduler: Arc<Mutex<SchedulerState>>,
    executor: Arc<dyn TransferExecutor>,
    registry: Arc<EndpointRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    settings: QueueSettings,
    /// worker 结束后唤醒调度器
    schedule_notify: Arc<Notify>,
    admission_counter: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// 创建管理器并启动调度监听任务（需要在 tokio 运行时内调用）
    pub fn new(
        executor: Arc<dyn TransferExecutor>,
        registry: Arc<EndpointRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
        settings: QueueSettings,
    ) -> Self {
        info!(
            "创建下载管理器: 最大并发={}, 最大尝试次数={}, 端点数={}",
            settings.max_concurrent,
            settings.max_attempts,
            registry.len()
        );

        let manager = Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            scheduler: Arc::new(Mutex::new(SchedulerState::default())),
            executor,
            registry,
            broadcaster,
            settings,
            schedule_notify: Arc::new(Notify::new()),
            admission_counter: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        };
        manager.start_schedule_monitor();
        manager
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// 提交下载任务
    pub async fn enqueue(&self, spec: JobSpec) -> Result<String, QueueError> {
        spec.validate()?;

        let job = DownloadJob::new(spec);
        let job_id = job.id.clone();
        let name = job.display_name();
        let admission = self.admission_counter.fetch_add(1, Ordering::Relaxed);

        self.jobs
            .write()
            .await
            .insert(job_id.clone(), Arc::new(JobHandle::new(admission, job)));

        // queued 事件必须先于 active
        self.broadcaster.publish(
            &job_id,
            EventKind::Queued,
            EventPayload::message(format!("等待下载: {}", name)),
        );
        self.scheduler
            .lock()
            .await
            .waiting_queue
            .push_back(job_id.clone());
        info!("任务已加入等待队列: {} ({})", name, job_id);

        self.try_schedule().await;
        Ok(job_id)
    }

    /// 批量提交，每个任务独立校验，结果顺序与输入一致
    pub async fn enqueue_batch(&self, specs: Vec<JobSpec>) -> Vec<Result<String, QueueError>> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            results.push(self.enqueue(spec).await);
        }
        results
    }

    /// 取消任务，返回取消后的状态
    ///
    /// - 排队中：立即取消，不会再被调度
    /// - 执行中：触发取消令牌，等待 worker 收尾（最长为宽限期）
    /// - 已结束：不做任何事
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, QueueError> {
        let handle = self
            .handle(job_id)
            .await
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let (status, dequeued) = {
            let mut job = handle.job.lock().await;
            let dequeued = job.status == JobStatus::Queued && job.mark_cancelled();
            (job.status, dequeued)
        };

        match status {
            JobStatus::Cancelled if dequeued => {
                handle.cancel.cancel();
                handle.status_tx.send_replace(JobStatus::Cancelled);
                self.scheduler
                    .lock()
                    .await
                    .waiting_queue
                    .retain(|id| id != job_id);

                info!("已取消排队任务: {}", job_id);
                self.broadcaster.publish(
                    job_id,
                    EventKind::Cancelled,
                    EventPayload::message("下载已取消"),
                );
                self.evict_retained().await;
                Ok(JobStatus::Cancelled)
            }
            JobStatus::Active => {
                info!("🔄 取消执行中的任务: {}", job_id);
                let mut status_rx = handle.status_tx.subscribe();
                handle.cancel.cancel();

                let wait = self.settings.cancel_grace + CANCEL_SETTLE_MARGIN;
                let settled =
                    match tokio::time::timeout(wait, status_rx.wait_for(|s| s.is_terminal())).await
                    {
                        Ok(Ok(status)) => Some(*status),
                        _ => None,
                    };
                match settled {
                    Some(status) => Ok(status),
                    None => {
                        warn!("⚠️ 等待任务收尾超时: {}", job_id);
                        Ok(handle.job.lock().await.status)
                    }
                }
            }
            other => {
                debug!("任务已结束，忽略取消: {} ({})", job_id, other.as_str());
                Ok(other)
            }
        }
    }

    /// 暂停调度，执行中的任务不受影响
    pub async fn pause_all(&self) {
        self.scheduler.lock().await.paused = true;
        info!("下载队列已暂停");
    }

    /// 恢复调度并立即尝试启动等待中的任务
    pub async fn resume_all(&self) {
        self.scheduler.lock().await.paused = false;
        info!("下载队列已恢复");
        self.try_schedule().await;
    }

    pub async fn is_paused(&self) -> bool {
        self.scheduler.lock().await.paused
    }

    /// 任务快照列表，按创建时间排序
    pub async fn list_jobs(&self, filter: Option<JobStatus>) -> Vec<DownloadJob> {
        let mut jobs = self.snapshots().await;
        if let Some(status) = filter {
            jobs.retain(|job| job.status == status);
        }
        jobs
    }

    pub async fn get_job(&self, job_id: &str) -> Option<DownloadJob> {
        let handle = self.handle(job_id).await?;
        let job = handle.job.lock().await;
        Some(job.clone())
    }

    /// 移除已结束的任务
    pub async fn remove_job(&self, job_id: &str) -> Result<DownloadJob, QueueError> {
        let handle = self
            .handle(job_id)
            .await
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let snapshot = handle.job.lock().await.clone();
        if !snapshot.status.is_terminal() {
            return Err(QueueError::JobActive(job_id.to_string()));
        }

        self.jobs.write().await.remove(job_id);
        info!("已移除任务: {}", job_id);
        Ok(snapshot)
    }

    /// 清除已结束的任务，`None` 表示清除所有终态任务
    pub async fn clear_finished(&self, status: Option<JobStatus>) -> usize {
        let to_remove: Vec<String> = self
            .snapshots()
            .await
            .into_iter()
            .filter(|job| job.status.is_terminal())
            .filter(|job| status.map_or(true, |s| job.status == s))
            .map(|job| job.id)
            .collect();

        if to_remove.is_empty() {
            return 0;
        }

        let mut jobs = self.jobs.write().await;
        let removed = to_remove
            .iter()
            .filter(|id| jobs.remove(id.as_str()).is_some())
            .count();
        info!("清除了 {} 个已结束的任务", removed);
        removed
    }

    pub async fn stats(&self) -> QueueStats {
        let paused = self.is_paused().await;
        let mut stats = QueueStats {
            max_concurrent: self.settings.max_concurrent,
            paused,
            ..Default::default()
        };
        for job in self.snapshots().await {
            stats.total += 1;
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// 订阅任务的进度事件
    ///
    /// 已结束的任务直接返回结束的订阅，事件主题被清理后也不会挂起
    pub async fn subscribe(&self, job_id: &str) -> Result<Subscription, QueueError> {
        let handle = self
            .handle(job_id)
            .await
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let status = handle.job.lock().await.status;
        if status.is_terminal() {
            debug!("任务已结束，返回结束的订阅: {} ({})", job_id, status.as_str());
            return Ok(self.broadcaster.closed(job_id));
        }
        Ok(self.broadcaster.subscribe(job_id))
    }

    /// 停止调度并取消所有未结束的任务
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.lock().await.paused = true;
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        for handle in handles {
            handle.cancel.cancel();
        }
        info!("下载管理器已停止");
    }

    /// 在槽位允许时从等待队列头部启动任务
    pub async fn try_schedule(&self) {
        loop {
            // 在调度锁内预占槽位
            let job_id = {
                let mut state = self.scheduler.lock().await;
                if state.paused || state.active.len() >= self.settings.max_concurrent {
                    break;
                }
                match state.waiting_queue.pop_front() {
                    Some(id) => {
                        state.active.insert(id.clone());
                        id
                    }
                    None => break,
                }
            };

            let Some(handle) = self.handle(&job_id).await else {
                warn!("等待队列中的任务 {} 不存在，跳过", job_id);
                self.release_slot(&job_id).await;
                continue;
            };

            // 排队期间可能已被取消
            let activated = handle.job.lock().await.mark_active();
            if !activated {
                debug!("任务 {} 已不在排队状态，跳过", job_id);
                self.release_slot(&job_id).await;
                continue;
            }
            handle.status_tx.send_replace(JobStatus::Active);

            info!("⚡ 启动下载任务: {}", job_id);
            tokio::spawn(self.clone().run_job(job_id, handle));
        }
    }

    /// 调度监听：worker 结束时被唤醒
    fn start_schedule_monitor(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = manager.schedule_notify.notified() => manager.try_schedule().await,
                }
            }
            debug!("调度监听已退出");
        });
    }

    /// 单个任务的 worker：循环尝试直到进入终态
    async fn run_job(self, job_id: String, handle: Arc<JobHandle>) {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_endpoint: Option<String> = None;

        let final_status = loop {
            if handle.cancel.is_cancelled() {
                break self.finish_cancelled(&job_id, &handle).await;
            }

            // 所有端点都试过后只排除上一次使用的端点，使尝试轮转
            if !self.registry.is_empty() && tried.len() >= self.registry.len() {
                tried = last_endpoint.iter().cloned().collect();
            }

            let result = match self.registry.next_candidate(&tried) {
                Some(endpoint) => {
                    let result = self.attempt(&job_id, &handle, &endpoint).await;
                    if let Err(e) = &result {
                        if e.is_connection_level() {
                            self.registry.mark_suspected_down(&endpoint);
                        }
                    }
                    tried.insert(endpoint.clone());
                    last_endpoint = Some(endpoint);
                    result
                }
                None => Err(TransferError::EndpointExhausted(
                    "没有配置任何曲库端点".to_string(),
                )),
            };

            match result {
                Ok(outcome) => {
                    if let Some(endpoint) = &last_endpoint {
                        self.registry.mark_success(endpoint);
                    }
                    let applied = handle
                        .job
                        .lock()
                        .await
                        .mark_completed(Some(outcome.output_path.clone()));
                    if !applied {
                        break handle.job.lock().await.status;
                    }
                    handle.status_tx.send_replace(JobStatus::Completed);

                    let message = if outcome.skipped {
                        format!("文件已存在: {}", outcome.output_path.display())
                    } else {
                        format!("下载完成: {}", outcome.output_path.display())
                    };
                    info!("✓ {} ({})", message, job_id);
                    let mut payload = EventPayload::message(message).with_progress(1.0);
                    payload.total = Some(outcome.bytes_written);
                    self.broadcaster
                        .publish(&job_id, EventKind::Completed, payload);
                    break JobStatus::Completed;
                }
                Err(_) if handle.cancel.is_cancelled() => {
                    break self.finish_cancelled(&job_id, &handle).await;
                }
                Err(TransferError::Cancelled) => {
                    break self.finish_cancelled(&job_id, &handle).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    let attempt = handle.job.lock().await.attempt;

                    if e.is_retryable() && attempt < self.settings.max_attempts {
                        let retried = handle.job.lock().await.mark_retrying(message.clone());
                        if !retried {
                            break handle.job.lock().await.status;
                        }
                        warn!(
                            "🔄 任务 {} 第 {} 次尝试失败，准备重试: {}",
                            job_id, attempt, message
                        );
                        self.broadcaster.publish(
                            &job_id,
                            EventKind::Retrying,
                            EventPayload::message(message).with_attempt(attempt + 1),
                        );
                        continue;
                    }

                    if !handle.job.lock().await.mark_failed(message.clone()) {
                        break handle.job.lock().await.status;
                    }
                    handle.status_tx.send_replace(JobStatus::Failed);
                    error!("✗ 任务 {} 下载失败 (尝试 {} 次): {}", job_id, attempt, message);
                    self.broadcaster.publish(
                        &job_id,
                        EventKind::Failed,
                        EventPayload::message(message).with_attempt(attempt),
                    );
                    break JobStatus::Failed;
                }
            }
        };

        debug!("worker 退出: {} ({})", job_id, final_status.as_str());
        self.release_slot(&job_id).await;
        self.evict_retained().await;
        self.schedule_notify.notify_one();
    }

    /// 执行一次尝试；取消后超过宽限期仍未返回时丢弃执行器
    async fn attempt(
        &self,
        job_id: &str,
        handle: &JobHandle,
        endpoint: &str,
    ) -> Result<TransferOutcome, TransferError> {
        let (attempt, target, name) = {
            let mut job = handle.job.lock().await;
            if job.status != JobStatus::Active {
                return Err(TransferError::Cancelled);
            }
            job.assign_endpoint(endpoint);
            (job.attempt, TransferTarget::from_job(&job), job.display_name())
        };

        info!("开始下载: {} (尝试 {}, 端点 {})", name, attempt, endpoint);
        self.broadcaster.publish(
            job_id,
            EventKind::Active,
            EventPayload::message(format!("正在下载: {}", name))
                .with_attempt(attempt)
                .with_endpoint(endpoint),
        );

        let lease = JobLease::new(
            target,
            attempt,
            Arc::clone(&handle.job),
            Arc::clone(&self.broadcaster),
            self.settings.progress_throttle,
        );

        let grace = self.settings.cancel_grace;
        let forced = async {
            handle.cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = self.executor.execute(&lease, endpoint, &handle.cancel) => result,
            _ = forced => {
                warn!("⚠️ 任务 {} 在宽限期内未响应取消，强制结束", job_id);
                Err(TransferError::Cancelled)
            }
        }
    }

    async fn finish_cancelled(&self, job_id: &str, handle: &JobHandle) -> JobStatus {
        let applied = handle.job.lock().await.mark_cancelled();
        if !applied {
            return handle.job.lock().await.status;
        }
        handle.status_tx.send_replace(JobStatus::Cancelled);
        info!("任务已取消: {}", job_id);
        self.broadcaster.publish(
            job_id,
            EventKind::Cancelled,
            EventPayload::message("下载已取消"),
        );
        JobStatus::Cancelled
    }

    async fn release_slot(&self, job_id: &str) {
        self.scheduler.lock().await.active.remove(job_id);
    }

    /// 终态任务超过保留上限时移除最早结束的任务
    async fn evict_retained(&self) {
        let limit = self.settings.retention_limit;
        if limit == 0 {
            return;
        }

        let mut finished: Vec<(i64, u64, String)> = self
            .ordered_snapshots()
            .await
            .into_iter()
            .filter(|(_, job)| job.status.is_terminal())
            .map(|(admission, job)| (job.finished_at.unwrap_or(job.created_at), admission, job.id))
            .collect();
        if finished.len() <= limit {
            return;
        }

        finished.sort();
        let excess = finished.len() - limit;
        let mut jobs = self.jobs.write().await;
        for (_, _, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
        debug!("超出保留上限，移除了 {} 个已结束的任务", excess);
    }

    async fn handle(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// 所有任务的快照，按入队顺序排列
    async fn snapshots(&self) -> Vec<DownloadJob> {
        self.ordered_snapshots()
            .await
            .into_iter()
            .map(|(_, job)| job)
            .collect()
    }

    /// 先复制句柄再逐个加锁，不会同时持有任务表锁和任务锁
    async fn ordered_snapshots(&self) -> Vec<(u64, DownloadJob)> {
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            let job = handle.job.lock().await.clone();
            jobs.push((handle.admission, job));
        }
        jobs.sort_by_key(|(admission, _)| *admission);
        jobs
    }
}

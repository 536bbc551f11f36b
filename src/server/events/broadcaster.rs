//! 进度事件广播器
//!
//! 按 subject_id 扇出进度事件：
//! - 每个订阅一个有界缓冲区，发布端使用 `try_send`，慢订阅者不会阻塞发布
//! - 缓冲区溢出时拆除该订阅，订阅端收到一条 `Overflow` 后结束
//! - 不回放历史，只投递订阅之后发布的事件
//! - 每个 subject 只会投递一次终态事件，之后的发布被丢弃

use super::types::{EventKind, EventPayload, ProgressEvent, StreamMessage};
use dashmap::DashMap;
use futures::Stream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// 默认订阅缓冲区大小
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;
/// 默认心跳间隔
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug)]
struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct SubjectChannel {
    /// 最近一次分配的序号
    last_sequence: u64,
    subscribers: Vec<SubscriberSlot>,
    terminated_at: Option<Instant>,
}

/// 进度事件广播器
#[derive(Debug)]
pub struct ProgressBroadcaster {
    subjects: DashMap<String, SubjectChannel>,
    subscriber_counter: AtomicU64,
    buffer_size: usize,
    ping_interval: Duration,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_PING_INTERVAL)
    }
}

impl ProgressBroadcaster {
    pub fn new(buffer_size: usize, ping_interval: Duration) -> Self {
        Self {
            subjects: DashMap::new(),
            subscriber_counter: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
            ping_interval,
        }
    }

    /// 发布事件
    ///
    /// 序号分配与扇出在同一个 subject 锁内完成，保证每个订阅看到的序号连续。
    /// subject 已经结束时返回 None。
    pub fn publish(
        &self,
        subject_id: &str,
        kind: EventKind,
        payload: EventPayload,
    ) -> Option<ProgressEvent> {
        let mut channel = self.subjects.entry(subject_id.to_string()).or_default();

        if channel.terminated_at.is_some() {
            debug!("subject 已结束，丢弃事件: subject={}, type={}", subject_id, kind.as_str());
            return None;
        }

        channel.last_sequence += 1;
        let event = ProgressEvent {
            kind,
            subject_id: subject_id.to_string(),
            sequence_number: channel.last_sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        };

        channel.subscribers.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                slot.overflowed.store(true, Ordering::SeqCst);
                warn!(
                    "订阅者缓冲区溢出，拆除订阅: subject={}, subscriber={}",
                    subject_id, slot.id
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("订阅者已断开: subject={}, subscriber={}", subject_id, slot.id);
                false
            }
        });

        if kind.is_terminal() {
            channel.terminated_at = Some(Instant::now());
            // 丢弃发送端，订阅者读完缓冲区后自然结束
            channel.subscribers.clear();
        }

        Some(event)
    }

    /// 订阅某个 subject
    ///
    /// 已结束的 subject 返回一个立即结束的订阅
    pub fn subscribe(&self, subject_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let overflowed = Arc::new(AtomicBool::new(false));

        {
            let mut channel = self.subjects.entry(subject_id.to_string()).or_default();
            if channel.terminated_at.is_none() {
                let id = self.subscriber_counter.fetch_add(1, Ordering::Relaxed);
                debug!("新增订阅: subject={}, subscriber={}", subject_id, id);
                channel.subscribers.push(SubscriberSlot {
                    id,
                    tx,
                    overflowed: Arc::clone(&overflowed),
                });
            }
        }

        Subscription {
            subject_id: subject_id.to_string(),
            rx,
            overflowed,
            ping_interval: self.ping_interval,
            finished: false,
        }
    }

    /// 一个立即结束的订阅，不会登记到 subject
    pub fn closed(&self, subject_id: &str) -> Subscription {
        let (_, rx) = mpsc::channel(1);
        Subscription {
            subject_id: subject_id.to_string(),
            rx,
            overflowed: Arc::new(AtomicBool::new(false)),
            ping_interval: self.ping_interval,
            finished: false,
        }
    }

    pub fn is_terminated(&self, subject_id: &str) -> bool {
        self.subjects
            .get(subject_id)
            .is_some_and(|c| c.terminated_at.is_some())
    }

    /// 当前仍连接的订阅数
    pub fn subscriber_count(&self, subject_id: &str) -> usize {
        self.subjects
            .get(subject_id)
            .map(|c| c.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// 清理过期的 subject
    ///
    /// - 结束超过 `max_age` 的 subject
    /// - 从未发布过事件且已无订阅者的 subject
    pub fn prune_terminated(&self, max_age: Duration) -> usize {
        let before = self.subjects.len();
        self.subjects.retain(|_, channel| match channel.terminated_at {
            Some(at) => at.elapsed() < max_age,
            None => {
                channel.subscribers.retain(|s| !s.tx.is_closed());
                channel.last_sequence > 0 || !channel.subscribers.is_empty()
            }
        });
        before.saturating_sub(self.subjects.len())
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }
}

/// 单个订阅的事件流
#[derive(Debug)]
pub struct Subscription {
    subject_id: String,
    rx: mpsc::Receiver<ProgressEvent>,
    overflowed: Arc<AtomicBool>,
    ping_interval: Duration,
    finished: bool,
}

impl Subscription {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// 读取下一条消息，None 表示流结束
    ///
    /// 空闲超过心跳间隔时返回 `Ping`
    pub async fn next(&mut self) -> Option<StreamMessage> {
        if self.finished {
            return None;
        }

        match tokio::time::timeout(self.ping_interval, self.rx.recv()).await {
            Err(_) => Some(StreamMessage::Ping),
            Ok(Some(event)) => {
                if event.kind.is_terminal() {
                    self.finished = true;
                }
                Some(StreamMessage::Event(event))
            }
            Ok(None) => {
                self.finished = true;
                self.overflowed
                    .load(Ordering::SeqCst)
                    .then_some(StreamMessage::Overflow)
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamMessage> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let message = sub.next().await?;
            Some((message, sub))
        })
    }
}

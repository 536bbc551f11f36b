//! 进度事件类型定义
//!
//! 下载任务和歌单校验批次共用同一套事件结构，按 subject_id 区分

use crate::playlist::ValidatedTrack;
use serde::{Deserialize, Serialize};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // ---- 下载任务 ----
    /// 任务入队
    Queued,
    /// 开始一次尝试
    Active,
    /// 传输进度
    Progress,
    /// 可恢复失败，准备重试
    Retrying,
    /// 任务完成
    Completed,
    /// 任务失败
    Failed,
    /// 任务取消
    Cancelled,

    // ---- 歌单校验 ----
    /// 正在校验某条记录
    Validating,
    /// 记录可用
    Found,
    /// 记录不可用
    NotFound,
    /// 批次完成
    Complete,
    /// 批次整体失败
    Error,
}

impl EventKind {
    /// 终态事件，投递后订阅流结束
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Completed
                | EventKind::Failed
                | EventKind::Cancelled
                | EventKind::Complete
                | EventKind::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Queued => "queued",
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Retrying => "retrying",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Cancelled => "cancelled",
            EventKind::Validating => "validating",
            EventKind::Found => "found",
            EventKind::NotFound => "not_found",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
        }
    }
}

/// 事件负载，未设置的字段不会序列化
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 0.0 - 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<ValidatedTrack>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl EventPayload {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// 进度事件（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// 任务ID 或 校验批次ID
    pub subject_id: String,
    /// 同一 subject 内严格递增且连续
    #[serde(rename = "sequence")]
    pub sequence_number: u64,
    /// Unix timestamp（毫秒）
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// 订阅流中的一条消息
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(ProgressEvent),
    /// 空闲心跳，不带负载
    Ping,
    /// 订阅缓冲区溢出，订阅已被拆除，需要重新订阅
    Overflow,
}

impl StreamMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamMessage::Event(event) => event.kind.as_str(),
            StreamMessage::Ping => "ping",
            StreamMessage::Overflow => "overflow",
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            StreamMessage::Event(event) => serde_json::to_string(event).unwrap_or_else(|e| {
                tracing::error!("序列化进度事件失败: {}", e);
                String::from(r#"{"type":"error","message":"序列化事件失败"}"#)
            }),
            StreamMessage::Ping => String::from(r#"{"type":"ping"}"#),
            StreamMessage::Overflow => serde_json::json!({
                "type": "overflow",
                "message": "订阅缓冲区溢出，请重新订阅",
            })
            .to_string(),
        }
    }
}

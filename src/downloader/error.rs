//! 下载队列错误类型

use thiserror::Error;

/// 队列操作错误（同步返回给调用方）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// 调用方提交的任务描述不完整，不会重试
    #[error("无效的任务参数: {0}")]
    InvalidJobSpec(String),

    #[error("任务不存在: {0}")]
    JobNotFound(String),

    /// 任务尚未结束，不允许移除
    #[error("任务仍在进行中: {0}")]
    JobActive(String),
}

/// 单次传输尝试的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// 连接级失败，会把端点标记为疑似故障
    #[error("连接失败: {0}")]
    Connection(String),

    #[error("请求超时: {0}")]
    Timeout(String),

    /// 可重试状态码、完整性校验失败等
    #[error("可恢复的传输错误: {0}")]
    Recoverable(String),

    /// 资源不存在、鉴权失败等，不再重试
    #[error("不可恢复的传输错误: {0}")]
    Fatal(String),

    /// 一次尝试内所有候选端点都失败，按一次可恢复错误计
    #[error("所有候选端点均不可用: {0}")]
    EndpointExhausted(String),

    #[error("传输已取消")]
    Cancelled,
}

impl TransferError {
    /// 是否计入重试预算
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Connection(_)
                | TransferError::Timeout(_)
                | TransferError::Recoverable(_)
                | TransferError::EndpointExhausted(_)
        )
    }

    pub fn is_connection_level(&self) -> bool {
        matches!(self, TransferError::Connection(_))
    }

    /// 根据 HTTP 状态码分类
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let msg = format!("{} 返回 HTTP {}", context, status.as_u16());
        match status.as_u16() {
            401 | 403 | 404 | 410 => TransferError::Fatal(msg),
            408 | 425 | 429 => TransferError::Recoverable(msg),
            s if s >= 500 => TransferError::Recoverable(msg),
            _ => TransferError::Fatal(msg),
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransferError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            TransferError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            TransferError::from_status(status, "请求")
        } else if e.is_decode() || e.is_body() {
            TransferError::Recoverable(e.to_string())
        } else {
            TransferError::Connection(e.to_string())
        }
    }
}

//! 传输执行器
//!
//! 一次尝试 = 解析播放地址 -> 拉取字节流 -> 写入目标 -> 完整性校验。
//! 取消令牌在每次写入分片之前检查。

use super::error::TransferError;
use super::lease::{JobLease, TransferTarget};
use super::task::QualityTier;
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 解析得到的可下载地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocation {
    pub url: String,
    /// 预期字节数（已知时用于完整性校验）
    pub expected_size: Option<u64>,
    /// 预期 SHA-256（十六进制）
    pub sha256: Option<String>,
}

impl StreamLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected_size: None,
            sha256: None,
        }
    }
}

/// 把外部曲目标识解析为可下载地址
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        endpoint: &str,
        external_reference: &str,
        quality: QualityTier,
    ) -> Result<StreamLocation, TransferError>;
}

/// 传输目标的写入端
#[async_trait]
pub trait TransferSink: Send + Sync {
    /// 目标已存在时返回其路径，本次尝试直接完成
    async fn existing(&self, target: &TransferTarget) -> Option<PathBuf>;

    async fn open(&self, target: &TransferTarget) -> Result<Box<dyn ChunkWriter>, TransferError>;
}

/// 顺序写入的分片写入器
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write_chunk(&mut self, offset: u64, bytes: &[u8]) -> Result<(), TransferError>;

    /// 写入完成，返回最终路径
    async fn finish(self: Box<Self>) -> Result<PathBuf, TransferError>;

    /// 放弃已写入的内容
    async fn discard(self: Box<Self>);
}

/// 一次成功尝试的结果
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub output_path: PathBuf,
    pub bytes_written: u64,
    pub sha256: Option<String>,
    /// 目标已存在，未实际传输
    pub skipped: bool,
}

/// 执行一次传输尝试
///
/// 实现者只能在 `execute` 期间通过 `lease` 修改任务，返回后不得保留
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(
        &self,
        lease: &JobLease,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError>;
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}

/// 基于 HTTP 的下载引擎
pub struct DownloadEngine {
    client: reqwest::Client,
    resolver: Arc<dyn Resolver>,
    sink: Arc<dyn TransferSink>,
    resolve_timeout: Duration,
    transfer_timeout: Duration,
}

impl DownloadEngine {
    pub fn new(
        client: reqwest::Client,
        resolver: Arc<dyn Resolver>,
        sink: Arc<dyn TransferSink>,
        resolve_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            client,
            resolver,
            sink,
            resolve_timeout,
            transfer_timeout,
        }
    }

    async fn transfer(
        &self,
        lease: &JobLease,
        location: &StreamLocation,
        mut writer: Box<dyn ChunkWriter>,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        match self
            .stream_into(lease, location, writer.as_mut(), cancel)
            .await
        {
            Ok((bytes_written, digest)) => {
                let output_path = writer.finish().await?;
                Ok(TransferOutcome {
                    output_path,
                    bytes_written,
                    sha256: Some(digest),
                    skipped: false,
                })
            }
            Err(e) => {
                writer.discard().await;
                Err(e)
            }
        }
    }

    /// 拉取字节流写入 writer，返回 (字节数, sha256)
    async fn stream_into(
        &self,
        lease: &JobLease,
        location: &StreamLocation,
        writer: &mut dyn ChunkWriter,
        cancel: &CancellationToken,
    ) -> Result<(u64, String), TransferError> {
        // CDN 的连接失败与后端端点无关，不触发端点降级
        let cdn_error = |e: reqwest::Error| match TransferError::from(e) {
            TransferError::Connection(msg) => TransferError::Recoverable(msg),
            other => other,
        };

        let response = self
            .client
            .get(&location.url)
            .send()
            .await
            .map_err(cdn_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::from_status(status, "下载"));
        }

        let total = location.expected_size.or(response.content_length());
        debug!(
            "开始传输: job={}, attempt={}, total={:?}",
            lease.job_id(),
            lease.attempt(),
            total
        );

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(cdn_error)?;
            if chunk.is_empty() {
                continue;
            }
            checkpoint(cancel)?;
            writer.write_chunk(written, &chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
            lease.report_progress(written, total).await;
        }

        let digest = hex::encode(hasher.finalize());
        verify_integrity(written, total, location.sha256.as_deref(), &digest)?;
        Ok((written, digest))
    }
}

/// 完整性校验：非空、大小一致、摘要一致
fn verify_integrity(
    written: u64,
    expected_size: Option<u64>,
    expected_sha256: Option<&str>,
    digest: &str,
) -> Result<(), TransferError> {
    if written == 0 {
        return Err(TransferError::Recoverable("收到的数据为空".to_string()));
    }
    if let Some(expected) = expected_size {
        if expected != written {
            return Err(TransferError::Recoverable(format!(
                "大小不匹配: 期望 {} 字节, 实际 {} 字节",
                expected, written
            )));
        }
    }
    if let Some(expected) = expected_sha256 {
        if !expected.eq_ignore_ascii_case(digest) {
            return Err(TransferError::Recoverable(format!(
                "SHA-256 不匹配: 期望 {}, 实际 {}",
                expected, digest
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl TransferExecutor for DownloadEngine {
    async fn execute(
        &self,
        lease: &JobLease,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        checkpoint(cancel)?;
        let target = lease.target();

        if let Some(path) = self.sink.existing(target).await {
            info!("⚠️ 文件已存在，跳过下载: {:?}", path);
            return Ok(TransferOutcome {
                output_path: path,
                bytes_written: 0,
                sha256: None,
                skipped: true,
            });
        }

        let location = tokio::time::timeout(
            self.resolve_timeout,
            self.resolver
                .resolve(endpoint, &target.external_reference, target.quality),
        )
        .await
        .map_err(|_| {
            TransferError::Timeout(format!("解析播放地址超时 ({}s)", self.resolve_timeout.as_secs()))
        })??;

        debug!("播放地址: {}...", location.url.chars().take(60).collect::<String>());
        checkpoint(cancel)?;

        let writer = self.sink.open(target).await?;
        let result = tokio::time::timeout(
            self.transfer_timeout,
            self.transfer(lease, &location, writer, cancel),
        )
        .await
        .map_err(|_| {
            TransferError::Timeout(format!("传输超时 ({}s)", self.transfer_timeout.as_secs()))
        })?;

        if let Err(e) = &result {
            warn!("传输失败: job={}, attempt={}, 错误={}", lease.job_id(), lease.attempt(), e);
        }
        result
    }
}

//! 本地文件写入端
//!
//! 先写入 `.part` 临时文件，完成后重命名为最终文件名；放弃或中途丢弃时删除临时文件

use super::engine::{ChunkWriter, TransferSink};
use super::error::TransferError;
use super::lease::TransferTarget;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// 文件名最大长度（字符）
const MAX_FILENAME_CHARS: usize = 200;
const PART_SUFFIX: &str = ".part";

/// 把文件系统不允许的字符替换为下划线，并截断长度
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    let truncated: String = cleaned.chars().take(MAX_FILENAME_CHARS).collect();
    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

/// 写入下载目录的文件写入端
#[derive(Debug, Clone)]
pub struct FileSink {
    download_dir: PathBuf,
}

impl FileSink {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    /// 目标文件的最终路径: "{歌手} - {标题}.{扩展名}"
    pub fn final_path(&self, target: &TransferTarget) -> PathBuf {
        let stem = sanitize_filename(&format!("{} - {}", target.artist, target.title));
        self.download_dir
            .join(format!("{}.{}", stem, target.quality.file_extension()))
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> TransferError {
    TransferError::Fatal(format!("{}失败: {:?}: {}", action, path, e))
}

#[async_trait]
impl TransferSink for FileSink {
    async fn existing(&self, target: &TransferTarget) -> Option<PathBuf> {
        let path = self.final_path(target);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    async fn open(&self, target: &TransferTarget) -> Result<Box<dyn ChunkWriter>, TransferError> {
        fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| io_error("创建下载目录", &self.download_dir, e))?;

        let final_path = self.final_path(target);
        let part_path = part_path(&final_path);
        let file = File::create(&part_path)
            .await
            .map_err(|e| io_error("创建临时文件", &part_path, e))?;

        debug!("打开临时文件: {:?}", part_path);
        Ok(Box::new(FileChunkWriter {
            file: Some(file),
            part_path,
            final_path,
            written: 0,
            finished: false,
        }))
    }
}

struct FileChunkWriter {
    file: Option<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    finished: bool,
}

#[async_trait]
impl ChunkWriter for FileChunkWriter {
    async fn write_chunk(&mut self, offset: u64, bytes: &[u8]) -> Result<(), TransferError> {
        if offset != self.written {
            return Err(TransferError::Recoverable(format!(
                "写入偏移不连续: 期望 {}, 实际 {}",
                self.written, offset
            )));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::Fatal("临时文件已关闭".to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_error("写入文件", &self.part_path, e))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<PathBuf, TransferError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| io_error("刷新文件", &self.part_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| io_error("同步文件", &self.part_path, e))?;
        }
        fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|e| io_error("重命名文件", &self.final_path, e))?;
        self.finished = true;
        Ok(self.final_path.clone())
    }

    async fn discard(mut self: Box<Self>) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.part_path).await {
            warn!("删除临时文件失败: {:?}: {}", self.part_path, e);
        }
        self.finished = true;
    }
}

impl Drop for FileChunkWriter {
    fn drop(&mut self) {
        // 传输被超时或强制取消中断时清理残留
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

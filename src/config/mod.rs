// 配置管理模块

use crate::downloader::QualityTier;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 覆盖下载目录的环境变量
pub const MUSIC_DIR_ENV: &str = "MUSIC_DIR";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载队列配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 后端端点配置
    #[serde(default)]
    pub endpoints: EndpointConfig,
    /// 歌单校验配置
    #[serde(default)]
    pub validation: ValidationConfig,
    /// 进度事件配置
    #[serde(default)]
    pub events: EventConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 下载队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 最大同时下载任务数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 单个任务最大尝试次数（包含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 取消宽限期（秒），超时后强制结束
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// 解析播放地址超时（秒）
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    /// 数据传输超时（秒）
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// 终态任务保留上限（0 表示不自动清理）
    #[serde(default)]
    pub retention_limit: usize,
    /// 默认音质
    #[serde(default)]
    pub default_quality: QualityTier,
}

fn default_download_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("music")
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_resolve_timeout_secs() -> u64 {
    60
}

fn default_transfer_timeout_secs() -> u64 {
    600
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_attempts: default_max_attempts(),
            cancel_grace_secs: default_cancel_grace_secs(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            retention_limit: 0,
            default_quality: QualityTier::default(),
        }
    }
}

impl DownloadConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// 确保下载目录存在（不存在则自动创建）
    pub async fn ensure_download_dir_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| format!("创建下载目录失败: {:?}", self.download_dir))?;
        tracing::info!("下载目录已准备就绪: {:?}", self.download_dir);
        Ok(())
    }
}

/// 单个后端端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEntry {
    /// 基础地址，例如 https://api.example.org
    pub url: String,
    /// 优先级，数值越小越先尝试；缺省时按配置顺序
    #[serde(default)]
    pub priority: Option<u32>,
}

/// 后端端点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 候选端点列表
    #[serde(default)]
    pub candidates: Vec<EndpointEntry>,
    /// 疑似故障标记的冷却时间（秒）
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// 请求使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    concat!("troi-downloader-rust/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            cooldown_secs: default_cooldown_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl EndpointConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// 按配置顺序补全优先级
    pub fn prioritized(&self) -> Vec<(String, u32)> {
        self.candidates
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let url = entry.url.trim_end_matches('/').to_string();
                (url, entry.priority.unwrap_or(idx as u32))
            })
            .collect()
    }
}

/// 歌单校验配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// 校验并发上限（与下载并发相互独立）
    #[serde(default = "default_validation_concurrency")]
    pub max_concurrency: usize,
    /// ListenBrainz API 地址
    #[serde(default = "default_listenbrainz_url")]
    pub listenbrainz_url: String,
    /// 默认歌单类型
    #[serde(default = "default_playlist_type")]
    pub default_playlist_type: String,
}

fn default_validation_concurrency() -> usize {
    4
}

fn default_listenbrainz_url() -> String {
    "https://api.listenbrainz.org".to_string()
}

fn default_playlist_type() -> String {
    "periodic-jams".to_string()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_validation_concurrency(),
            listenbrainz_url: default_listenbrainz_url(),
            default_playlist_type: default_playlist_type(),
        }
    }
}

/// 进度事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 每个订阅者的缓冲区大小
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// 空闲心跳间隔（秒）
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    /// 已结束主题的保留时长（秒）
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_progress_throttle_ms() -> u64 {
    200
}

fn default_terminal_retention_secs() -> u64 {
    3600
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            ping_interval_secs: default_ping_interval_secs(),
            progress_throttle_ms: default_progress_throttle_ms(),
            terminal_retention_secs: default_terminal_retention_secs(),
        }
    }
}

impl EventConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.apply_env_overrides();
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let mut config = Self::default();
                config.apply_env_overrides();

                if let Err(e) = config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                config
            }
        }
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(MUSIC_DIR_ENV) {
            let dir = dir.trim();
            if !dir.is_empty() {
                tracing::info!("使用环境变量 {} 指定的下载目录: {}", MUSIC_DIR_ENV, dir);
                self.download.download_dir = PathBuf::from(dir);
            }
        }
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_tasks == 0 {
            anyhow::bail!("download.max_concurrent_tasks 必须大于 0");
        }
        if self.download.max_attempts == 0 {
            anyhow::bail!("download.max_attempts 必须大于 0");
        }
        if self.validation.max_concurrency == 0 {
            anyhow::bail!("validation.max_concurrency 必须大于 0");
        }
        if self.events.subscriber_buffer == 0 {
            anyhow::bail!("events.subscriber_buffer 必须大于 0");
        }
        for entry in &self.endpoints.candidates {
            let url = reqwest::Url::parse(&entry.url)
                .with_context(|| format!("无效的端点地址: {}", entry.url))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                anyhow::bail!("端点地址必须使用 http 或 https: {}", entry.url);
            }
        }
        Ok(())
    }
}

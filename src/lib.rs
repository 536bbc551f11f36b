// Troi Downloader
// 曲库下载队列与进度推送服务

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 曲库服务客户端
pub mod catalog;

// 下载队列与传输引擎
pub mod downloader;

// 歌单校验模块
pub mod playlist;

// Web服务器模块（HTTP API + SSE）
pub mod server;

// 导出常用类型
pub use catalog::CatalogClient;
pub use config::AppConfig;
pub use downloader::{
    DownloadJob, DownloadManager, EndpointRegistry, JobSpec, JobStatus, QualityTier, QueueError,
    TransferError,
};
pub use playlist::{CandidateTrack, ValidatedTrack, ValidationPipeline};
pub use server::events::{EventKind, ProgressBroadcaster, ProgressEvent, StreamMessage};
pub use server::AppState;

// 应用状态

use crate::catalog::CatalogClient;
use crate::config::AppConfig;
use crate::downloader::{DownloadEngine, DownloadManager, EndpointRegistry, FileSink, QueueSettings};
use crate::playlist::{CandidateSource, CatalogAvailabilityChecker, ListenBrainzSource, ValidationPipeline};
use crate::server::events::ProgressBroadcaster;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
    /// 下载队列管理器
    pub download_manager: Arc<DownloadManager>,
    /// 曲库端点注册表（下载与校验共用）
    pub registry: Arc<EndpointRegistry>,
    /// 进度事件广播器
    pub broadcaster: Arc<ProgressBroadcaster>,
    /// 歌单校验流水线
    pub validation_pipeline: Arc<ValidationPipeline>,
    /// 推荐歌单来源
    pub candidate_source: Arc<dyn CandidateSource>,
}

impl AppState {
    /// 根据配置装配所有组件
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate().context("配置校验失败")?;
        config.download.ensure_download_dir_exists().await?;

        let catalog = CatalogClient::new(&config.endpoints.user_agent)?;
        let registry = Arc::new(EndpointRegistry::with_cooldown(
            config.endpoints.prioritized(),
            config.endpoints.cooldown(),
        ));
        info!("曲库端点: {:?}", config.endpoints.prioritized());

        let broadcaster = Arc::new(ProgressBroadcaster::new(
            config.events.subscriber_buffer,
            config.events.ping_interval(),
        ));

        let engine = DownloadEngine::new(
            catalog.http().clone(),
            Arc::new(catalog.clone()),
            Arc::new(FileSink::new(config.download.download_dir.clone())),
            config.download.resolve_timeout(),
            config.download.transfer_timeout(),
        );

        let checker = CatalogAvailabilityChecker::new(catalog, Arc::clone(&registry));
        let candidate_source = ListenBrainzSource::new(
            &config.validation.listenbrainz_url,
            &config.endpoints.user_agent,
        )?;

        Ok(Self::from_parts(
            config,
            Arc::new(engine),
            Arc::new(checker),
            Arc::new(candidate_source),
            registry,
            broadcaster,
        ))
    }

    /// 用给定的执行器、检查器和歌单来源装配状态
    pub fn from_parts(
        config: AppConfig,
        executor: Arc<dyn crate::downloader::TransferExecutor>,
        checker: Arc<dyn crate::playlist::AvailabilityChecker>,
        candidate_source: Arc<dyn CandidateSource>,
        registry: Arc<EndpointRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        let download_manager = DownloadManager::new(
            executor,
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            QueueSettings::from_config(&config.download, &config.events),
        );
        let validation_pipeline = ValidationPipeline::new(
            checker,
            Arc::clone(&broadcaster),
            config.validation.max_concurrency,
        );

        Self {
            config: Arc::new(RwLock::new(config)),
            download_manager: Arc::new(download_manager),
            registry,
            broadcaster,
            validation_pipeline: Arc::new(validation_pipeline),
            candidate_source,
        }
    }

    /// 启动定期清理已结束 subject 的后台任务
    pub async fn start_event_sweeper(&self) -> JoinHandle<()> {
        let retention = self.config.read().await.events.terminal_retention();
        let broadcaster = Arc::clone(&self.broadcaster);
        let interval = (retention / 4).max(std::time::Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let pruned = broadcaster.prune_terminated(retention);
                if pruned > 0 {
                    debug!("清理了 {} 个已结束的事件主题", pruned);
                }
            }
        })
    }

    /// 优雅关闭
    pub async fn shutdown(&self) {
        self.download_manager.shutdown().await;
    }
}

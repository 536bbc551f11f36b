use troi_downloader_rust::{config::LogConfig, logging, server, AppConfig, AppState};
use tracing::info;

const CONFIG_PATH: &str = "config/app.toml";

/// 加载日志配置
///
/// 日志系统要先于完整配置初始化，这里只读取 [log] 表，失败时使用默认值
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = load_log_config().await;
    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&log_config);

    info!("Troi Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let cors_origins = config.server.cors_origins.clone();
    let download_dir = config.download.download_dir.clone();

    let app_state = AppState::new(config).await?;
    let sweeper = app_state.start_event_sweeper().await;
    info!("应用状态初始化完成");

    let app = server::build_router(app_state.clone(), &cors_origins);

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("下载目录: {:?}", download_dir);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    sweeper.abort();
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}

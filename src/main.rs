use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vtx_relay::config::{session_key, AppConfig};
use vtx_relay::credentials::Credentials;
use vtx_relay::state::AppState;
use vtx_relay::{collector, supervisor, web};

/// VTX Relay - Camera Stream Session Manager
/// 解析命令行参数，加载配置文件，启动后台巡检与回收任务及 HTTP 服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可通过 RUST_LOG 覆盖
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!("VTX Relay initialized. HLS Root: {}", config.server.hls_root);
    tokio::fs::create_dir_all(&config.server.hls_root).await?;

    let state = Arc::new(AppState::new(config.clone()));
    let registry = state.registry.clone();
    let cancel = CancellationToken::new();

    // 启动后台健康巡检与垃圾回收
    let monitor = tokio::spawn(supervisor::start_health_monitor(
        registry.clone(),
        config.server.health_interval_ms,
        cancel.clone(),
    ));
    let collector = tokio::spawn(collector::start_collector(
        registry.clone(),
        config.server.gc_interval_ms,
        cancel.clone(),
    ));

    // 自动拉流
    for camera in &config.cameras {
        let credentials = Credentials::new(&camera.username, &camera.password);
        for profile in camera.profiles.iter().filter(|p| p.auto_start) {
            let key = session_key(camera.id, &profile.token);
            if let Err(e) = registry
                .start(&key, &profile.source, &credentials, profile.quality)
                .await
            {
                error!("Auto-start failed [{}]: {}", key, e);
            }
        }
    }

    let app = web::router(state.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    // 停止后台任务和所有会话
    cancel.cancel();
    let (monitor, collector) = tokio::join!(monitor, collector);
    if let Err(e) = monitor {
        error!("Health monitor task failed: {}", e);
    }
    if let Err(e) = collector {
        error!("Collector task failed: {}", e);
    }
    registry.stop_all().await;

    Ok(())
}

mod broker;
mod camera;
mod command;
mod config;
mod door;
mod error;
mod feed;
mod gpio;
mod jpeg;
mod mux;
mod process;
mod snapshot;
mod state;
mod storage;
mod supervisor;
#[cfg(test)]
mod testing;
mod web;

use broker::ResourceBroker;
use camera::MjpgStreamer;
use clap::Parser;
use command::CommandDispatcher;
use config::AppConfig;
use door::DoorController;
use feed::FirebaseFeed;
use gpio::SysfsPin;
use snapshot::SnapshotCoordinator;
use state::AppState;
use std::sync::Arc;
use storage::GcsStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Garage Link - 车库门继电器与摄像头网关
/// 解析命令行参数，加载配置文件，构造各组件并启动HTTP服务及命令监听
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "garage-link.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，设置格式
    tracing_subscriber::fmt::init();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!(
        "Garage Link initialized. Camera: {} on port {}",
        config.camera.binary, config.camera.port
    );

    // 打开门继电器引脚
    let pin = Arc::new(SysfsPin::open(&config.door.gpio_root, config.door.pin).await?);

    // 摄像头代理与快照协调器
    let backend = Arc::new(MjpgStreamer::new(config.camera.clone()));
    let broker = ResourceBroker::new(
        backend,
        config.camera.idle_grace(),
        config.camera.sink_buffer,
    );
    let store = Arc::new(GcsStore::new(&config.storage));
    let snapshots = SnapshotCoordinator::new(
        broker.clone(),
        store,
        config.storage.object_path.clone(),
        config.storage.capture_timeout(),
        config.storage.upload_timeout(),
    );
    let door = Arc::new(DoorController::new(
        pin,
        snapshots.clone(),
        config.door.pulse(),
        config.door.settle_delay(),
    ));

    // 初始化全局状态
    let state = Arc::new(AppState {
        broker,
        snapshots: snapshots.clone(),
        door: door.clone(),
    });

    // 启动命令源监听
    let cancel = CancellationToken::new();
    let feed = Arc::new(FirebaseFeed::new(&config.feed));
    let dispatcher = Arc::new(CommandDispatcher::new(feed.clone(), door, snapshots));
    let supervisor = tokio::spawn(supervisor::start_supervisor(
        feed,
        dispatcher,
        config.feed.retry.clone(),
        cancel.clone(),
    ));

    // 注册HTTP路由
    let app = web::router(state.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received.");
        })
        .await?;

    // 退出前停止监听、取消快照并关闭摄像头
    cancel.cancel();
    let _ = supervisor.await;
    state.shutdown();

    Ok(())
}

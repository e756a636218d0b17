//! Run-Chicken Daemon
//!
//! 后台守护进程，负责：
//! - 维持与鸡舍门的 BLE 会话
//! - 周期读取门状态，设备重新出现时刷新
//! - 接收状态通知
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use runchicken_core::{BtleTransport, RunChickenDevice, Settings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（runchicken-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,runchicken_core=debug")),
        )
        .try_init();

    tracing::info!("Run-Chicken Daemon starting...");

    let settings = Settings::load();
    let transport = Arc::new(
        BtleTransport::new()
            .await?
            .with_timeouts(settings.connect_timeout(), settings.io_timeout()),
    );
    let device = Arc::new(RunChickenDevice::new(
        Arc::clone(&transport),
        settings.address.clone(),
        settings.device_options(),
    ));
    let shutdown = CancellationToken::new();

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(Arc::clone(&device)));

    // 启动核心服务
    let service_handle = tokio::spawn(service::run_service(
        transport,
        Arc::clone(&device),
        settings,
        shutdown.clone(),
    ));

    // 等待任一任务完成或收到退出信号
    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        res = service_handle => {
            tracing::error!("Core service exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down");
        }
    }

    shutdown.cancel();
    device.session().teardown().await;
    let _ = std::fs::remove_file(runchicken_core::ipc::socket_path());

    Ok(())
}

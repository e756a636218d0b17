//! Core Service - 刷新调度、存在检测、通知订阅

use anyhow::Result;
use futures_util::StreamExt;
use runchicken_core::{
    BtleTransport, RefreshReason, RefreshScheduler, RunChickenDevice, Settings, Transport,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

pub async fn run_service(
    transport: Arc<BtleTransport>,
    device: Arc<RunChickenDevice<BtleTransport>>,
    settings: Settings,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!("核心服务初始化...");

    let Some(address) = settings.address.clone() else {
        tracing::warn!(
            "未配置设备地址，请在 {:?} 中设置 address",
            Settings::config_path()
        );
        shutdown.cancelled().await;
        return Ok(());
    };
    tracing::info!("设备地址: {}", address);

    tokio::spawn(log_state_changes(Arc::clone(&device), shutdown.clone()));

    let scheduler = RefreshScheduler::new(settings.refresh_config());

    // 设备重新出现在广播中时请求刷新
    match transport.presence(&address).await {
        Ok(mut presence) => {
            let handle = scheduler.handle();
            let token = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        seen = presence.next() => match seen {
                            Some(()) => {
                                tracing::trace!("设备广播已检测到");
                                handle.request();
                            }
                            None => break,
                        },
                    }
                }
            });
        }
        Err(e) => tracing::warn!("无法监听设备广播: {}", e),
    }

    let subscribed = Arc::new(AtomicBool::new(!settings.subscribe_notifications));
    scheduler
        .run(shutdown, |reason| {
            let device = Arc::clone(&device);
            let subscribed = Arc::clone(&subscribed);
            async move { refresh(&device, reason, &subscribed).await }
        })
        .await;

    Ok(())
}

async fn refresh<T: Transport>(
    device: &RunChickenDevice<T>,
    reason: RefreshReason,
    subscribed: &AtomicBool,
) {
    tracing::debug!("刷新门状态 ({:?})", reason);
    match device.poll_now().await {
        Ok(state) => tracing::debug!("门状态: {}", state.door_state),
        Err(e) => {
            tracing::warn!("读取门状态失败: {}", e);
            return;
        }
    }

    // 首次订阅在第一次成功读取后进行，之后由设备自动重新订阅
    if !subscribed.load(Ordering::SeqCst) {
        match device.subscribe().await {
            Ok(()) => subscribed.store(true, Ordering::SeqCst),
            Err(e) => tracing::warn!("订阅状态通知失败: {}", e),
        }
    }
}

async fn log_state_changes<T: Transport>(
    device: Arc<RunChickenDevice<T>>,
    shutdown: CancellationToken,
) {
    let mut rx = device.watch_state();
    let mut last = rx.borrow_and_update().door_state;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        let current = rx.borrow_and_update().door_state;
        if current != last {
            tracing::info!("门状态变化: {} -> {}", last, current);
            last = current;
        }
    }
}

//! Run-Chicken CLI
//!
//! 命令行客户端，默认通过 Unix Socket 与守护进程通信；
//! `--direct` 时不经过守护进程，直接连接设备。

mod client;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use runchicken_core::ipc::{IpcRequest, IpcResponse};
use runchicken_core::{BtleTransport, DeviceState, RunChickenDevice, Settings};
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "runchicken", version, about = "Run-Chicken 鸡舍门控制")]
struct Cli {
    /// 直接连接设备 (不经过守护进程)
    #[arg(long, global = true)]
    direct: bool,

    /// 设备地址，仅在 --direct 时使用 (默认读取设置文件)
    #[arg(short, long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Door(DoorAction),
    /// 把设备地址写入设置文件
    Pair {
        /// 设备 MAC 地址，如 00:80:E1:22:43:0D
        address: String,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum DoorAction {
    /// 开门
    Open,
    /// 关门
    Close,
    /// 查看缓存的门状态
    Status,
    /// 立即读取门状态
    Poll,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pair { address } => pair(&address),
        Commands::Door(action) if cli.direct => run_direct(action, cli.address).await,
        Commands::Door(action) => run_via_daemon(action).await,
    }
}

fn pair(address: &str) -> Result<()> {
    let path = Settings::config_path();
    remember_address(&path, address)?;
    println!("✅ 设备地址已保存到 {}", path.display());
    println!("   重启守护进程后生效");
    Ok(())
}

async fn run_via_daemon(action: DoorAction) -> Result<()> {
    let request = match action {
        DoorAction::Open => {
            println!("🐔 开门...");
            IpcRequest::Open
        }
        DoorAction::Close => {
            println!("🐔 关门...");
            IpcRequest::Close
        }
        DoorAction::Status => IpcRequest::Status,
        DoorAction::Poll => IpcRequest::Poll,
    };

    match client::send_request(request).await? {
        IpcResponse::State { state, session } => {
            print_state(&state);
            println!("会话: {}", session);
        }
        IpcResponse::Error { message } => bail!("❌ {}", message),
        IpcResponse::Ok { .. } => {}
    }

    Ok(())
}

async fn run_direct(action: DoorAction, address: Option<String>) -> Result<()> {
    let settings = Settings::load();
    let Some(address) = address.or_else(|| settings.address.clone()) else {
        bail!("未指定设备地址，请使用 --address、runchicken pair 或在设置文件中配置");
    };

    let transport = Arc::new(
        BtleTransport::new()
            .await?
            .with_timeouts(settings.connect_timeout(), settings.io_timeout()),
    );
    let device = RunChickenDevice::new(transport, Some(address), settings.device_options());

    let result = match action {
        DoorAction::Open => device.open().await.map(|()| println!("✅ 开门命令已发送")),
        DoorAction::Close => device.close().await.map(|()| println!("✅ 关门命令已发送")),
        DoorAction::Status | DoorAction::Poll => {
            device.poll_now().await.map(|state| print_state(&state))
        }
    };
    device.remove().await;

    Ok(result?)
}

fn print_state(state: &DeviceState) {
    println!("设备: {} ({})", state.identity.friendly_name(), state.identity.address);
    println!("门: {}", state.door_state);
    for (name, value) in &state.readings {
        println!("   {}: {}", name, value);
    }
}

/// 保留其余设置，只替换设备地址
fn remember_address(path: &Path, address: &str) -> Result<Settings> {
    let mut settings = Settings::load_from(path);
    settings.address = Some(address.to_string());
    settings.save_to(path)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["runchicken", "open", "--direct"]).unwrap();
        assert!(cli.direct);
        assert!(matches!(cli.command, Commands::Door(DoorAction::Open)));

        let cli = Cli::try_parse_from(["runchicken", "pair", "00:80:E1:22:43:0D"]).unwrap();
        assert!(matches!(cli.command, Commands::Pair { ref address } if address == "00:80:E1:22:43:0D"));
    }

    #[test]
    fn test_remember_address_keeps_other_settings() {
        let path = std::env::temp_dir()
            .join(format!("runchicken-cli-test-{}", std::process::id()))
            .join("settings.toml");
        let existing = Settings {
            poll_interval_secs: 60,
            ..Default::default()
        };
        existing.save_to(&path).unwrap();

        remember_address(&path, "00:80:E1:22:43:0D").unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.address.as_deref(), Some("00:80:E1:22:43:0D"));
        assert_eq!(loaded.poll_interval_secs, 60);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Run-Chicken 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建所有组件 (release)
    Build,
    /// 运行守护进程 (开发模式)
    Dev {
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "debug")]
        log_level: String,
    },
    /// 安装 systemd 服务
    Install,
    /// 卸载 systemd 服务
    Uninstall,
    /// 运行测试
    Test,
    /// 运行测试并生成覆盖率报告
    Coverage,
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => std::path::PathBuf::from(dir)
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_default(),
        Err(_) => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Dev { log_level } => dev(&sh, &log_level)?,
        Commands::Install => install(&sh)?,
        Commands::Uninstall => uninstall(&sh)?,
        Commands::Test => test(&sh)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建所有组件...");
    cmd!(
        sh,
        "cargo build --release -p runchicken-daemon -p runchicken-cli"
    )
    .run()?;
    println!("✅ 构建完成");
    Ok(())
}

fn dev(sh: &Shell, log_level: &str) -> Result<()> {
    println!("🚀 启动开发模式守护进程...");
    let rust_log = format!(
        "{level},runchicken_core={level},btleplug=info",
        level = log_level
    );
    cmd!(sh, "cargo run -p runchicken-daemon")
        .env("RUST_LOG", rust_log)
        .run()?;
    Ok(())
}

fn install(sh: &Shell) -> Result<()> {
    println!("📦 安装 Run-Chicken 服务...");

    build(sh)?;

    // 先停止已运行的服务（如果存在）
    println!("⏹️  停止现有服务...");
    let _ = cmd!(sh, "sudo systemctl stop runchicken.service").run();

    // 等待进程完全退出
    std::thread::sleep(std::time::Duration::from_millis(500));

    println!("📋 复制二进制文件...");
    cmd!(
        sh,
        "sudo cp target/release/runchicken-daemon /usr/local/bin/"
    )
    .run()?;
    cmd!(
        sh,
        "sudo cp target/release/runchicken-cli /usr/local/bin/runchicken"
    )
    .run()?;

    // 复制 systemd 服务文件
    cmd!(sh, "sudo cp assets/runchicken.service /etc/systemd/system/").run()?;

    cmd!(sh, "sudo systemctl daemon-reload").run()?;
    cmd!(sh, "sudo systemctl enable --now runchicken.service").run()?;

    println!("✅ 服务安装完成");
    println!("   使用 'runchicken --help' 查看命令");
    println!("   使用 'systemctl status runchicken' 查看服务状态");
    Ok(())
}

fn uninstall(sh: &Shell) -> Result<()> {
    println!("🗑️  卸载 Run-Chicken 服务...");

    let _ = cmd!(sh, "sudo systemctl stop runchicken.service").run();
    let _ = cmd!(sh, "sudo systemctl disable runchicken.service").run();

    let _ = cmd!(sh, "sudo rm /etc/systemd/system/runchicken.service").run();
    let _ = cmd!(sh, "sudo rm /usr/local/bin/runchicken-daemon").run();
    let _ = cmd!(sh, "sudo rm /usr/local/bin/runchicken").run();

    cmd!(sh, "sudo systemctl daemon-reload").run()?;

    println!("✅ 卸载完成");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn coverage(sh: &Shell) -> Result<()> {
    println!("📊 运行测试覆盖率分析...");

    // 检查 cargo-tarpaulin 是否安装
    if cmd!(sh, "cargo tarpaulin --version").run().is_err() {
        println!("📦 安装 cargo-tarpaulin...");
        cmd!(sh, "cargo install cargo-tarpaulin").run()?;
    }

    println!("🔍 分析中...");
    cmd!(
        sh,
        "cargo tarpaulin --packages runchicken-core --out Html --output-dir target/coverage"
    )
    .run()?;

    println!("✅ 覆盖率报告已生成");
    println!("   HTML 报告: target/coverage/tarpaulin-report.html");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ 清理完成");
    Ok(())
}

//! GattLink CLI
//!
//! 命令行客户端：扫描外设、发送消息、交互式聊天

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gattlink", version, about = "BLE GATT 消息收发工具")]
struct Cli {
    /// 使用进程内模拟外设，不访问蓝牙适配器
    #[arg(long, global = true)]
    simulate: bool,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描超时时间 (秒，默认使用配置文件中的值)
        #[arg(short, long)]
        timeout: Option<u64>,
        /// 以 JSON 格式输出设备列表
        #[arg(long)]
        json: bool,
    },
    /// 连接设备并发送一条消息
    Send {
        /// 目标设备地址
        address: String,
        /// 消息内容
        message: String,
        /// 发送后等待回复的时间 (秒)
        #[arg(short, long, default_value = "0")]
        wait: u64,
    },
    /// 交互式收发，输入 /quit 退出
    Chat {
        /// 目标设备地址
        address: String,
    },
    /// 查看配置
    Config {
        /// 把默认配置写入配置文件
        #[arg(long)]
        init: bool,
    },
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（gattlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default = if verbose {
        "info,gattlink_core=debug"
    } else {
        "warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = gattlink_core::LinkConfig::load();
    init_logging(cli.verbose || config.verbose);

    tracing::debug!("Config path: {:?}", gattlink_core::LinkConfig::config_path());

    match cli.command {
        Commands::Scan { timeout, json } => {
            commands::scan(cli.simulate, config, timeout, json).await
        }
        Commands::Send {
            address,
            message,
            wait,
        } => commands::send(cli.simulate, config, &address, &message, wait).await,
        Commands::Chat { address } => commands::chat(cli.simulate, config, &address).await,
        Commands::Config { init } => commands::config(config, init),
    }
}

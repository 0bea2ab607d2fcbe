//! Printlink CLI
//!
//! 命令行客户端：扫描蓝牙打印机、连接并发送打印数据
//!
//! # 日志
//!
//! 日志输出到 stderr。`RUST_LOG` 优先于 `--log-level`：
//!
//! ```bash
//! RUST_LOG=debug printlink scan
//! ```

mod commands;
mod test_page;

use anyhow::Result;
use clap::{Parser, Subcommand};
use printlink_core::logging::DEFAULT_FILTER;
use printlink_core::{LogLevel, PrinterSettings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "printlink", version, about = "蓝牙打印机连接工具")]
struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的打印机
    Scan {
        /// 扫描超时时间 (秒)，默认等待扫描自然结束
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 连接打印机并打印文件（默认打印测试页）
    Print {
        /// 打印机地址 (默认使用配置中的打印机)
        #[arg(short, long)]
        device: Option<String>,
        /// 要发送的打印数据文件
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// 以 JSON 行输出状态变化，发现指定设备后自动连接
    Watch {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// 查看或修改设置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 显示当前设置
    Show,
    /// 设置默认打印机
    SetDefault {
        /// 打印机地址
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut settings = PrinterSettings::load();

    let level = cli
        .log_level
        .or_else(|| settings.verbose.then_some(LogLevel::Debug));
    init_logging(level);
    tracing::debug!("Settings: {:?}", settings);

    let ok = match cli.command {
        Commands::Scan { timeout } => {
            println!("🔍 扫描打印机...");
            commands::scan(&settings, timeout).await?
        }
        Commands::Print { device, file } => commands::print(&settings, device, file).await?,
        Commands::Watch { device } => commands::watch(&settings, device).await?,
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => {
                    println!("# {}", PrinterSettings::config_path().display());
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                ConfigAction::SetDefault { address } => {
                    settings.default_printer = Some(address.clone());
                    settings.save()?;
                    println!("✅ 默认打印机已设置为 {}", address);
                }
            }
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// 初始化日志系统
///
/// 核心库使用 `log`，这里桥接到 tracing 并输出到 stderr。
fn init_logging(level: Option<LogLevel>) {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = level.map_or_else(|| DEFAULT_FILTER.to_string(), LogLevel::filter_directive);
        EnvFilter::new(directive)
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_print() {
        let cli = Cli::try_parse_from([
            "printlink",
            "--log-level",
            "debug",
            "print",
            "--device",
            "AC:3F:A4:11:22:33",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert!(matches!(
            cli.command,
            Commands::Print { device: Some(ref d), file: None } if d == "AC:3F:A4:11:22:33"
        ));
    }
}

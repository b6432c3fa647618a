use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mikrofleet_core::AppConfig;

mod app;
mod shutdown;

use app::Application;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mikrofleet")
        .version("1.0.0")
        .about("MikroTik 设备群任务编排与同步引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/mikrofleet.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["text", "json"])
                .default_value("text"),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));
    match matches.get_one::<String>("log-format").map(String::as_str) {
        Some("json") => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config/mikrofleet.toml");
    let config =
        AppConfig::load(std::path::Path::new(config_path)).context("加载配置失败")?;
    info!("配置已加载: {config_path}");

    Application::build(config)?.run().await
}

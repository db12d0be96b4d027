//! Loan Book Downloader：下载已借阅的电子书并去除借阅保护，存入本地书库。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/路径/文件清理等基础设施
//! - `auth`：凭据文件与会话（令牌刷新、401 重试）
//! - `remote`：借阅服务客户端、响应缓存、目录操作
//! - `drm`：密钥派生与两层解包
//! - `download`：获取队列与单本书的获取流程
//! - `library`：本地书库索引
//! - `cli`：命令行子命令

use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::{Path, PathBuf};

mod app;
mod auth;
mod base_system;
mod cli;
mod download;
mod drm;
mod error;
mod library;
mod remote;
#[cfg(test)]
mod test_support;

use base_system::config::load_or_create_with_base;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let base = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let config = load_or_create_with_base::<Config>(data_dir)
        .map_err(|e| anyhow!(e.to_string()))?
        .with_base_dir(base);

    let _log = init_logging(cli.debug, &config.logs_path())?;
    info!(target: "startup", "Loan Book Downloader v{VERSION}");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let app = app::App::new(config)?;
        cli::run(&app, cli.command).await
    })
}

fn init_logging(debug: bool, logs_dir: &Path) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        // 控制台日志仅在 --debug 时输出
        console: debug,
    };
    LogSystem::init_in(opts, logs_dir).map_err(|e| anyhow!(e))
}

//! 日志：`logs/latest.log` 记录本程序各模块的调试日志，控制台只在 `--debug` 时输出。
//!
//! 文件层按 target 过滤：本程序的 target（auth、queue、download 等）记录到 DEBUG，
//! 依赖库（hyper、reqwest 等）只记录 WARN 以上。`latest.log` 超过 10MB 时在启动时归档，
//! 正常退出时也归档一次，归档文件名为 `downloads_<时间>.zip`。

use std::fs::{self, File};
use std::io;
use std::panic;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

const LATEST_LOG: &str = "latest.log";
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
// 等 non_blocking 写线程把剩余日志落盘
const FLUSH_WAIT_MS: u64 = 300;

/// 本程序使用的日志 target。
const APP_TARGETS: [&str; 10] = [
    "auth", "cache", "catalog", "drm", "download", "queue", "library", "startup", "cleanup",
    "panic",
];

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    pub console: bool,
}

/// 持有写线程的 guard；析构时刷盘并按需归档。
pub struct LogSystem {
    logs_dir: PathBuf,
    guard: Option<WorkerGuard>,
    archive_on_exit: bool,
}

/// 文件层过滤：本程序 target 到 DEBUG，其余 WARN。
fn file_filter() -> Targets {
    APP_TARGETS
        .iter()
        .fold(Targets::new().with_default(LevelFilter::WARN), |t, name| {
            t.with_target(*name, LevelFilter::DEBUG)
        })
}

fn console_filter(debug: bool) -> Targets {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    APP_TARGETS
        .iter()
        .fold(Targets::new().with_default(LevelFilter::WARN), |t, name| {
            t.with_target(*name, level)
        })
}

impl LogSystem {
    pub fn init_in(options: LogOptions, logs_dir: &Path) -> Result<Self, LogError> {
        fs::create_dir_all(logs_dir)?;
        let latest = logs_dir.join(LATEST_LOG);
        if fs::metadata(&latest).is_ok_and(|m| m.len() >= MAX_LOG_BYTES) {
            archive_log_file(logs_dir)?;
        }

        let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(rolling::never(logs_dir, LATEST_LOG));

        // 进度条占用 stderr，控制台日志写 stdout
        let console_writer = if options.console {
            BoxMakeWriter::new(io::stdout)
        } else {
            BoxMakeWriter::new(io::sink)
        };
        let console_layer = fmt::layer()
            .with_target(true)
            .with_ansi(options.use_color)
            .with_writer(console_writer)
            .with_filter(console_filter(options.debug));

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(file_filter());

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| {
                if e.to_string().contains("global") {
                    LogError::AlreadyInitialized
                } else {
                    LogError::SubscriberInit(e)
                }
            })?;

        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            match info.location() {
                Some(loc) => error!(target: "panic", "{}:{}: {info}", loc.file(), loc.line()),
                None => error!(target: "panic", "{info}"),
            }
            previous(info);
        }));

        Ok(Self {
            logs_dir: logs_dir.to_path_buf(),
            guard: Some(guard),
            archive_on_exit: options.archive_on_exit,
        })
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        drop(self.guard.take());
        if self.archive_on_exit {
            thread::sleep(Duration::from_millis(FLUSH_WAIT_MS));
            if let Err(err) = archive_log_file(&self.logs_dir) {
                eprintln!("日志归档失败: {err}");
            }
        }
    }
}

/// 把 `latest.log` 压缩为 `downloads_<时间>.zip` 并删除原文件；空日志直接删除。
fn archive_log_file(logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let latest = logs_dir.join(LATEST_LOG);
    let Ok(meta) = fs::metadata(&latest) else {
        return Ok(None);
    };
    if meta.len() == 0 {
        let _ = fs::remove_file(&latest);
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let archive_path = logs_dir.join(format!("downloads_{stamp}.zip"));

    let mut zip = zip::ZipWriter::new(File::create(&archive_path)?);
    zip.start_file(
        format!("{stamp}.log"),
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    io::copy(&mut File::open(&latest)?, &mut zip)?;
    zip.finish()?;

    let _ = fs::remove_file(&latest);
    info!(target: "startup", "日志已归档到 {}", archive_path.display());
    Ok(Some(archive_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn archive_moves_log_into_zip() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        fs::write(&latest, "line one\nline two\n").unwrap();

        let archived = archive_log_file(dir.path()).unwrap().unwrap();
        assert!(!latest.exists());
        assert!(
            archived
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("downloads_")
        );

        let mut zip = zip::ZipArchive::new(File::open(&archived).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut entry = zip.by_index(0).unwrap();
        let mut text = String::new();
        io::Read::read_to_string(&mut entry, &mut text).unwrap();
        assert_eq!(text, "line one\nline two\n");
    }

    #[test]
    fn empty_log_is_dropped_without_archive() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        fs::write(&latest, "").unwrap();

        assert!(archive_log_file(dir.path()).unwrap().is_none());
        assert!(!latest.exists());
        assert!(archive_log_file(dir.path()).unwrap().is_none());
    }

    #[test]
    fn file_filter_keeps_app_debug_and_quiets_dependencies() {
        let filter = file_filter();
        assert!(filter.would_enable("queue", &Level::DEBUG));
        assert!(filter.would_enable("download", &Level::DEBUG));
        assert!(!filter.would_enable("hyper::proto", &Level::DEBUG));
        assert!(filter.would_enable("hyper::proto", &Level::WARN));

        let console = console_filter(false);
        assert!(console.would_enable("queue", &Level::INFO));
        assert!(!console.would_enable("queue", &Level::DEBUG));
    }
}

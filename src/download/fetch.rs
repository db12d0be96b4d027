//! 流式下载远端文件。
//!
//! 字节先写入 `<dest>.part`，完整下载后才改名为 `dest`；`.part` 由 [`TempPath`] 持有，
//! 出错或取消时自动删除。每次读取网络分块都与取消令牌竞争，取消延迟以单个分块为界。

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::models::JobState;
use super::progress::ProgressReporter;
use crate::error::{AcquireError, AcquireResult};
use crate::remote::client::{LendingClient, transport_error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    /// 复用了上次完整下载的文件
    pub reused: bool,
}

pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

pub async fn fetch_to_file(
    client: &LendingClient,
    url: &str,
    dest: &Path,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> AcquireResult<FetchOutcome> {
    if let Ok(meta) = tokio::fs::metadata(dest).await
        && meta.is_file()
        && meta.len() > 0
    {
        info!(target: "download", "复用已下载文件 {}", dest.display());
        reporter
            .stage(JobState::Downloading, 99, "Using existing download cache.")
            .await;
        return Ok(FetchOutcome {
            path: dest.to_path_buf(),
            bytes: meta.len(),
            reused: true,
        });
    }

    if cancel.is_cancelled() {
        return Err(AcquireError::Cancelled);
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AcquireError::io(parent, e))?;
    }

    let mut resp = tokio::select! {
        r = client.open_download(url) => r?,
        _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
    };
    let total = resp.content_length();
    reporter
        .stage(JobState::Downloading, 0, "Starting download...")
        .await;

    let part = part_path(dest);
    // guard 先于文件句柄声明，析构时句柄先关闭再删除
    let guard = TempPath::try_from_path(&part).map_err(|e| AcquireError::io(&part, e))?;
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| AcquireError::io(&part, e))?;

    let mut downloaded: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target: "download", "下载被取消：{url}");
                return Err(AcquireError::Cancelled);
            }
            c = resp.chunk() => c.map_err(transport_error)?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        file.write_all(&chunk)
            .await
            .map_err(|e| AcquireError::io(&part, e))?;
        downloaded += chunk.len() as u64;
        reporter.bytes(downloaded, total);
    }
    file.flush().await.map_err(|e| AcquireError::io(&part, e))?;
    drop(file);

    if let Some(expected) = total
        && downloaded < expected
    {
        return Err(AcquireError::remote(
            None,
            format!("download truncated: {downloaded} of {expected} bytes"),
        ));
    }

    guard
        .persist(dest)
        .map_err(|e| AcquireError::io(dest, e.error))?;
    info!(target: "download", "下载完成 {} ({downloaded} bytes)", dest.display());
    Ok(FetchOutcome {
        path: dest.to_path_buf(),
        bytes: downloaded,
        reused: false,
    })
}

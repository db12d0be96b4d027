//! 文档层解密：调用外部修复工具（qpdf）去除 PDF 密码保护。
//!
//! 调用形式：`<tool> --password=<pw> --decrypt <input> <output>`，非零退出码视为失败。

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::base_system::file_cleaner::remove_file_quietly;
use crate::error::{AcquireError, AcquireResult, UnwrapStage};

fn document_err(message: impl Into<String>) -> AcquireError {
    AcquireError::unwrap_failed(UnwrapStage::Document, message)
}

/// 成功时 `output` 为解密后的文档；失败或取消时不留下 `output`。
pub async fn unwrap_document(
    tool: &Path,
    password: &str,
    input: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> AcquireResult<()> {
    if cancel.is_cancelled() {
        return Err(AcquireError::Cancelled);
    }
    debug!(target: "drm", "调用 {} 解密 {}", tool.display(), input.display());

    let child = Command::new(tool)
        .arg(format!("--password={password}"))
        .arg("--decrypt")
        .arg(input)
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| document_err(format!("failed to start {}: {e}", tool.display())))?;

    // 取消时丢弃 future，kill_on_drop 负责结束子进程
    let result = tokio::select! {
        out = child.wait_with_output() => out,
        _ = cancel.cancelled() => {
            remove_file_quietly(output).await;
            return Err(AcquireError::Cancelled);
        }
    };

    let out = match result {
        Ok(out) => out,
        Err(e) => {
            remove_file_quietly(output).await;
            return Err(document_err(format!("waiting for {}: {e}", tool.display())));
        }
    };

    if !out.status.success() {
        remove_file_quietly(output).await;
        let stderr = String::from_utf8_lossy(&out.stderr);
        let code = out
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(document_err(format!(
            "{} exited with {code}: {}",
            tool.display(),
            stderr.trim()
        )));
    }

    if !output.exists() {
        return Err(document_err(format!(
            "{} produced no output file",
            tool.display()
        )));
    }
    info!(target: "drm", "文档保护已移除：{}", output.display());
    Ok(())
}

//! 缓存与临时文件清理。

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// 删除文件，文件不存在视为成功，其他错误只记日志。
pub async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(target: "cleanup", "已删除 {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: "cleanup", "删除 {} 失败: {e}", path.display()),
    }
}

/// 清除临时目录中残留的 `.part` 文件（上次进程异常退出留下的半截下载）。
pub fn purge_partial_downloads(temp_dir: &Path) -> usize {
    let Ok(rd) = fs::read_dir(temp_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in rd.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_part = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("part"))
            .unwrap_or(false);
        if is_part && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

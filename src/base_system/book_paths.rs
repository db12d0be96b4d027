//! 书籍目录与文件命名。
//!
//! 每本书一个目录，目录名由标题替换非 `[A-Za-z0-9_.-]` 字符得到；
//! 最终文件命名为 `<safe>_decrypted.<ext>`。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

pub const DECRYPTED_MARKER: &str = "_decrypted";
pub const META_FILE: &str = "meta.json";
pub const COVER_FILE: &str = "cover.jpg";

static RE_UNSAFE: OnceLock<Regex> = OnceLock::new();
static RE_NON_ALNUM: OnceLock<Regex> = OnceLock::new();
static RE_UNDERSCORES: OnceLock<Regex> = OnceLock::new();

fn re_unsafe() -> &'static Regex {
    RE_UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("compile RE_UNSAFE"))
}

fn re_non_alnum() -> &'static Regex {
    RE_NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]").expect("compile RE_NON_ALNUM"))
}

fn re_underscores() -> &'static Regex {
    RE_UNDERSCORES.get_or_init(|| Regex::new(r"_+").expect("compile RE_UNDERSCORES"))
}

/// 标题转为目录/文件名：非安全字符替换为 `_` 并合并连续下划线。
pub fn safe_name(title: &str) -> String {
    let replaced = re_unsafe().replace_all(title.trim(), "_");
    let collapsed = re_underscores().replace_all(&replaced, "_").into_owned();
    if collapsed.is_empty() || collapsed == "_" {
        "unnamed".to_string()
    } else {
        collapsed
    }
}

/// 用于本地/远端对比的宽松规范化（大小写、标点不敏感）。
pub fn normalize_name(s: &str) -> String {
    let lower = s.to_lowercase();
    let replaced = re_non_alnum().replace_all(&lower, "_");
    re_underscores()
        .replace_all(&replaced, "_")
        .trim_matches('_')
        .to_string()
}

pub fn book_folder_path(books_dir: &Path, title: &str) -> PathBuf {
    books_dir.join(safe_name(title))
}

pub fn decrypted_file_name(safe: &str, ext: &str) -> String {
    format!("{safe}{DECRYPTED_MARKER}.{}", ext.trim_start_matches('.'))
}

pub fn is_decrypted_file_name(name: &str) -> bool {
    name.contains(DECRYPTED_MARKER)
}

/// 小写扩展名（不含点）。
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// 移动文件；跨文件系统时退化为复制后删除。
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

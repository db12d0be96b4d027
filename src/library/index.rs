//! 本地书库索引：扫描 `books/*/` 下已解密的 PDF/EPUB。
//!
//! 每个书籍目录最多对应一本书；同一目录有多个解密文件时优先 PDF。
//! 目录内有 `meta.json`（下载时保存的详情快照）则用其补全 ID、作者、出版社。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::base_system::book_paths::{
    COVER_FILE, META_FILE, extension_of, is_decrypted_file_name, normalize_name, safe_name,
};
use crate::base_system::json_extract::{pick_string, value_text};

const BOOK_EXTS: [&str; 2] = ["pdf", "epub"];

#[derive(Debug, Clone, Serialize)]
pub struct LocalBook {
    /// `meta.json` 中的条目 ID，缺失时为目录名
    pub id: String,
    pub folder_name: String,
    pub title: String,
    pub file_name: String,
    pub path: PathBuf,
    pub format: String,
    pub cover_path: Option<PathBuf>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub modified_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LibraryIndex {
    books_dir: PathBuf,
}

impl LibraryIndex {
    pub fn new(books_dir: impl Into<PathBuf>) -> Self {
        Self {
            books_dir: books_dir.into(),
        }
    }

    pub fn books_dir(&self) -> &Path {
        &self.books_dir
    }

    /// 全量扫描，按修改时间从新到旧。
    pub async fn scan(&self) -> Vec<LocalBook> {
        let root = self.books_dir.clone();
        tokio::task::spawn_blocking(move || scan_books(&root))
            .await
            .unwrap_or_default()
    }

    /// 按条目 ID 查找已完成的书籍。
    pub async fn find_by_item_id(&self, item_id: &str) -> Option<LocalBook> {
        let item_id = item_id.trim();
        self.scan().await.into_iter().find(|b| b.id == item_id)
    }

    /// 把远端书架条目与本地书库合并，按规范化后的 ID 或标题匹配。
    pub async fn sync_with_remote(&self, remote: Vec<Value>) -> Vec<Value> {
        let local = self.scan().await;
        remote
            .into_iter()
            .map(|item| merge_remote(item, &local))
            .collect()
    }
}

/// 目录内已解密的书籍文件，PDF 优先于 EPUB。
pub fn find_in_folder(folder: &Path) -> Option<PathBuf> {
    let rd = fs::read_dir(folder).ok()?;
    let mut found: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_book_file(p))
        .collect();
    found.sort_by_key(|p| {
        let rank = BOOK_EXTS
            .iter()
            .position(|e| *e == extension_of(p))
            .unwrap_or(BOOK_EXTS.len());
        (rank, p.clone())
    });
    found.into_iter().next()
}

fn is_book_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    is_decrypted_file_name(&name) && BOOK_EXTS.contains(&extension_of(path).as_str())
}

fn scan_books(root: &Path) -> Vec<LocalBook> {
    let Ok(rd) = fs::read_dir(root) else {
        debug!(target: "library", "书库目录不存在: {}", root.display());
        return Vec::new();
    };

    let mut out: Vec<LocalBook> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|dir| describe_folder(&dir))
        .collect();

    out.sort_by(|a, b| {
        b.modified_ms
            .cmp(&a.modified_ms)
            .then_with(|| a.folder_name.cmp(&b.folder_name))
    });
    out
}

fn describe_folder(dir: &Path) -> Option<LocalBook> {
    let file = find_in_folder(dir)?;
    let folder_name = dir.file_name()?.to_string_lossy().into_owned();
    let file_name = file.file_name()?.to_string_lossy().into_owned();
    let modified_ms = fs::metadata(&file)
        .and_then(|m| m.modified())
        .ok()
        .and_then(system_time_ms);
    let cover = dir.join(COVER_FILE);

    let mut book = LocalBook {
        id: folder_name.clone(),
        title: folder_name.replace('_', " "),
        format: extension_of(&file).to_ascii_uppercase(),
        folder_name,
        file_name,
        path: file,
        cover_path: cover.is_file().then_some(cover),
        author: None,
        publisher: None,
        modified_ms,
    };

    if let Some(meta) = read_meta(&dir.join(META_FILE))
        && let Some(map) = meta.as_object()
    {
        if let Some(id) = map.get("id").and_then(value_text) {
            book.id = id;
        }
        if let Some(title) = pick_string(map, &["book_title", "title"]) {
            book.title = title;
        }
        book.author = pick_string(map, &["book_author", "author"]);
        book.publisher = pick_string(map, &["publisher_name", "publisher"]);
    }
    Some(book)
}

fn read_meta(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(target: "library", "meta.json 无法解析 {}: {e}", path.display());
            None
        }
    }
}

fn merge_remote(item: Value, local: &[LocalBook]) -> Value {
    let Value::Object(mut map) = item else {
        return item;
    };
    // 书架条目的 `id` 是借阅记录 ID，书籍 ID 在 `book_id`
    let id_keys: Vec<String> = ["book_id", "id"]
        .iter()
        .filter_map(|k| map.get(*k).and_then(value_text))
        .map(|id| normalize_name(&id))
        .filter(|k| !k.is_empty())
        .collect();
    let remote_title = pick_string(&map, &["book_title", "title"]).unwrap_or_default();
    let title_key = normalize_name(&remote_title);

    let matched = local.iter().find(|b| {
        id_keys.contains(&normalize_name(&b.id))
            || (!title_key.is_empty() && normalize_name(&b.title) == title_key)
    });

    let put = |map: &mut Map<String, Value>, k: &str, v: Value| {
        map.insert(k.to_string(), v);
    };
    match matched {
        Some(b) => {
            put(&mut map, "is_local", Value::Bool(true));
            put(&mut map, "safe_name", Value::String(b.folder_name.clone()));
            put(&mut map, "local_filename", Value::String(b.file_name.clone()));
            put(&mut map, "local_format", Value::String(b.format.clone()));
            let cover = b
                .cover_path
                .as_ref()
                .map(|p| Value::String(p.to_string_lossy().into_owned()))
                .unwrap_or(Value::Null);
            put(&mut map, "local_cover", cover);
        }
        None => {
            put(&mut map, "is_local", Value::Bool(false));
            put(&mut map, "safe_name", Value::String(safe_name(&remote_title)));
            put(&mut map, "local_filename", Value::Null);
            put(&mut map, "local_format", Value::Null);
            put(&mut map, "local_cover", Value::Null);
        }
    }
    Value::Object(map)
}

fn system_time_ms(t: SystemTime) -> Option<u64> {
    t.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

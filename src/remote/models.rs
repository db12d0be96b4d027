//! 借阅服务返回数据的类型化视图。
//!
//! 原始 JSON 仍随结构体保留（`raw`），用于写入 `meta.json` 快照。

use serde::Serialize;
use serde_json::Value;

use crate::base_system::json_extract::{
    pick_bool, pick_path, pick_string, unwrap_data, value_text,
};
use crate::error::{AcquireError, AcquireResult};

/// 书籍详情。
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub id: String,
    pub title: String,
    pub cover_url: Option<String>,
    pub using_drm: bool,
    pub organization_id: Option<String>,
    pub raw: Value,
}

impl CatalogItem {
    /// `fallback_id` 用于服务端未回传 ID 的情况。
    pub fn from_payload(raw: Value, fallback_id: &str) -> AcquireResult<Self> {
        let Some(map) = raw.as_object() else {
            return Err(AcquireError::remote(
                None,
                format!("unexpected detail payload for item {fallback_id}"),
            ));
        };
        let id = pick_string(map, &["id", "book_id"]).unwrap_or_else(|| fallback_id.to_string());
        let title = pick_string(map, &["book_title", "title"]).unwrap_or_else(|| id.clone());
        Ok(Self {
            cover_url: pick_string(map, &["cover_url", "cover"]),
            using_drm: pick_bool(map, &["using_drm"]).unwrap_or(false),
            organization_id: pick_path(&raw, &["catalog_info", "organization_id"])
                .and_then(value_text),
            id,
            title,
            raw,
        })
    }
}

/// 一次下载尝试对应的借阅信息，只用于驱动一次解包。
#[derive(Debug, Clone)]
pub struct LoanRecord {
    pub file_url: String,
    pub borrow_key: Option<String>,
    pub branch_id: String,
    pub cover_url: Option<String>,
}

impl LoanRecord {
    /// 解析 check-borrow-status 的响应；没有借阅馆或文件地址时视为无可用借阅。
    pub fn from_payload(raw: &Value, item_id: &str) -> AcquireResult<Self> {
        let data = unwrap_data(raw);
        let branch_id = pick_path(data, &["epustaka", "id"]).and_then(value_text);
        let file_url = data
            .as_object()
            .and_then(|m| pick_string(m, &["url_file", "file_url"]));

        let (Some(branch_id), Some(file_url)) = (branch_id, file_url) else {
            return Err(AcquireError::NoLoanAvailable(item_id.to_string()));
        };
        let map = data.as_object();
        Ok(Self {
            file_url,
            borrow_key: map.and_then(|m| pick_string(m, &["borrow_key"])),
            branch_id,
            cover_url: map.and_then(|m| pick_string(m, &["cover_url"])),
        })
    }
}

/// 可借阅的馆（epustaka）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub id: String,
    pub organization_id: Option<String>,
}

impl Branch {
    /// epustaka-borrow 可能返回数组或单个对象。
    pub fn list_from_payload(raw: &Value) -> Vec<Branch> {
        let one = |v: &Value| {
            let map = v.as_object()?;
            Some(Branch {
                id: pick_string(map, &["id"])?,
                organization_id: pick_string(map, &["organization_id"]),
            })
        };
        match raw {
            Value::Array(items) => items.iter().filter_map(one).collect(),
            Value::Object(_) => one(raw).into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// 列表展示用的条目摘要（书架、搜索结果）。
#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
}

impl ItemSummary {
    pub fn from_value(v: &Value) -> Option<Self> {
        let map = v.as_object()?;
        let id = pick_string(map, &["book_id", "id"])?;
        Some(Self {
            title: pick_string(map, &["book_title", "title"]).unwrap_or_else(|| id.clone()),
            author: pick_string(map, &["book_author", "author"]),
            id,
        })
    }
}

/// 搜索结果可能放在 `data` 数组或 `data.data` 中。
pub fn search_items(raw: &Value) -> Vec<ItemSummary> {
    let mut cur = raw;
    for _ in 0..2 {
        if let Value::Array(items) = cur {
            return items.iter().filter_map(ItemSummary::from_value).collect();
        }
        cur = match cur.get("data") {
            Some(inner) => inner,
            None => break,
        };
    }
    if let Value::Array(items) = cur {
        return items.iter().filter_map(ItemSummary::from_value).collect();
    }
    Vec::new()
}

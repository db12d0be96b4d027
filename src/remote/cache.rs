//! 接口响应缓存（搜索、详情）。
//!
//! 内存中保存，落盘为 `[[key, {data, expires_at}], ...]`。启动时读取一次并丢弃过期项，
//! 每次变更后整体写回；读取时遇到过期项惰性淘汰。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    data: Value,
    /// 毫秒时间戳
    expires_at: u64,
}

pub struct ResponseCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl ResponseCache {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// 读取缓存文件；文件缺失或损坏时从空缓存开始。
    pub fn load(path: PathBuf) -> Self {
        let now = now_ms();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<(String, CacheEntry)>>(&bytes) {
                Ok(list) => list
                    .into_iter()
                    .filter(|(_, e)| e.expires_at > now)
                    .collect(),
                Err(e) => {
                    warn!(target: "cache", "缓存文件损坏，已忽略 {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(target: "cache", "载入 {} 条缓存", entries.len());
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let mut g = self.entries.lock().unwrap();
            match g.get(key) {
                None => return None,
                Some(e) if e.expires_at > now_ms() => return Some(e.data.clone()),
                Some(_) => {
                    g.remove(key);
                }
            }
        }
        // 淘汰也需要落盘
        self.persist().await;
        None
    }

    pub async fn set(&self, key: &str, data: Value, ttl: Duration) {
        let entry = CacheEntry {
            data,
            expires_at: now_ms().saturating_add(ttl.as_millis() as u64),
        };
        self.entries.lock().unwrap().insert(key.to_string(), entry);
        self.persist().await;
    }

    pub async fn clear(&self) {
        self.entries.lock().unwrap().clear();
        self.persist().await;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// 写盘失败只记日志，缓存本身仍然可用。
    async fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _gate = self.write_gate.lock().await;
        let snapshot: Vec<(String, CacheEntry)> = {
            let g = self.entries.lock().unwrap();
            g.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "cache", "序列化缓存失败: {e}");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let tmp = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!(target: "cache", "写入缓存文件失败 {}: {e}", path.display());
        }
    }
}

pub fn search_key(query: &str, offset: usize) -> String {
    format!("search:{query}:{offset}")
}

pub fn detail_key(item_id: &str) -> String {
    format!("detail:{item_id}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

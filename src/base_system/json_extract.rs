//! 宽松的 JSON 字段提取。
//!
//! 借阅服务的字段类型并不稳定（ID 有时是数字有时是字符串，布尔值可能是 0/1），
//! 这里统一做容错读取。

use serde_json::Value;

pub type JsonMap = serde_json::Map<String, Value>;

/// `{ data: X }` 信封展开；没有 `data` 时返回自身。
pub fn unwrap_data(raw: &Value) -> &Value {
    match raw.get("data") {
        Some(inner) if !inner.is_null() => inner,
        _ => raw,
    }
}

pub fn unwrap_data_owned(raw: Value) -> Value {
    match raw {
        Value::Object(mut map) => match map.remove("data") {
            Some(inner) if !inner.is_null() => inner,
            Some(_) | None => Value::Object(map),
        },
        other => other,
    }
}

/// 字符串或数字统一转文本；空串视为缺失。
pub fn value_text(val: &Value) -> Option<String> {
    match val {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn pick_string(map: &JsonMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| map.get(*key).and_then(value_text))
}

pub fn pick_bool(map: &JsonMap, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// 按路径读取嵌套对象，例如 `["catalog_info", "organization_id"]`。
pub fn pick_path<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(raw, |cur, key| cur.get(*key))
}

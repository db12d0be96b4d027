//! 凭据文件读写。
//!
//! 文件格式即登录接口的原始响应：
//! `{ "data": { "access_token", "refresh_token", "expired_at", "id", "name", "username"|"email", ... } }`。
//! 文件不存在表示未登录。整体读、整体写，不做并发保护。

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::debug;

use crate::base_system::json_extract::{JsonMap, unwrap_data, value_text};
use crate::error::{AcquireError, AcquireResult};

/// 用户 ID，保留服务端原始类型（数字或字符串）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Value);

impl UserId {
    pub fn as_text(&self) -> String {
        value_text(&self.0).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<String>,
    #[serde(default)]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFile {
    pub data: CredentialRecord,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// 刷新接口新签发的令牌。
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expired_at: Option<String>,
}

impl IssuedTokens {
    pub fn from_payload(raw: &Value) -> Option<Self> {
        let data = unwrap_data(raw).as_object()?;
        let text = |key: &str| data.get(key).and_then(value_text);
        Some(Self {
            access_token: text("access_token")?,
            refresh_token: text("refresh_token"),
            expired_at: text("expired_at"),
        })
    }
}

impl CredentialRecord {
    pub fn login_id(&self) -> Option<&str> {
        self.username.as_deref().or(self.email.as_deref())
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expired_at.as_deref().and_then(parse_expiry)
    }

    /// 到期前 `margin` 内即视为过期；没有到期时间的凭据一律视为过期。
    pub fn is_expired(&self, now: OffsetDateTime, margin: Duration) -> bool {
        match self.expires_at() {
            Some(exp) => now >= exp - margin,
            None => true,
        }
    }

    /// 合并新令牌，保留用户身份字段。服务端未回传新的 refresh_token 时沿用旧值。
    pub fn apply_refresh(&mut self, issued: IssuedTokens) {
        self.access_token = issued.access_token;
        if issued.refresh_token.is_some() {
            self.refresh_token = issued.refresh_token;
        }
        self.expired_at = issued.expired_at;
    }
}

/// 解析 ISO-8601 到期时间；不带时区时按 UTC 处理。
pub fn parse_expiry(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(t) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(t);
    }
    let with_t = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let with_space = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    // 去掉小数秒再尝试
    let base = raw.split('.').next().unwrap_or(raw);
    PrimitiveDateTime::parse(base, with_t)
        .or_else(|_| PrimitiveDateTime::parse(base, with_space))
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> AcquireResult<Option<CredentialFile>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AcquireError::io(&self.path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AcquireError::CorruptFile {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    pub async fn save(&self, file: &CredentialFile) -> AcquireResult<()> {
        let value = serde_json::to_value(file).map_err(|e| AcquireError::CorruptFile {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        self.save_raw(&value).await
    }

    /// 原样写入（登录接口响应）。
    pub async fn save_raw(&self, raw: &Value) -> AcquireResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AcquireError::io(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(raw).map_err(|e| AcquireError::CorruptFile {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| AcquireError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AcquireError::io(&self.path, e))?;
        debug!(target: "auth", "凭据已写入 {}", self.path.display());
        Ok(())
    }

    /// 登出：删除凭据文件。
    pub async fn clear(&self) -> AcquireResult<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AcquireError::io(&self.path, e)),
        }
    }
}

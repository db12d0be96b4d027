//! 借阅服务 HTTP 客户端。
//!
//! 每个方法只负责一次请求：成功时返回服务端原始数据，失败时返回带服务端消息的
//! `RemoteRequestFailed`。这里不做任何重试，令牌过期后的重试由会话层负责。

use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use crate::base_system::context::Config;
use crate::base_system::json_extract::unwrap_data_owned;
use crate::error::{AcquireError, AcquireResult};

#[derive(Debug, Clone)]
pub struct ApiUrls {
    pub login: String,
    pub refresh: String,
    pub book_detail: String,
    pub check_borrow: String,
    pub borrow_shelf: String,
    pub search: String,
    pub branches: String,
    pub borrow: String,
    pub book_return: String,
}

impl ApiUrls {
    pub fn from_config(cfg: &Config) -> Self {
        let api = cfg.api_base_url.trim_end_matches('/');
        let agent = cfg.agent_base_url.trim_end_matches('/');
        Self {
            login: format!("{api}/auth/login"),
            refresh: format!("{api}/auth/refresh-token"),
            book_detail: format!("{api}/webhook/book-detail"),
            check_borrow: format!("{api}/webhook/check-borrow-status"),
            borrow_shelf: format!("{api}/webhook/book-borrow-shelf"),
            search: format!("{api}/webhook/search-book"),
            branches: format!("{api}/webhook/epustaka-borrow"),
            borrow: format!("{agent}/webhook/borrow"),
            book_return: format!("{api}/webhook/book-return"),
        }
    }
}

/// 借书请求体。
#[derive(Debug, Clone, Serialize)]
pub struct LoanRequest {
    pub epustaka_id: String,
    pub user_id: Value,
    pub book_id: String,
    pub organization_id: String,
}

pub struct LendingClient {
    http: Client,
    urls: ApiUrls,
    timeout: Duration,
}

impl LendingClient {
    pub fn new(cfg: &Config) -> AcquireResult<Self> {
        let mut headers = HeaderMap::new();
        let origin = cfg.web_origin.trim_end_matches('/');
        if let Ok(v) = HeaderValue::from_str(origin) {
            headers.insert(ORIGIN, v);
        }
        if let Ok(v) = HeaderValue::from_str(&format!("{origin}/")) {
            headers.insert(REFERER, v);
        }
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&cfg.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.api+json"),
        );

        // 文件下载不设整体超时，API 调用逐个设置
        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(cfg.request_timeout())
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            http,
            urls: ApiUrls::from_config(cfg),
            timeout: cfg.request_timeout(),
        })
    }

    fn authed(&self, req: RequestBuilder, token: &str) -> RequestBuilder {
        req.header(AUTHORIZATION, format!("Bearer {token}"))
            .timeout(self.timeout)
    }

    pub async fn login(&self, email: &str, password: &str) -> AcquireResult<Value> {
        let req = self
            .http
            .post(&self.urls.login)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&json!({ "email": email, "password": password }));
        send_json(req).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> AcquireResult<Value> {
        let req = self
            .http
            .post(&self.urls.refresh)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&json!({ "refresh_token": refresh_token }));
        send_json(req).await
    }

    /// 已借书架；缺少 `data` 时视为空。
    pub async fn borrowed_items(&self, token: &str) -> AcquireResult<Vec<Value>> {
        let req = self.authed(self.http.get(&self.urls.borrow_shelf), token);
        let raw = send_json(req).await?;
        Ok(match raw.get("data") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    pub async fn item_detail(&self, token: &str, item_id: &str) -> AcquireResult<Value> {
        let req = self.authed(
            self.http
                .get(&self.urls.book_detail)
                .query(&[("book_id", item_id)]),
            token,
        );
        send_json(req).await.map(unwrap_data_owned)
    }

    /// 借阅状态（含文件地址、borrow_key 与借阅馆），返回原始信封。
    pub async fn loan_info(&self, token: &str, item_id: &str) -> AcquireResult<Value> {
        let req = self.authed(
            self.http
                .get(&self.urls.check_borrow)
                .query(&[("book_id", item_id)]),
            token,
        );
        send_json(req).await
    }

    pub async fn search(
        &self,
        token: &str,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> AcquireResult<Value> {
        let limit = limit.to_string();
        let offset = offset.to_string();
        let req = self.authed(
            self.http.get(&self.urls.search).query(&[
                ("q", query),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
            ]),
            token,
        );
        send_json(req).await
    }

    pub async fn branches(&self, token: &str, item_id: &str) -> AcquireResult<Value> {
        let req = self.authed(
            self.http
                .get(&self.urls.branches)
                .query(&[("book_id", item_id)]),
            token,
        );
        send_json(req).await.map(unwrap_data_owned)
    }

    pub async fn create_loan(&self, token: &str, payload: &LoanRequest) -> AcquireResult<Value> {
        let req = self.authed(
            self.http
                .post(&self.urls.borrow)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json")
                .json(payload),
            token,
        );
        send_json(req).await
    }

    pub async fn release_loan(&self, token: &str, borrow_book_id: &str) -> AcquireResult<Value> {
        let req = self.authed(
            self.http
                .put(&self.urls.book_return)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json")
                .json(&json!({ "borrow_book_id": borrow_book_id })),
            token,
        );
        send_json(req).await
    }

    /// 打开文件下载响应（流式读取由调用方负责）。
    pub async fn open_download(&self, url: &str) -> AcquireResult<Response> {
        debug!(target: "download", "GET {url}");
        let resp = self
            .http
            .get(url)
            .header(ACCEPT, "*/*")
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(resp).await
    }

    /// 小文件（封面）一次性读取。
    pub async fn fetch_bytes(&self, url: &str) -> AcquireResult<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .header(ACCEPT, "*/*")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = ensure_success(resp).await?;
        let bytes = resp.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

async fn send_json(req: RequestBuilder) -> AcquireResult<Value> {
    let resp = req.send().await.map_err(transport_error)?;
    let status = resp.status();
    let body = resp.bytes().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(remote_error(status, &body));
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|e| {
        AcquireError::remote(Some(status.as_u16()), format!("invalid json response: {e}"))
    })
}

async fn ensure_success(resp: Response) -> AcquireResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.unwrap_or_default();
    Err(remote_error(status, &body))
}

pub(crate) fn transport_error(err: reqwest::Error) -> AcquireError {
    AcquireError::remote(err.status().map(|s| s.as_u16()), err.to_string())
}

pub(crate) fn remote_error(status: StatusCode, body: &[u8]) -> AcquireError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| remote_message(&v))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        });
    AcquireError::remote(Some(status.as_u16()), message)
}

/// 服务端错误消息：`message` 优先，其次 `error`；嵌套对象取内层 `message`。
pub(crate) fn remote_message(body: &Value) -> Option<String> {
    let present = |v: &&Value| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    };
    let msg = body
        .get("message")
        .filter(present)
        .or_else(|| body.get("error").filter(present))?;
    Some(match msg {
        Value::String(s) => s.clone(),
        Value::Object(inner) => match inner.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => msg.to_string(),
        },
        other => other.to_string(),
    })
}

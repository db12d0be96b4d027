//! 测试用的本地借阅服务（axum），以及凭据、加密压缩包等测试夹具。

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use zip::unstable::write::FileOptionsExt;
use zip::write::SimpleFileOptions;

use crate::base_system::context::Config;

pub const VALID_TOKEN: &str = "valid-token";
pub const GOOD_REFRESH: &str = "good-refresh";
pub const MOCK_EMAIL: &str = "reader@example.id";
pub const MOCK_PASSWORD: &str = "rahasia";
pub const MOCK_USER_ID: u64 = 4242;

/// 每个慢速分块的大小与间隔。
pub const SLOW_CHUNK: usize = 1024;
const SLOW_CHUNK_DELAY: Duration = Duration::from_millis(40);

#[derive(Default)]
pub struct MockState {
    pub refresh_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
    pub loan_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub file_calls: AtomicUsize,
    details: Mutex<HashMap<String, Value>>,
    loans: Mutex<HashMap<String, Value>>,
    branches: Mutex<HashMap<String, Value>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    slow_files: Mutex<HashMap<String, usize>>,
    pub borrow_requests: Mutex<Vec<Value>>,
    pub return_requests: Mutex<Vec<Value>>,
}

pub struct MockLending {
    pub base: String,
    pub state: Arc<MockState>,
}

impl MockLending {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        state.details.lock().unwrap().insert(
            "book-1".to_string(),
            json!({
                "id": "book-1",
                "book_title": "Laskar Pelangi",
                "book_author": "Andrea Hirata",
                "publisher_name": "Bentang",
                "using_drm": false,
                "file_ext": ".epub",
                "catalog_info": {"organization_id": "org-1"}
            }),
        );

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/refresh-token", post(refresh))
            .route("/api/webhook/book-detail", get(book_detail))
            .route("/api/webhook/check-borrow-status", get(check_borrow))
            .route("/api/webhook/book-borrow-shelf", get(shelf))
            .route("/api/webhook/search-book", get(search))
            .route("/api/webhook/epustaka-borrow", get(branches))
            .route("/agent/webhook/borrow", post(borrow))
            .route("/api/webhook/book-return", put(book_return))
            .route("/files/:name", get(file))
            .route("/slow/:name", get(slow_file))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    pub fn config(&self, base_dir: &Path) -> Config {
        Config {
            api_base_url: format!("{}/api", self.base),
            agent_base_url: format!("{}/agent", self.base),
            web_origin: self.base.clone(),
            request_timeout: 10,
            ..Config::default()
        }
        .with_base_dir(base_dir)
    }

    pub fn put_detail(&self, item_id: &str, detail: Value) {
        self.state
            .details
            .lock()
            .unwrap()
            .insert(item_id.to_string(), detail);
    }

    /// `data` 为 check-borrow-status 响应中的 `data` 对象。
    pub fn put_loan(&self, item_id: &str, data: Value) {
        self.state
            .loans
            .lock()
            .unwrap()
            .insert(item_id.to_string(), data);
    }

    pub fn put_branches(&self, item_id: &str, data: Value) {
        self.state
            .branches
            .lock()
            .unwrap()
            .insert(item_id.to_string(), data);
    }

    /// 返回文件下载地址。
    pub fn put_file(&self, name: &str, bytes: Vec<u8>) -> String {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes);
        format!("{}/files/{name}", self.base)
    }

    /// 慢速文件：`chunks` 个分块，每块间隔固定延迟。
    pub fn put_slow_file(&self, name: &str, chunks: usize) -> String {
        self.state
            .slow_files
            .lock()
            .unwrap()
            .insert(name.to_string(), chunks);
        format!("{}/slow/{name}", self.base)
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.state.detail_calls.load(Ordering::SeqCst)
    }

    pub fn loan_calls(&self) -> usize {
        self.state.loan_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.state.search_calls.load(Ordering::SeqCst)
    }

    pub fn file_calls(&self) -> usize {
        self.state.file_calls.load(Ordering::SeqCst)
    }
}

pub fn expiry_in(secs: i64) -> String {
    (OffsetDateTime::now_utc() + time::Duration::seconds(secs))
        .format(&Rfc3339)
        .unwrap()
}

/// 写入一个凭据文件。
pub fn write_credentials(cfg: &Config, access: &str, refresh: Option<&str>, expired_at: &str) {
    let path = cfg.token_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut data = json!({
        "access_token": access,
        "expired_at": expired_at,
        "id": MOCK_USER_ID,
        "name": "Siti",
        "email": MOCK_EMAIL
    });
    if let Some(rt) = refresh {
        data["refresh_token"] = json!(rt);
    }
    std::fs::write(&path, serde_json::to_vec(&json!({ "data": data })).unwrap()).unwrap();
}

pub fn read_credentials(cfg: &Config) -> Value {
    serde_json::from_slice(&std::fs::read(cfg.token_path()).unwrap()).unwrap()
}

/// 用 ZipCrypto 加密每个条目；`password` 为 None 时不加密。
pub fn zip_bytes(entries: &[(&str, &[u8])], password: Option<&str>) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        let options = SimpleFileOptions::default();
        match password {
            Some(pw) => writer
                .start_file(*name, options.with_deprecated_encryption(pw.as_bytes()))
                .unwrap(),
            None => writer.start_file(*name, options).unwrap(),
        }
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn read_zip_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut buf).unwrap();
            (entry.name().to_string(), buf)
        })
        .collect()
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {VALID_TOKEN}"))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Unauthenticated."})),
    )
        .into_response()
}

async fn login(Json(body): Json<Value>) -> Response {
    if body["email"] == MOCK_EMAIL && body["password"] == MOCK_PASSWORD {
        return Json(json!({
            "status": true,
            "data": {
                "access_token": VALID_TOKEN,
                "refresh_token": GOOD_REFRESH,
                "expired_at": expiry_in(86_400),
                "id": MOCK_USER_ID,
                "name": "Siti",
                "email": MOCK_EMAIL
            }
        }))
        .into_response();
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": {"message": "Email atau password salah"}})),
    )
        .into_response()
}

async fn refresh(State(st): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    st.refresh_calls.fetch_add(1, Ordering::SeqCst);
    // 模拟慢速刷新，便于观察并发刷新是否被合并
    tokio::time::sleep(Duration::from_millis(50)).await;
    if body["refresh_token"] == GOOD_REFRESH {
        return Json(json!({
            "data": {
                "access_token": VALID_TOKEN,
                "refresh_token": "rotated-refresh",
                "expired_at": expiry_in(86_400)
            }
        }))
        .into_response();
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Refresh token tidak valid"})),
    )
        .into_response()
}

async fn book_detail(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    st.detail_calls.fetch_add(1, Ordering::SeqCst);
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    let id = q.get("book_id").cloned().unwrap_or_default();
    match st.details.lock().unwrap().get(&id) {
        Some(detail) => Json(json!({"status": true, "data": detail})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Buku tidak ditemukan"})),
        )
            .into_response(),
    }
}

async fn check_borrow(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    st.loan_calls.fetch_add(1, Ordering::SeqCst);
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    let id = q.get("book_id").cloned().unwrap_or_default();
    let data = st
        .loans
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or(Value::Null);
    Json(json!({"data": data})).into_response()
}

async fn shelf(headers: HeaderMap) -> Response {
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    Json(json!({"data": [
        {"id": "bb-1", "book_id": "book-1", "book_title": "Laskar Pelangi", "book_author": "Andrea Hirata"},
        {"id": "bb-2", "book_id": "book-2", "book_title": "Sang Pemimpi"}
    ]}))
    .into_response()
}

async fn search(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    st.search_calls.fetch_add(1, Ordering::SeqCst);
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    let query = q.get("q").cloned().unwrap_or_default();
    let offset = q.get("offset").cloned().unwrap_or_default();
    Json(json!({"data": [
        {"id": format!("s-{offset}"), "book_title": format!("{query} {offset}")}
    ]}))
    .into_response()
}

async fn branches(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    let id = q.get("book_id").cloned().unwrap_or_default();
    let data = st
        .branches
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_else(|| json!([]));
    Json(json!({"data": data})).into_response()
}

async fn borrow(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    st.borrow_requests.lock().unwrap().push(body);
    Json(json!({"message": "Berhasil meminjam buku", "data": {"borrow_book_id": "bb-new"}}))
        .into_response()
}

async fn book_return(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    st.return_requests.lock().unwrap().push(body);
    Json(json!({"message": "Buku berhasil dikembalikan"})).into_response()
}

async fn file(State(st): State<Arc<MockState>>, UrlPath(name): UrlPath<String>) -> Response {
    st.file_calls.fetch_add(1, Ordering::SeqCst);
    match st.files.lock().unwrap().get(&name) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn slow_file(State(st): State<Arc<MockState>>, UrlPath(name): UrlPath<String>) -> Response {
    st.file_calls.fetch_add(1, Ordering::SeqCst);
    let Some(chunks) = st.slow_files.lock().unwrap().get(&name).copied() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let stream = futures_util::stream::unfold(0usize, move |sent| async move {
        if sent >= chunks {
            return None;
        }
        tokio::time::sleep(SLOW_CHUNK_DELAY).await;
        let chunk = Bytes::from(vec![b'x'; SLOW_CHUNK]);
        Some((Ok::<_, std::io::Error>(chunk), sent + 1))
    });
    (
        [(CONTENT_LENGTH, (chunks * SLOW_CHUNK).to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}

/// 写一个可执行的 sh 脚本充当外部工具。
#[cfg(unix)]
pub fn fake_tool(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

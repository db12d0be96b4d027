//! 目录操作：在 HTTP 客户端之上叠加会话（令牌刷新、401 重试）与响应缓存。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use super::cache::{ResponseCache, detail_key, search_key};
use super::client::{LendingClient, LoanRequest};
use super::models::{Branch, CatalogItem, ItemSummary, LoanRecord, search_items};
use crate::auth::{SessionManager, ValidCredential};
use crate::base_system::context::Config;
use crate::error::{AcquireError, AcquireResult};

pub struct Catalog {
    session: Arc<SessionManager>,
    client: Arc<LendingClient>,
    cache: Arc<ResponseCache>,
    search_ttl: Duration,
    detail_ttl: Duration,
    page_size: usize,
    default_organization_id: String,
}

impl Catalog {
    pub fn new(cfg: &Config, session: Arc<SessionManager>, cache: Arc<ResponseCache>) -> Self {
        Self {
            client: session.client().clone(),
            session,
            cache,
            search_ttl: cfg.search_ttl(),
            detail_ttl: cfg.detail_ttl(),
            page_size: cfg.search_page_size.max(1),
            default_organization_id: cfg.default_organization_id.clone(),
        }
    }

    pub fn client(&self) -> &Arc<LendingClient> {
        &self.client
    }

    pub async fn credential(&self) -> AcquireResult<ValidCredential> {
        self.session.valid_credential().await
    }

    /// 已借书架。
    pub async fn shelf(&self) -> AcquireResult<Vec<Value>> {
        let client = &self.client;
        self.session
            .with_auth_retry(|cred| async move { client.borrowed_items(&cred.access_token).await })
            .await
    }

    pub async fn search(&self, query: &str, offset: usize) -> AcquireResult<Vec<ItemSummary>> {
        let raw = self.search_raw(query, offset).await?;
        Ok(search_items(&raw))
    }

    /// 搜索结果缓存 `search_cache_ttl` 秒。
    pub async fn search_raw(&self, query: &str, offset: usize) -> AcquireResult<Value> {
        let key = search_key(query, offset);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(target: "cache", "命中 {key}");
            return Ok(hit);
        }
        let client = &self.client;
        let limit = self.page_size;
        let raw = self
            .session
            .with_auth_retry(|cred| async move {
                client
                    .search(&cred.access_token, query, limit, offset)
                    .await
            })
            .await?;
        self.cache.set(&key, raw.clone(), self.search_ttl).await;
        Ok(raw)
    }

    /// 书籍详情（已去掉 `data` 信封），缓存 `detail_cache_ttl` 秒。
    pub async fn item_detail(&self, item_id: &str) -> AcquireResult<Value> {
        let key = detail_key(item_id);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(target: "cache", "命中 {key}");
            return Ok(hit);
        }
        let client = &self.client;
        let raw = self
            .session
            .with_auth_retry(|cred| async move {
                client.item_detail(&cred.access_token, item_id).await
            })
            .await?;
        self.cache.set(&key, raw.clone(), self.detail_ttl).await;
        Ok(raw)
    }

    pub async fn item(&self, item_id: &str) -> AcquireResult<CatalogItem> {
        let raw = self.item_detail(item_id).await?;
        CatalogItem::from_payload(raw, item_id)
    }

    /// 借阅状态，每次下载重新获取，不缓存。
    pub async fn loan(&self, item_id: &str) -> AcquireResult<LoanRecord> {
        let client = &self.client;
        let raw = self
            .session
            .with_auth_retry(|cred| async move {
                client.loan_info(&cred.access_token, item_id).await
            })
            .await?;
        LoanRecord::from_payload(&raw, item_id)
    }

    pub async fn branches(&self, item_id: &str) -> AcquireResult<Vec<Branch>> {
        let client = &self.client;
        let raw = self
            .session
            .with_auth_retry(|cred| async move {
                client.branches(&cred.access_token, item_id).await
            })
            .await?;
        Ok(Branch::list_from_payload(&raw))
    }

    /// 借书：取第一个可借馆；机构 ID 依次取详情、借阅馆、配置默认值。
    pub async fn borrow(&self, item_id: &str) -> AcquireResult<Value> {
        let item = self.item(item_id).await?;
        let branch = self
            .branches(item_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AcquireError::NoLoanAvailable(item_id.to_string()))?;

        let organization_id = item
            .organization_id
            .clone()
            .or_else(|| branch.organization_id.clone())
            .unwrap_or_else(|| self.default_organization_id.clone());

        let client = &self.client;
        let branch_id = branch.id.as_str();
        let organization_id = organization_id.as_str();
        let result = self
            .session
            .with_auth_retry(|cred| async move {
                let payload = LoanRequest {
                    epustaka_id: branch_id.to_string(),
                    user_id: cred.user_id.0.clone(),
                    book_id: item_id.to_string(),
                    organization_id: organization_id.to_string(),
                };
                client.create_loan(&cred.access_token, &payload).await
            })
            .await?;
        info!(target: "catalog", "已借阅《{}》（馆 {}）", item.title, branch.id);
        Ok(result)
    }

    /// 归还；`borrow_book_id` 为书架条目中的借阅记录 ID。
    pub async fn release(&self, borrow_book_id: &str) -> AcquireResult<Value> {
        let client = &self.client;
        let result = self
            .session
            .with_auth_retry(|cred| async move {
                client.release_loan(&cred.access_token, borrow_book_id).await
            })
            .await?;
        info!(target: "catalog", "已归还借阅 {borrow_book_id}");
        Ok(result)
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential_store::CredentialStore;
    use crate::test_support::{
        GOOD_REFRESH, MockLending, VALID_TOKEN, expiry_in, write_credentials,
    };
    use serde_json::json;

    fn catalog_for(cfg: &Config) -> Catalog {
        let client = Arc::new(LendingClient::new(cfg).unwrap());
        let session = Arc::new(SessionManager::new(
            CredentialStore::new(cfg.token_path()),
            client,
            cfg.refresh_margin(),
        ));
        Catalog::new(cfg, session, Arc::new(ResponseCache::in_memory()))
    }

    async fn logged_in() -> (MockLending, tempfile::TempDir, Config) {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, VALID_TOKEN, Some(GOOD_REFRESH), &expiry_in(3600));
        (mock, dir, cfg)
    }

    #[tokio::test]
    async fn detail_and_search_are_cached() {
        let (mock, _dir, cfg) = logged_in().await;
        let catalog = catalog_for(&cfg);

        let a = catalog.item("book-1").await.unwrap();
        let b = catalog.item("book-1").await.unwrap();
        assert_eq!(a.title, "Laskar Pelangi");
        assert_eq!(b.title, a.title);
        assert_eq!(mock.detail_calls(), 1);

        let page0 = catalog.search("pelangi", 0).await.unwrap();
        catalog.search("pelangi", 0).await.unwrap();
        let page1 = catalog.search("pelangi", 25).await.unwrap();
        assert_eq!(page0[0].title, "pelangi 0");
        assert_eq!(page1[0].id, "s-25");
        assert_eq!(mock.search_calls(), 2);
    }

    #[tokio::test]
    async fn protected_calls_require_login() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_for(&mock.config(dir.path()));
        assert!(matches!(
            catalog.shelf().await,
            Err(AcquireError::NotAuthenticated)
        ));
        assert_eq!(mock.detail_calls(), 0);
    }

    #[tokio::test]
    async fn borrow_uses_first_branch_and_detail_organization() {
        let (mock, _dir, cfg) = logged_in().await;
        mock.put_branches(
            "book-1",
            json!([{"id": "ep-1", "organization_id": "org-branch"}, {"id": "ep-2"}]),
        );
        let catalog = catalog_for(&cfg);

        catalog.borrow("book-1").await.unwrap();
        let sent = mock.state.borrow_requests.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![json!({
                "epustaka_id": "ep-1",
                "user_id": 4242,
                "book_id": "book-1",
                "organization_id": "org-1"
            })]
        );
    }

    #[tokio::test]
    async fn borrow_falls_back_to_branch_then_default_organization() {
        let (mock, _dir, cfg) = logged_in().await;
        mock.put_detail("book-9", json!({"id": "book-9", "book_title": "Tanpa Org"}));
        mock.put_branches("book-9", json!({"id": "ep-9", "organization_id": "org-branch"}));
        mock.put_detail("book-10", json!({"id": "book-10", "book_title": "Tanpa Apa-apa"}));
        mock.put_branches("book-10", json!([{"id": "ep-10"}]));
        let catalog = catalog_for(&cfg);

        catalog.borrow("book-9").await.unwrap();
        catalog.borrow("book-10").await.unwrap();
        let sent = mock.state.borrow_requests.lock().unwrap().clone();
        assert_eq!(sent[0]["organization_id"], "org-branch");
        assert_eq!(sent[1]["organization_id"], cfg.default_organization_id.as_str());
    }

    #[tokio::test]
    async fn borrow_without_branch_fails() {
        let (mock, _dir, cfg) = logged_in().await;
        let catalog = catalog_for(&cfg);
        assert!(matches!(
            catalog.borrow("book-1").await,
            Err(AcquireError::NoLoanAvailable(id)) if id == "book-1"
        ));
        assert!(mock.state.borrow_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shelf_and_return() {
        let (mock, _dir, cfg) = logged_in().await;
        let catalog = catalog_for(&cfg);

        let shelf = catalog.shelf().await.unwrap();
        assert_eq!(shelf.len(), 2);

        catalog.release("bb-1").await.unwrap();
        assert_eq!(
            mock.state.return_requests.lock().unwrap().clone(),
            vec![json!({"borrow_book_id": "bb-1"})]
        );
    }
}

//! 会话管理：在每次受保护调用前保证访问令牌有效。
//!
//! 两条路径共用同一个刷新入口 [`SessionManager::refresh_stale`]：
//! - 主动：`valid_credential` 发现令牌将在安全边距内过期时刷新；
//! - 被动：`with_auth_retry` 收到一次 401 后刷新并重试一次。
//!
//! 刷新由异步锁串行化，拿到锁后重新读取凭据文件；若其他任务已完成刷新则直接复用，
//! 因此同一个过期令牌只会触发一次刷新请求。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::credential_store::{CredentialFile, CredentialRecord, CredentialStore, IssuedTokens, UserId};
use crate::error::{AcquireError, AcquireResult};
use crate::remote::client::LendingClient;

/// 一次受保护调用所需的凭据。
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCredential {
    pub access_token: String,
    pub user_id: UserId,
}

impl From<&CredentialRecord> for ValidCredential {
    fn from(rec: &CredentialRecord) -> Self {
        Self {
            access_token: rec.access_token.clone(),
            user_id: rec.id.clone(),
        }
    }
}

pub struct SessionManager {
    store: CredentialStore,
    client: Arc<LendingClient>,
    margin: Duration,
    refresh_gate: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: CredentialStore, client: Arc<LendingClient>, margin: Duration) -> Self {
        Self {
            store,
            client,
            margin,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<LendingClient> {
        &self.client
    }

    pub async fn valid_credential(&self) -> AcquireResult<ValidCredential> {
        Ok(self.checked_credential().await?.0)
    }

    /// 返回可用凭据，以及它是否刚经过刷新。
    async fn checked_credential(&self) -> AcquireResult<(ValidCredential, bool)> {
        let file = self
            .store
            .load()
            .await?
            .ok_or(AcquireError::NotAuthenticated)?;
        if !file.data.is_expired(OffsetDateTime::now_utc(), self.margin) {
            return Ok((ValidCredential::from(&file.data), false));
        }
        debug!(target: "auth", "访问令牌即将过期，尝试刷新");
        let fresh = self.refresh_stale(&file.data.access_token, false).await?;
        Ok((fresh, true))
    }

    /// 刷新 `stale` 令牌。`force` 为 true 时即使本地认为未过期也刷新（服务端已拒绝该令牌）。
    pub async fn refresh_stale(&self, stale: &str, force: bool) -> AcquireResult<ValidCredential> {
        let _gate = self.refresh_gate.lock().await;

        let mut file = self
            .store
            .load()
            .await?
            .ok_or(AcquireError::NotAuthenticated)?;
        let expired = file.data.is_expired(OffsetDateTime::now_utc(), self.margin);
        let replaced = file.data.access_token != stale;
        if !expired && (replaced || !force) {
            debug!(target: "auth", "令牌已被其他任务刷新，直接复用");
            return Ok(ValidCredential::from(&file.data));
        }

        let Some(refresh_token) = file.data.refresh_token.clone() else {
            warn!(target: "auth", "没有可用的 refresh_token，需要重新登录");
            return Err(AcquireError::SessionExpired);
        };

        info!(target: "auth", "正在刷新访问令牌");
        let issued = match self.client.refresh(&refresh_token).await {
            Ok(raw) => IssuedTokens::from_payload(&raw),
            Err(e) => {
                warn!(target: "auth", "刷新令牌失败: {e}");
                return Err(AcquireError::SessionExpired);
            }
        };
        let Some(issued) = issued else {
            warn!(target: "auth", "刷新响应中缺少 access_token");
            return Err(AcquireError::SessionExpired);
        };

        file.data.apply_refresh(issued);
        self.store.save(&file).await?;
        info!(target: "auth", "访问令牌已刷新");
        Ok(ValidCredential::from(&file.data))
    }

    /// 执行受保护调用；遇到 401 时刷新一次并重试一次，重试仍为 401 则视为会话失效。
    pub async fn with_auth_retry<T, F, Fut>(&self, call: F) -> AcquireResult<T>
    where
        F: Fn(ValidCredential) -> Fut,
        Fut: Future<Output = AcquireResult<T>>,
    {
        let (cred, just_refreshed) = self.checked_credential().await?;
        let stale = cred.access_token.clone();
        match call(cred).await {
            // 刚换来的令牌仍被拒绝，再刷新也无济于事
            Err(e) if e.is_unauthorized() && just_refreshed => Err(AcquireError::SessionExpired),
            Err(e) if e.is_unauthorized() => {
                debug!(target: "auth", "收到 401，刷新后重试一次");
                let fresh = self.refresh_stale(&stale, true).await?;
                match call(fresh).await {
                    Err(e) if e.is_unauthorized() => Err(AcquireError::SessionExpired),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// 登录并原样保存服务端响应。
    pub async fn login(&self, email: &str, password: &str) -> AcquireResult<CredentialRecord> {
        let raw = self.client.login(email, password).await?;
        let file: CredentialFile = serde_json::from_value::<CredentialFile>(raw.clone())
            .ok()
            .filter(|f| !f.data.access_token.is_empty())
            .ok_or_else(|| AcquireError::remote(None, "login response has no access_token"))?;
        self.store.save_raw(&raw).await?;
        info!(
            target: "auth",
            "登录成功：{}",
            file.data.login_id().unwrap_or(email)
        );
        Ok(file.data)
    }

    pub async fn logout(&self) -> AcquireResult<bool> {
        let removed = self.store.clear().await?;
        if removed {
            info!(target: "auth", "已登出");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        GOOD_REFRESH, MOCK_EMAIL, MOCK_PASSWORD, MockLending, VALID_TOKEN, expiry_in,
        read_credentials, write_credentials,
    };

    fn session_for(cfg: &crate::base_system::context::Config) -> SessionManager {
        let client = Arc::new(LendingClient::new(cfg).unwrap());
        SessionManager::new(
            CredentialStore::new(cfg.token_path()),
            client,
            cfg.refresh_margin(),
        )
    }

    #[tokio::test]
    async fn missing_file_is_not_authenticated() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let session = session_for(&mock.config(dir.path()));
        assert!(matches!(
            session.valid_credential().await,
            Err(AcquireError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn fresh_token_is_used_without_refresh() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, VALID_TOKEN, Some(GOOD_REFRESH), &expiry_in(3600));

        let cred = session_for(&cfg).valid_credential().await.unwrap();
        assert_eq!(cred.access_token, VALID_TOKEN);
        assert_eq!(cred.user_id.as_text(), "4242");
        assert_eq!(mock.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn near_expiry_refreshes_exactly_once() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, "old-token", Some(GOOD_REFRESH), &expiry_in(30));
        let session = Arc::new(session_for(&cfg));

        let (a, b) = tokio::join!(session.valid_credential(), session.valid_credential());
        assert_eq!(a.unwrap().access_token, VALID_TOKEN);
        assert_eq!(b.unwrap().access_token, VALID_TOKEN);
        assert_eq!(mock.refresh_calls(), 1);

        let stored = read_credentials(&cfg);
        assert_eq!(stored["data"]["access_token"], VALID_TOKEN);
        assert_eq!(stored["data"]["refresh_token"], "rotated-refresh");
        assert_eq!(stored["data"]["id"], 4242);
        assert_eq!(stored["data"]["name"], "Siti");
    }

    #[tokio::test]
    async fn rejected_refresh_is_session_expired() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, "old-token", Some("revoked"), &expiry_in(-10));

        assert!(matches!(
            session_for(&cfg).valid_credential().await,
            Err(AcquireError::SessionExpired)
        ));
        assert_eq!(mock.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_session_expired() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, "old-token", None, &expiry_in(-10));

        assert!(matches!(
            session_for(&cfg).valid_credential().await,
            Err(AcquireError::SessionExpired)
        ));
        assert_eq!(mock.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn unauthorized_call_is_retried_once_after_refresh() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        // 本地认为未过期，但服务端已拒绝
        write_credentials(&cfg, "revoked-token", Some(GOOD_REFRESH), &expiry_in(3600));
        let session = session_for(&cfg);
        let client = session.client().clone();

        let detail = session
            .with_auth_retry(|cred| {
                let client = client.clone();
                async move { client.item_detail(&cred.access_token, "book-1").await }
            })
            .await
            .unwrap();
        assert_eq!(detail["book_title"], "Laskar Pelangi");
        assert_eq!(mock.refresh_calls(), 1);
        assert_eq!(mock.detail_calls(), 2);
    }

    #[tokio::test]
    async fn second_unauthorized_becomes_session_expired() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, VALID_TOKEN, Some(GOOD_REFRESH), &expiry_in(3600));
        let session = session_for(&cfg);

        let result: AcquireResult<()> = session
            .with_auth_retry(|_| async { Err(AcquireError::remote(Some(401), "nope")) })
            .await;
        assert!(matches!(result, Err(AcquireError::SessionExpired)));
        assert_eq!(mock.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn proactive_refresh_is_not_repeated_on_unauthorized() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        write_credentials(&cfg, "old-token", Some(GOOD_REFRESH), &expiry_in(-10));
        let session = session_for(&cfg);

        let result: AcquireResult<()> = session
            .with_auth_retry(|cred| async move {
                assert_eq!(cred.access_token, VALID_TOKEN);
                Err(AcquireError::remote(Some(401), "nope"))
            })
            .await;
        assert!(matches!(result, Err(AcquireError::SessionExpired)));
        assert_eq!(mock.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn login_then_logout() {
        let mock = MockLending::start().await;
        let dir = tempfile::tempdir().unwrap();
        let cfg = mock.config(dir.path());
        let session = session_for(&cfg);

        let err = session.login(MOCK_EMAIL, "salah").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(!cfg.token_path().exists());

        let user = session.login(MOCK_EMAIL, MOCK_PASSWORD).await.unwrap();
        assert_eq!(user.name.as_deref(), Some("Siti"));
        assert_eq!(read_credentials(&cfg)["status"], true);
        assert_eq!(
            session.valid_credential().await.unwrap().access_token,
            VALID_TOKEN
        );

        assert!(session.logout().await.unwrap());
        assert!(matches!(
            session.valid_credential().await,
            Err(AcquireError::NotAuthenticated)
        ));
    }
}

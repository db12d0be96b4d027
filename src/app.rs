//! 组装运行时组件：HTTP 客户端、会话、缓存、目录、书库与获取队列。

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::auth::SessionManager;
use crate::auth::credential_store::CredentialStore;
use crate::base_system::context::Config;
use crate::base_system::file_cleaner::purge_partial_downloads;
use crate::download::{Acquirer, AcquisitionQueue};
use crate::error::AcquireResult;
use crate::library::LibraryIndex;
use crate::remote::Catalog;
use crate::remote::cache::ResponseCache;
use crate::remote::client::LendingClient;

pub struct App {
    pub config: Config,
    pub session: Arc<SessionManager>,
    pub catalog: Arc<Catalog>,
    pub library: LibraryIndex,
    pub queue: AcquisitionQueue<Acquirer>,
}

impl App {
    pub fn new(config: Config) -> AcquireResult<Self> {
        let purged = purge_partial_downloads(&config.temp_path());
        if purged > 0 {
            info!(target: "cleanup", "清除 {purged} 个残留的 .part 文件");
        }

        let client = Arc::new(LendingClient::new(&config)?);
        let session = Arc::new(SessionManager::new(
            CredentialStore::new(config.token_path()),
            client,
            config.refresh_margin(),
        ));
        let cache = Arc::new(ResponseCache::load(config.cache_path()));
        let catalog = Arc::new(Catalog::new(&config, session.clone(), cache));
        let library = LibraryIndex::new(config.books_path());
        let queue = AcquisitionQueue::new(
            Acquirer::new(&config, catalog.clone(), library.clone()),
            config.concurrency_limit(),
        );
        info!(
            target: "startup",
            "数据目录 {}，并发上限 {}",
            config.base_dir().display(),
            queue.limit()
        );

        Ok(Self {
            config,
            session,
            catalog,
            library,
            queue,
        })
    }

    /// 已借书架，附带本地下载状态。
    pub async fn synced_shelf(&self) -> AcquireResult<Vec<Value>> {
        let shelf = self.catalog.shelf().await?;
        Ok(self.library.sync_with_remote(shelf).await)
    }
}

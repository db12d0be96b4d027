//! 单本书的获取流程。
//!
//! 本地已有 → 凭据 → 详情 → 借阅信息 → 元数据/封面 → 下载 → （DRM）解包 → 放入书库。
//!
//! 每个阶段前检查取消令牌，所有远端请求都与令牌竞争。中间产物：
//! - `.part` 由下载模块负责；
//! - 压缩包层解出的中间文件由 [`TempPath`] 持有，任何失败都会删除；
//! - 完整下载的容器文件在解包失败时保留，作为下次重试的下载缓存，成功后删除。

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetch::fetch_to_file;
use super::models::{AcquiredFile, JobState};
use super::progress::ProgressReporter;
use super::queue::JobRunner;
use crate::base_system::book_paths::{
    COVER_FILE, META_FILE, book_folder_path, decrypted_file_name, extension_of, move_file, safe_name,
};
use crate::base_system::context::Config;
use crate::base_system::file_cleaner::remove_file_quietly;
use crate::drm::archive::unwrap_archive;
use crate::drm::document::unwrap_document;
use crate::drm::keys::derive_keys;
use crate::drm::VENDOR_CONTAINER_EXT;
use crate::error::{AcquireError, AcquireResult, UnwrapStage};
use crate::library::index::{LibraryIndex, find_in_folder};
use crate::remote::Catalog;
use crate::remote::models::{CatalogItem, LoanRecord};

/// 下载地址没有扩展名时的默认值。
const DEFAULT_DOWNLOAD_EXT: &str = "pdf";

pub struct Acquirer {
    catalog: Arc<Catalog>,
    library: LibraryIndex,
    books_dir: PathBuf,
    temp_dir: PathBuf,
    document_tool: PathBuf,
    save_cover: bool,
    archive_sha512: bool,
}

fn ensure_live(cancel: &CancellationToken) -> AcquireResult<()> {
    if cancel.is_cancelled() {
        Err(AcquireError::Cancelled)
    } else {
        Ok(())
    }
}

async fn or_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = AcquireResult<T>>,
) -> AcquireResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcquireError::Cancelled),
        r = fut => r,
    }
}

/// 下载地址路径部分的扩展名（小写，不含点）。
pub fn url_extension(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .map(|u| extension_of(Path::new(u.path())))
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_DOWNLOAD_EXT.to_string())
}

impl Acquirer {
    pub fn new(cfg: &Config, catalog: Arc<Catalog>, library: LibraryIndex) -> Self {
        Self {
            catalog,
            library,
            books_dir: cfg.books_path(),
            temp_dir: cfg.temp_path(),
            document_tool: cfg.document_tool_path(),
            save_cover: cfg.save_cover,
            archive_sha512: cfg.archive_password_sha512,
        }
    }

    pub async fn acquire(
        &self,
        item_id: &str,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> AcquireResult<AcquiredFile> {
        ensure_live(cancel)?;

        if let Some(book) = self.library.find_by_item_id(item_id).await {
            info!(target: "download", "{item_id} 已在书库中: {}", book.path.display());
            return Ok(AcquiredFile::new(book.path, true));
        }

        let cred = self.catalog.credential().await?;
        reporter
            .stage(JobState::Starting, 0, "Fetching book detail...")
            .await;
        let item = or_cancel(cancel, self.catalog.item(item_id)).await?;

        let safe = safe_name(&item.title);
        let folder = book_folder_path(&self.books_dir, &item.title);
        if let Some(existing) = find_in_folder(&folder) {
            info!(target: "download", "{item_id} 已存在同名书籍: {}", existing.display());
            return Ok(AcquiredFile::new(existing, true));
        }

        let loan = or_cancel(cancel, self.catalog.loan(item_id)).await?;
        ensure_live(cancel)?;

        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|e| AcquireError::io(&folder, e))?;
        self.save_metadata(&folder, &item, &loan, reporter, cancel)
            .await?;
        ensure_live(cancel)?;

        let ext = url_extension(&loan.file_url);
        let download_path = self.temp_dir.join(format!("{safe}.{ext}"));
        let fetched = fetch_to_file(
            self.catalog.client(),
            &loan.file_url,
            &download_path,
            reporter,
            cancel,
        )
        .await?;
        debug!(
            target: "download",
            "{item_id} 文件 {} 字节，复用缓存: {}",
            fetched.bytes,
            fetched.reused
        );
        ensure_live(cancel)?;

        if !item.using_drm {
            let final_path = folder.join(decrypted_file_name(&safe, &ext));
            reporter
                .stage(JobState::Finalizing, 99, "Moving to library...")
                .await;
            move_file(&fetched.path, &final_path)
                .await
                .map_err(|e| AcquireError::io(&final_path, e))?;
            return Ok(AcquiredFile::new(final_path, false));
        }

        let user_id = cred.user_id.as_text();
        let final_path = self
            .unwrap_protected(
                &item,
                &loan,
                &user_id,
                &fetched.path,
                &folder,
                &safe,
                reporter,
                cancel,
            )
            .await?;
        remove_file_quietly(&fetched.path).await;
        Ok(AcquiredFile::new(final_path, false))
    }

    /// 写 `meta.json` 与封面。两者失败都只记日志；取消照常传播。
    async fn save_metadata(
        &self,
        folder: &Path,
        item: &CatalogItem,
        loan: &LoanRecord,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> AcquireResult<()> {
        let meta_path = folder.join(META_FILE);
        match serde_json::to_vec_pretty(&item.raw) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&meta_path, bytes).await {
                    warn!(target: "download", "写入 {} 失败: {e}", meta_path.display());
                }
            }
            Err(e) => warn!(target: "download", "序列化详情失败: {e}"),
        }

        let cover_path = folder.join(COVER_FILE);
        let cover_url = loan.cover_url.as_ref().or(item.cover_url.as_ref());
        let Some(url) = cover_url.filter(|_| self.save_cover) else {
            return Ok(());
        };
        if tokio::fs::try_exists(&cover_path).await.unwrap_or(false) {
            return Ok(());
        }

        reporter
            .stage(JobState::Starting, 0, "Downloading cover...")
            .await;
        match or_cancel(cancel, self.catalog.client().fetch_bytes(url)).await {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&cover_path, bytes).await {
                    warn!(target: "download", "写入封面失败: {e}");
                }
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => warn!(target: "download", "封面下载失败 {url}: {e}"),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn unwrap_protected(
        &self,
        item: &CatalogItem,
        loan: &LoanRecord,
        user_id: &str,
        downloaded: &Path,
        folder: &Path,
        safe: &str,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> AcquireResult<PathBuf> {
        reporter
            .stage(JobState::Unwrapping, 99, "Extracting DRM credentials...")
            .await;
        let borrow_key = loan.borrow_key.as_deref().ok_or_else(|| {
            AcquireError::unwrap_failed(UnwrapStage::KeyDerivation, "loan carries no borrow key")
        })?;
        let keys = derive_keys(user_id, &item.id, &loan.branch_id, borrow_key, self.archive_sha512)?;
        debug!(target: "drm", "{} 密钥派生完成", item.id);

        // 压缩包层解出的中间文件，函数返回时删除
        let mut intermediate: Option<TempPath> = None;
        let mut target = downloaded.to_path_buf();

        if extension_of(downloaded) == VENDOR_CONTAINER_EXT {
            ensure_live(cancel)?;
            reporter
                .stage(JobState::Unwrapping, 99, "Unlocking container...")
                .await;
            let input = downloaded.to_path_buf();
            let out_dir = self.temp_dir.clone();
            let password = keys.archive_password.clone();
            let entry_id = item.id.clone();
            let token = cancel.clone();
            let out = tokio::task::spawn_blocking(move || {
                unwrap_archive(&input, &password, &entry_id, &out_dir, &token)
            })
            .await
            .map_err(|e| AcquireError::unwrap_failed(UnwrapStage::Archive, e.to_string()))??;
            intermediate =
                Some(TempPath::try_from_path(&out).map_err(|e| AcquireError::io(&out, e))?);
            target = out;
        }
        ensure_live(cancel)?;

        let target_ext = extension_of(&target);
        let final_path = folder.join(decrypted_file_name(safe, &target_ext));
        if target_ext == "pdf" {
            reporter
                .stage(JobState::Unwrapping, 99, "Removing PDF protection...")
                .await;
            unwrap_document(
                &self.document_tool,
                &keys.document_password,
                &target,
                &final_path,
                cancel,
            )
            .await?;
        } else {
            reporter
                .stage(JobState::Finalizing, 99, "Moving to library...")
                .await;
            move_file(&target, &final_path)
                .await
                .map_err(|e| AcquireError::io(&final_path, e))?;
        }
        drop(intermediate);
        info!(target: "drm", "{} 解包完成 -> {}", item.id, final_path.display());
        Ok(final_path)
    }
}

impl JobRunner for Acquirer {
    fn run(
        &self,
        item_id: String,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> impl Future<Output = AcquireResult<AcquiredFile>> + Send {
        async move { self.acquire(&item_id, &reporter, &cancel).await }
    }
}

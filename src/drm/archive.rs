//! 压缩包层解密（ZipCrypto）。
//!
//! - 含顶层 `mimetype` 条目：视为 EPUB 容器，逐条解密后重新打包，单条失败只记警告并跳过；
//! - 否则视为单文件包装：取名称包含条目 ID 的那一项（只有一项时直接取），
//!   解密后按修正后的扩展名写出（`.moco` → `.pdf`）。
//!
//! zip 读写是同步 I/O，调用方应放在 `spawn_blocking` 中执行。

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{EPUB_MIMETYPE_ENTRY, VENDOR_DOCUMENT_EXT};
use crate::base_system::book_paths::safe_name;
use crate::error::{AcquireError, AcquireResult, UnwrapStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveLayout {
    /// EPUB 结构，需要整体重打包
    Packaged,
    /// 单个文档文件
    SingleFile,
}

fn archive_err(message: impl Into<String>) -> AcquireError {
    AcquireError::unwrap_failed(UnwrapStage::Archive, message)
}

fn check_cancel(cancel: &CancellationToken) -> AcquireResult<()> {
    if cancel.is_cancelled() {
        Err(AcquireError::Cancelled)
    } else {
        Ok(())
    }
}

/// 解密 `input`，结果写入 `out_dir/<item_id>.<ext>`，返回输出路径。
/// 出错时不会留下半成品输出。
pub fn unwrap_archive(
    input: &Path,
    password: &str,
    item_id: &str,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> AcquireResult<PathBuf> {
    let file = File::open(input).map_err(|e| AcquireError::io(input, e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| archive_err(format!("not a zip container: {e}")))?;

    let names: Vec<String> = (0..archive.len())
        .map(|i| {
            archive
                .by_index_raw(i)
                .map(|f| f.name().to_string())
                .map_err(|e| archive_err(format!("unreadable entry #{i}: {e}")))
        })
        .collect::<AcquireResult<_>>()?;

    let layout = if names.iter().any(|n| n == EPUB_MIMETYPE_ENTRY) {
        ArchiveLayout::Packaged
    } else {
        ArchiveLayout::SingleFile
    };
    debug!(target: "drm", "{} 条目数 {}，布局 {:?}", input.display(), names.len(), layout);

    std::fs::create_dir_all(out_dir).map_err(|e| AcquireError::io(out_dir, e))?;
    let stem = safe_name(item_id);
    match layout {
        ArchiveLayout::Packaged => {
            repack(&mut archive, &names, password, &out_dir.join(format!("{stem}.epub")), cancel)
        }
        ArchiveLayout::SingleFile => {
            extract_single(&mut archive, &names, password, item_id, out_dir, &stem, cancel)
        }
    }
}

// 条目头里的大小来自远端文件，预分配不能直接信任
const MAX_PREALLOC: u64 = 64 << 20;

fn prealloc_len(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

fn read_entry(archive: &mut ZipArchive<File>, index: usize, password: &str) -> Result<Vec<u8>, String> {
    let mut entry = archive
        .by_index_decrypt(index, password.as_bytes())
        .map_err(|e| e.to_string())?;
    let mut buf = Vec::with_capacity(prealloc_len(entry.size()));
    // 密码错误时 CRC 校验会在读到末尾时失败
    entry.read_to_end(&mut buf).map_err(|e| e.to_string())?;
    Ok(buf)
}

fn repack(
    archive: &mut ZipArchive<File>,
    names: &[String],
    password: &str,
    out_path: &Path,
    cancel: &CancellationToken,
) -> AcquireResult<PathBuf> {
    let out_dir = out_path.parent().unwrap_or(Path::new("."));
    let tmp = NamedTempFile::new_in(out_dir).map_err(|e| AcquireError::io(out_dir, e))?;
    let mut writer = ZipWriter::new(tmp);

    let mut written = 0usize;
    let mut skipped = Vec::new();
    for (index, name) in names.iter().enumerate() {
        check_cancel(cancel)?;
        if name.ends_with('/') {
            writer
                .add_directory(name.as_str(), SimpleFileOptions::default())
                .map_err(|e| archive_err(e.to_string()))?;
            continue;
        }
        let data = match read_entry(archive, index, password) {
            Ok(d) => d,
            Err(e) => {
                warn!(target: "drm", "条目 {name} 解密失败，已跳过: {e}");
                skipped.push(name.clone());
                continue;
            }
        };
        // mimetype 必须不压缩
        let method = if name == EPUB_MIMETYPE_ENTRY {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        writer
            .start_file(name.as_str(), SimpleFileOptions::default().compression_method(method))
            .and_then(|_| writer.write_all(&data).map_err(Into::into))
            .map_err(|e| archive_err(format!("repack {name}: {e}")))?;
        written += 1;
    }

    if written == 0 && !skipped.is_empty() {
        return Err(archive_err("archive password rejected for every entry"));
    }

    let tmp = writer
        .finish()
        .map_err(|e| archive_err(format!("finish repack: {e}")))?;
    tmp.persist(out_path)
        .map_err(|e| AcquireError::io(out_path, e.error))?;
    info!(
        target: "drm",
        "EPUB 重打包完成：{written} 个条目，跳过 {}",
        skipped.len()
    );
    Ok(out_path.to_path_buf())
}

fn extract_single(
    archive: &mut ZipArchive<File>,
    names: &[String],
    password: &str,
    item_id: &str,
    out_dir: &Path,
    stem: &str,
    cancel: &CancellationToken,
) -> AcquireResult<PathBuf> {
    let index = names
        .iter()
        .position(|n| n.contains(item_id) || names.len() == 1)
        .ok_or_else(|| archive_err(format!("no entry for item {item_id} in archive")))?;
    let name = &names[index];

    check_cancel(cancel)?;
    let data = read_entry(archive, index, password)
        .map_err(|e| archive_err(format!("decrypt {name}: {e}")))?;

    let ext = match Path::new(name).extension().and_then(|s| s.to_str()) {
        Some(e) if e.eq_ignore_ascii_case(VENDOR_DOCUMENT_EXT) => "pdf".to_string(),
        Some(e) => e.to_string(),
        None => String::new(),
    };
    let out_path = if ext.is_empty() {
        out_dir.join(stem)
    } else {
        out_dir.join(format!("{stem}.{ext}"))
    };

    let mut tmp = NamedTempFile::new_in(out_dir).map_err(|e| AcquireError::io(out_dir, e))?;
    tmp.write_all(&data)
        .and_then(|_| tmp.flush())
        .map_err(|e| AcquireError::io(tmp.path(), e))?;
    tmp.persist(&out_path)
        .map_err(|e| AcquireError::io(&out_path, e.error))?;
    info!(target: "drm", "已解出 {name} -> {}", out_path.display());
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{read_zip_entries, zip_bytes};

    const PW: &str = "224d28674f9f0b96ddc420f483af75ffef26cdd465af75";

    fn write_input(dir: &Path, bytes: Vec<u8>) -> PathBuf {
        let p = dir.join("input.mdrm");
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[test]
    fn declared_entry_size_does_not_drive_allocation() {
        assert_eq!(prealloc_len(4096), 4096);
        assert_eq!(prealloc_len(u64::MAX), (64 << 20) as usize);
    }

    #[test]
    fn single_entry_is_decrypted_and_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = b"%PDF-1.7 protected body".to_vec();
        let input = write_input(dir.path(), zip_bytes(&[("ignored-name.moco", pdf.as_slice())], Some(PW)));

        let out = unwrap_archive(&input, PW, "9f1c-book", &dir.path().join("out"), &CancellationToken::new())
            .unwrap();
        assert_eq!(out, dir.path().join("out/9f1c-book.pdf"));
        assert_eq!(std::fs::read(&out).unwrap(), pdf);
    }

    #[test]
    fn entry_matching_item_id_is_chosen() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            zip_bytes(
                &[("readme.txt", &b"hello"[..]), ("books/9f1c-book.epub", &b"EPUBDATA"[..])],
                Some(PW),
            ),
        );
        let out = unwrap_archive(&input, PW, "9f1c-book", dir.path(), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.file_name().unwrap(), "9f1c-book.epub");
        assert_eq!(std::fs::read(&out).unwrap(), &b"EPUBDATA"[..]);
    }

    #[test]
    fn packaged_container_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<(&str, &[u8])> = vec![
            ("mimetype", &b"application/epub+zip"[..]),
            ("META-INF/container.xml", &b"<container/>"[..]),
            ("OEBPS/chapter1.xhtml", &b"<html>Bab 1</html>"[..]),
        ];
        let input = write_input(dir.path(), zip_bytes(&entries, Some(PW)));

        let out = unwrap_archive(&input, PW, "9f1c-book", dir.path(), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.file_name().unwrap(), "9f1c-book.epub");

        let got = read_zip_entries(&out);
        let want: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|(n, d)| (n.to_string(), d.to_vec()))
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn wrong_password_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        let input = write_input(dir.path(), zip_bytes(&[("a.moco", &b"secret"[..])], Some(PW)));

        let err = unwrap_archive(&input, "wrong", "x", &out_dir, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            AcquireError::UnwrapFailed { stage: UnwrapStage::Archive, .. }
        ));
        assert_eq!(std::fs::read_dir(&out_dir).unwrap().count(), 0);
    }

    #[test]
    fn missing_entry_and_non_zip_fail() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            zip_bytes(&[("a.moco", &b"1"[..]), ("b.moco", &b"2"[..])], None),
        );
        assert!(unwrap_archive(&input, PW, "zzz", dir.path(), &CancellationToken::new()).is_err());

        let junk = write_input(dir.path(), b"not a zip".to_vec());
        assert!(unwrap_archive(&junk, PW, "a", dir.path(), &CancellationToken::new()).is_err());
    }

    #[test]
    fn cancelled_before_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), zip_bytes(&[("a.moco", &b"1"[..])], Some(PW)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            unwrap_archive(&input, PW, "a", dir.path(), &cancel),
            Err(AcquireError::Cancelled)
        ));
    }
}

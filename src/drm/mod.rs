//! 借阅文件的两层保护：压缩包层（ZipCrypto）与文档层（PDF 密码）。

pub mod archive;
pub mod document;
pub mod keys;

/// 厂商容器扩展名，需先做压缩包层解密。
pub const VENDOR_CONTAINER_EXT: &str = "mdrm";
/// 容器内的厂商文档扩展名，实际为 PDF。
pub const VENDOR_DOCUMENT_EXT: &str = "moco";
pub const EPUB_MIMETYPE_ENTRY: &str = "mimetype";

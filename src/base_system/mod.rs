//! 基础设施：配置、日志、路径命名、JSON 容错读取、临时文件清理。

pub mod book_paths;
pub mod config;
pub mod context;
pub mod file_cleaner;
pub mod json_extract;
pub mod logging;

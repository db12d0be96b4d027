//! 获取流程模块入口。
//!
//! 子模块：
//! - `models`    — 任务状态、进度事件、状态快照
//! - `progress`  — 进度上报与 CLI 进度条
//! - `fetch`     — 流式下载到 `.part` 再改名
//! - `queue`     — 有并发上限的获取队列（去重 / 取消 / 状态）
//! - `pipeline`  — 单本书的完整获取流程

pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod queue;

pub use models::{AcquiredFile, JobState, JobStatus, ProgressEvent};
pub use pipeline::Acquirer;
pub use queue::{AcquisitionQueue, JobHandle, JobRunner};

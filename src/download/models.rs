//! 获取任务的数据模型：任务状态、进度事件、状态快照与最终产物。

use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Starting,
    Downloading,
    Unwrapping,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    /// 已占用运行槽位的状态。
    pub fn is_running(self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Downloading | JobState::Unwrapping | JobState::Finalizing
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Queued => "排队中",
            JobState::Starting => "准备中",
            JobState::Downloading => "下载中",
            JobState::Unwrapping => "解密中",
            JobState::Finalizing => "收尾中",
            JobState::Done => "完成",
            JobState::Failed => "失败",
            JobState::Cancelled => "已取消",
        }
    }
}

/// 单个任务的进度事件，按产生顺序投递给调用方。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub item_id: String,
    pub state: JobState,
    pub percentage: u8,
    pub status: String,
    pub downloaded: u64,
    pub total: Option<u64>,
}

/// `status()` 返回的任务快照。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub item_id: String,
    pub state: JobState,
    pub percentage: u8,
    pub status: String,
}

impl JobStatus {
    pub fn queued(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            state: JobState::Queued,
            percentage: 0,
            status: "Queued".to_string(),
        }
    }
}

/// 获取成功后的最终文件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquiredFile {
    pub path: PathBuf,
    pub file_name: String,
    /// 本地已存在，未访问远端
    pub reused: bool,
}

impl AcquiredFile {
    pub fn new(path: PathBuf, reused: bool) -> Self {
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            file_name,
            reused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_and_terminal_states_are_disjoint() {
        let all = [
            JobState::Queued,
            JobState::Starting,
            JobState::Downloading,
            JobState::Unwrapping,
            JobState::Finalizing,
            JobState::Done,
            JobState::Failed,
            JobState::Cancelled,
        ];
        for s in all {
            assert!(!(s.is_running() && s.is_terminal()), "{s:?}");
        }
        assert!(!JobState::Queued.is_running());
        assert_eq!(
            serde_json::to_value(JobState::Unwrapping).unwrap(),
            serde_json::json!("unwrapping")
        );
    }

    #[test]
    fn acquired_file_name_comes_from_path() {
        let f = AcquiredFile::new(PathBuf::from("/b/Judul/Judul_decrypted.pdf"), false);
        assert_eq!(f.file_name, "Judul_decrypted.pdf");
    }
}

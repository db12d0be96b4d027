//! 进度上报与 CLI 进度条管理。
//!
//! 每个任务一个 [`ProgressReporter`]：更新 `status()` 可见的快照，并把事件发往调用方提供的
//! 有界通道。状态切换用 `send().await`，有背压，但等待时与取消令牌竞争，取消后立即放弃；
//! 下载中的逐百分比进度和终态事件用 `try_send`，通道满时丢弃。

use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::models::{JobState, JobStatus, ProgressEvent};

pub type ProgressSink = mpsc::Sender<ProgressEvent>;

#[derive(Clone)]
pub struct ProgressReporter {
    item_id: String,
    snapshot: Arc<Mutex<JobStatus>>,
    sink: Option<ProgressSink>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(
        item_id: &str,
        snapshot: Arc<Mutex<JobStatus>>,
        sink: Option<ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            snapshot,
            sink,
            cancel,
        }
    }

    /// 不向外投递事件，只维护快照。
    #[cfg(test)]
    pub fn detached(item_id: &str) -> Self {
        Self::new(
            item_id,
            Arc::new(Mutex::new(JobStatus::queued(item_id))),
            None,
            CancellationToken::new(),
        )
    }

    pub fn snapshot(&self) -> JobStatus {
        self.snapshot.lock().unwrap().clone()
    }

    fn event(&self, status: &JobStatus, downloaded: u64, total: Option<u64>) -> ProgressEvent {
        ProgressEvent {
            item_id: self.item_id.clone(),
            state: status.state,
            percentage: status.percentage,
            status: status.status.clone(),
            downloaded,
            total,
        }
    }

    fn set_state(&self, state: JobState, percentage: u8, status: String) -> ProgressEvent {
        let mut g = self.snapshot.lock().unwrap();
        g.state = state;
        g.percentage = percentage.min(100);
        g.status = status;
        self.event(&g, 0, None)
    }

    /// 状态切换事件。通道满时等待，任务被取消则放弃投递。
    pub async fn stage(&self, state: JobState, percentage: u8, status: impl Into<String>) {
        let ev = self.set_state(state, percentage, status.into());
        let Some(tx) = &self.sink else {
            return;
        };
        // 接收端已关闭说明调用方不再关心进度
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tx.send(ev) => {}
        }
    }

    /// 终态事件，从不阻塞。
    pub fn finish(&self, state: JobState, percentage: u8, status: impl Into<String>) {
        let ev = self.set_state(state, percentage, status.into());
        if let Some(tx) = &self.sink {
            let _ = tx.try_send(ev);
        }
    }

    /// 下载字节进度。整数百分比不变时不投递；下载阶段最多报到 99。
    pub fn bytes(&self, downloaded: u64, total: Option<u64>) {
        let pct = match total {
            Some(t) if t > 0 => ((downloaded.saturating_mul(100)) / t).min(99) as u8,
            _ => return,
        };
        let ev = {
            let mut g = self.snapshot.lock().unwrap();
            if g.state == JobState::Downloading && g.percentage == pct {
                return;
            }
            g.state = JobState::Downloading;
            g.percentage = pct;
            g.status = format!("Downloading... {pct}%");
            self.event(&g, downloaded, total)
        };
        if let Some(tx) = &self.sink {
            let _ = tx.try_send(ev);
        }
    }
}

// ── CLI 进度条 ──────────────────────────────────────────────

pub struct CliBars {
    mp: MultiProgress,
    style: ProgressStyle,
}

impl CliBars {
    pub fn new() -> Self {
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template("{prefix:20} [{elapsed_precise}] {wide_bar} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        Self { mp, style }
    }

    /// 为一个任务创建进度条，返回发送端和驱动进度条的任务。
    pub fn track(&self, item_id: &str) -> (ProgressSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(32);
        let bar = self.mp.add(ProgressBar::new(100));
        bar.set_style(self.style.clone());
        bar.set_prefix(item_id.to_string());

        let handle = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                bar.set_position(u64::from(ev.percentage));
                if ev.state.is_terminal() {
                    bar.finish_with_message(format!("{} {}", ev.state.label(), ev.status));
                } else if let Some(total) = ev.total {
                    bar.set_message(format!(
                        "{} {}/{} KiB",
                        ev.status,
                        ev.downloaded / 1024,
                        total / 1024
                    ));
                } else {
                    bar.set_message(ev.status);
                }
            }
            if !bar.is_finished() {
                bar.finish();
            }
        });
        (tx, handle)
    }
}

impl Default for CliBars {
    fn default() -> Self {
        Self::new()
    }
}

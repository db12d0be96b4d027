//! 获取队列：按条目 ID 去重，最多 N 个任务同时运行，其余按到达顺序排队。
//!
//! 队列状态（任务表 + 等待列表 + 运行计数）由一把 `std::sync::Mutex` 保护，且从不跨 `.await`
//! 持有。任务结束时在同一次加锁内完成“删除任务表条目、释放槽位、接纳下一个”，
//! 因此不会出现瞬时超额接纳或重复计数。
//!
//! 取消：
//! - 排队中的任务：立即从等待列表与任务表移除，调用方收到 `Cancelled`，不会产生任何远端 I/O；
//! - 运行中的任务：只触发取消令牌，由任务自己在下一个挂起点退出并清理。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::{AcquiredFile, JobState, JobStatus, ProgressEvent};
use super::progress::{ProgressReporter, ProgressSink};
use crate::error::{AcquireError, AcquireResult};

type JobResult = AcquireResult<AcquiredFile>;

/// 单个任务的执行体。
pub trait JobRunner: Send + Sync + 'static {
    fn run(
        &self,
        item_id: String,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> impl Future<Output = JobResult> + Send;
}

struct Entry {
    seq: u64,
    running: bool,
    cancel: CancellationToken,
    snapshot: Arc<Mutex<JobStatus>>,
}

struct Pending {
    item_id: String,
    sink: Option<ProgressSink>,
    done: oneshot::Sender<JobResult>,
}

struct Admitted {
    pending: Pending,
    cancel: CancellationToken,
    snapshot: Arc<Mutex<JobStatus>>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Entry>,
    pending: VecDeque<Pending>,
    running: usize,
    next_seq: u64,
}

struct Inner<R> {
    runner: R,
    limit: usize,
    state: Mutex<QueueState>,
}

/// 等待任务结束。
pub struct JobHandle {
    item_id: String,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub async fn wait(self) -> JobResult {
        self.rx.await.unwrap_or(Err(AcquireError::Cancelled))
    }
}

pub struct AcquisitionQueue<R: JobRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: JobRunner> Clone for AcquisitionQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: JobRunner> AcquisitionQueue<R> {
    pub fn new(runner: R, limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                limit: limit.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// 提交任务。同一条目已在排队或运行时返回 `AlreadyInProgress`。
    pub fn enqueue(&self, item_id: &str, sink: Option<ProgressSink>) -> AcquireResult<JobHandle> {
        let item_id = item_id.trim().to_string();
        let (tx, rx) = oneshot::channel();

        let admitted = {
            let mut st = self.inner.state.lock().unwrap();
            if st.jobs.contains_key(&item_id) {
                return Err(AcquireError::AlreadyInProgress(item_id));
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.jobs.insert(
                item_id.clone(),
                Entry {
                    seq,
                    running: false,
                    cancel: CancellationToken::new(),
                    snapshot: Arc::new(Mutex::new(JobStatus::queued(&item_id))),
                },
            );
            if let Some(s) = &sink {
                // 新建通道的第一个事件，容量足够
                let _ = s.try_send(ProgressEvent {
                    item_id: item_id.clone(),
                    state: JobState::Queued,
                    percentage: 0,
                    status: "Queued".to_string(),
                    downloaded: 0,
                    total: None,
                });
            }
            st.pending.push_back(Pending {
                item_id: item_id.clone(),
                sink,
                done: tx,
            });
            debug!(target: "queue", "入队 {item_id}，等待 {} 运行 {}", st.pending.len(), st.running);
            self.inner.admit(&mut st)
        };
        self.inner.launch(admitted);

        Ok(JobHandle { item_id, rx })
    }

    /// 提交并等待结果。传入 `sink` 时调用方需另行消费通道，否则任务会在状态切换处等待，
    /// 直到被取消。
    pub async fn acquire(&self, item_id: &str, sink: Option<ProgressSink>) -> JobResult {
        self.enqueue(item_id, sink)?.wait().await
    }

    /// 取消排队或运行中的任务；不存在时返回 false。
    pub fn cancel(&self, item_id: &str) -> bool {
        let removed = {
            let mut st = self.inner.state.lock().unwrap();
            let Some(entry) = st.jobs.get(item_id) else {
                return false;
            };
            if entry.running {
                info!(target: "queue", "取消运行中的任务 {item_id}");
                entry.cancel.cancel();
                return true;
            }
            if let Some(entry) = st.jobs.remove(item_id) {
                entry.cancel.cancel();
            }
            let pos = st.pending.iter().position(|p| p.item_id == item_id);
            pos.and_then(|i| st.pending.remove(i))
        };

        info!(target: "queue", "取消排队中的任务 {item_id}");
        if let Some(p) = removed {
            if let Some(s) = &p.sink {
                let _ = s.try_send(ProgressEvent {
                    item_id: p.item_id.clone(),
                    state: JobState::Cancelled,
                    percentage: 0,
                    status: "Cancelled".to_string(),
                    downloaded: 0,
                    total: None,
                });
            }
            let _ = p.done.send(Err(AcquireError::Cancelled));
        }
        true
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let st = self.inner.state.lock().unwrap();
            st.jobs.keys().cloned().collect()
        };
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// 当前所有排队与运行中的任务，按提交顺序。
    pub fn status(&self) -> Vec<JobStatus> {
        let st = self.inner.state.lock().unwrap();
        let mut entries: Vec<&Entry> = st.jobs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| e.snapshot.lock().unwrap().clone())
            .collect()
    }
}

impl<R: JobRunner> Inner<R> {
    /// 在持锁状态下按 FIFO 接纳等待中的任务，跳过已被取消的条目。
    fn admit(&self, st: &mut QueueState) -> Vec<Admitted> {
        let mut out = Vec::new();
        while st.running < self.limit {
            let Some(pending) = st.pending.pop_front() else {
                break;
            };
            let Some(entry) = st.jobs.get_mut(&pending.item_id) else {
                continue;
            };
            entry.running = true;
            {
                let mut snap = entry.snapshot.lock().unwrap();
                snap.state = JobState::Starting;
                snap.status = "Starting...".to_string();
            }
            let cancel = entry.cancel.clone();
            let snapshot = entry.snapshot.clone();
            st.running += 1;
            out.push(Admitted {
                pending,
                cancel,
                snapshot,
            });
        }
        out
    }

    /// 任务结束：删除条目、释放槽位并接纳下一个，三步在同一次加锁内完成。
    fn release(self: &Arc<Self>, item_id: &str) {
        let next = {
            let mut st = self.state.lock().unwrap();
            if st.jobs.remove(item_id).is_some() {
                st.running = st.running.saturating_sub(1);
            } else {
                warn!(target: "queue", "释放未登记的任务 {item_id}");
            }
            self.admit(&mut st)
        };
        self.launch(next);
    }

    fn launch(self: &Arc<Self>, admitted: Vec<Admitted>) {
        for job in admitted {
            let inner = self.clone();
            tokio::spawn(async move { inner.run_job(job).await });
        }
    }

    async fn run_job(self: Arc<Self>, job: Admitted) {
        let Admitted {
            pending,
            cancel,
            snapshot,
        } = job;
        let Pending {
            item_id,
            sink,
            done,
        } = pending;
        let reporter = ProgressReporter::new(&item_id, snapshot, sink, cancel.clone());
        // 任务 panic 时也要归还槽位
        let slot = SlotGuard {
            inner: self.clone(),
            item_id: item_id.clone(),
        };

        info!(target: "queue", "开始任务 {item_id}");
        if !cancel.is_cancelled() {
            reporter.stage(JobState::Starting, 0, "Starting...").await;
        }
        let result = if cancel.is_cancelled() {
            Err(AcquireError::Cancelled)
        } else {
            self.runner
                .run(item_id.clone(), reporter.clone(), cancel.clone())
                .await
        };

        // 先归还槽位再投递终态事件，调用方的通道状态不影响调度
        drop(slot);

        let last_pct = reporter.snapshot().percentage;
        match &result {
            Ok(file) => {
                info!(target: "queue", "任务完成 {item_id} -> {}", file.path.display());
                reporter.finish(JobState::Done, 100, "Done");
            }
            Err(e) if e.is_cancelled() => {
                info!(target: "queue", "任务已取消 {item_id}");
                reporter.finish(JobState::Cancelled, last_pct, "Cancelled");
            }
            Err(e) => {
                warn!(target: "queue", "任务失败 {item_id}: {e}");
                reporter.finish(JobState::Failed, last_pct, e.to_string());
            }
        }
        drop(reporter);
        let _ = done.send(result);
    }
}

struct SlotGuard<R: JobRunner> {
    inner: Arc<Inner<R>>,
    item_id: String,
}

impl<R: JobRunner> Drop for SlotGuard<R> {
    fn drop(&mut self) {
        self.inner.release(&self.item_id);
    }
}

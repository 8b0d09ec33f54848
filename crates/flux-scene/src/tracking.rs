//! 每场景、每类别一个追踪工作线程
//!
//! 提交不阻塞：类别队列已有未消费的批次时，新批次直接丢弃。工作线程完成一批后
//! 整体替换快照，读取方不会看到半更新的结果。

use crate::object::MovingObject;
use crate::reid::{ReidConfig, UuidManager, VectorStore};
use crate::tracker::{Batch, CategoryTracker, NearestNeighborFactory, TrackerFactory, TrackerParams, TrackerRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 创建追踪工作线程所需的共享依赖
#[derive(Clone)]
pub struct TrackingContext {
    pub registry: Arc<TrackerRegistry>,
    pub params: TrackerParams,
    pub reid: ReidConfig,
    pub store: Option<Arc<dyn VectorStore>>,
}

impl Default for TrackingContext {
    fn default() -> Self {
        Self {
            registry: Arc::new(TrackerRegistry::new()),
            params: TrackerParams::default(),
            reid: ReidConfig::default(),
            store: None,
        }
    }
}

enum WorkItem {
    Track(Batch),
    Stop,
}

#[derive(Default)]
struct WorkerStats {
    /// 通道内未消费的批次
    queued: AtomicUsize,
    /// 已接收但未处理完的批次
    pending: AtomicUsize,
    dropped: AtomicU64,
    processed: AtomicU64,
}

struct CategoryWorker {
    sender: mpsc::Sender<WorkItem>,
    snapshot: watch::Receiver<Arc<Vec<MovingObject>>>,
    stats: Arc<WorkerStats>,
    idle: Arc<Notify>,
    uuid_manager: Arc<UuidManager>,
    handle: JoinHandle<()>,
}

pub struct Tracking {
    scene_id: String,
    tracker_name: Option<String>,
    ctx: TrackingContext,
    workers: HashMap<String, CategoryWorker>,
}

impl Tracking {
    pub fn new(scene_id: impl Into<String>, tracker_name: Option<String>, ctx: TrackingContext) -> Self {
        Self {
            scene_id: scene_id.into(),
            tracker_name,
            ctx,
            workers: HashMap::new(),
        }
    }

    pub fn tracker_name(&self) -> Option<&str> {
        self.tracker_name.as_deref()
    }

    fn spawn_worker(&self, category: &str) -> CategoryWorker {
        let factory = self.ctx.registry.get(self.tracker_name.as_deref());
        let tracker = match factory {
            Some(f) => f.create(&self.ctx.params),
            None => NearestNeighborFactory.create(&self.ctx.params),
        };
        let uuid_manager = Arc::new(UuidManager::new(self.ctx.reid.clone(), self.ctx.store.clone()));
        uuid_manager.connect();

        let mut category_tracker = CategoryTracker::new(
            category,
            tracker,
            self.ctx.params.distance_type,
            Arc::clone(&uuid_manager),
        );

        let (sender, mut rx) = mpsc::channel::<WorkItem>(1);
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(Vec::new()));
        let stats = Arc::new(WorkerStats::default());
        let idle = Arc::new(Notify::new());

        let worker_stats = Arc::clone(&stats);
        let worker_idle = Arc::clone(&idle);
        let scene_id = self.scene_id.clone();
        let category_name = category.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(item) = rx.blocking_recv() {
                let batch = match item {
                    WorkItem::Stop => break,
                    WorkItem::Track(batch) => batch,
                };
                worker_stats.queued.fetch_sub(1, Ordering::SeqCst);

                let result = category_tracker.track(batch);
                worker_stats.processed.fetch_add(1, Ordering::SeqCst);
                worker_stats.pending.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(objects) => {
                        snapshot_tx.send_replace(Arc::new(objects));
                        worker_idle.notify_waiters();
                    }
                    Err(e) => {
                        // 不重启单个类别线程
                        error!(scene_id = %scene_id, category = %category_name, error = %e, "Tracker failed, worker stopped");
                        worker_stats.pending.store(0, Ordering::SeqCst);
                        worker_idle.notify_waiters();
                        return;
                    }
                }
            }
            debug!(scene_id = %scene_id, category = %category_name, "Tracking worker exited");
        });

        info!(scene_id = %self.scene_id, category = %category, "Tracking worker started");
        CategoryWorker { sender, snapshot, stats, idle, uuid_manager, handle }
    }

    /// 非阻塞提交；队列已满时丢弃本批并返回 false
    pub fn submit(&mut self, category: &str, batch: Batch) -> bool {
        if !self.workers.contains_key(category) {
            let worker = self.spawn_worker(category);
            self.workers.insert(category.to_string(), worker);
        }
        let Some(worker) = self.workers.get(category) else { return false };

        worker.stats.pending.fetch_add(1, Ordering::SeqCst);
        worker.stats.queued.fetch_add(1, Ordering::SeqCst);
        match worker.sender.try_send(WorkItem::Track(batch)) {
            Ok(()) => true,
            Err(e) => {
                worker.stats.pending.fetch_sub(1, Ordering::SeqCst);
                worker.stats.queued.fetch_sub(1, Ordering::SeqCst);
                worker.stats.dropped.fetch_add(1, Ordering::SeqCst);
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(scene_id = %self.scene_id, category = %category, "Tracking queue busy, dropping batch")
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        error!(scene_id = %self.scene_id, category = %category, "Tracking worker is gone, dropping batch")
                    }
                }
                false
            }
        }
    }

    /// 最近一次完成的快照
    pub fn current_objects(&self, category: &str) -> Arc<Vec<MovingObject>> {
        self.workers
            .get(category)
            .map(|w| Arc::clone(&w.snapshot.borrow()))
            .unwrap_or_default()
    }

    /// 所有类别的快照
    pub fn all_current_objects(&self) -> HashMap<String, Arc<Vec<MovingObject>>> {
        self.workers
            .iter()
            .map(|(c, w)| (c.clone(), Arc::clone(&w.snapshot.borrow())))
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn unique_id_count(&self, category: &str) -> u64 {
        self.workers
            .get(category)
            .map(|w| w.uuid_manager.unique_id_count())
            .unwrap_or(0)
    }

    pub fn queue_depth(&self, category: &str) -> usize {
        self.workers
            .get(category)
            .map(|w| w.stats.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn dropped(&self, category: &str) -> u64 {
        self.workers
            .get(category)
            .map(|w| w.stats.dropped.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn processed(&self, category: &str) -> u64 {
        self.workers
            .get(category)
            .map(|w| w.stats.processed.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// 等待所有已接收的批次处理完
    pub async fn wait_for_complete(&self) {
        for worker in self.workers.values() {
            loop {
                let notified = worker.idle.notified();
                if worker.stats.pending.load(Ordering::SeqCst) == 0 || worker.handle.is_finished() {
                    break;
                }
                notified.await;
            }
        }
    }

    /// 每个类别排入结束标记，等待队列排空后回收线程
    pub async fn shutdown(self) {
        for (category, worker) in self.workers {
            if worker.sender.send(WorkItem::Stop).await.is_err() {
                debug!(scene_id = %self.scene_id, category = %category, "Worker already stopped");
            }
            if let Err(e) = worker.handle.await {
                error!(scene_id = %self.scene_id, category = %category, error = %e, "Tracking worker panicked");
            }
        }
        info!(scene_id = %self.scene_id, "Tracking shut down");
    }
}

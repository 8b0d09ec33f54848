//! 追踪器内部 id → 持久全局身份的解析（ReID）
//!
//! 相似度查询在独立任务上执行，追踪线程只做内存操作；同一追踪 id 同时最多
//! 一个查询在途，查询平均耗时超过上限后永久关闭 ReID。

pub mod store;

pub use store::{InMemoryVectorStore, Neighbor, VectorStore};

use crate::object::MovingObject;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// ReID 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReidConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最近邻距离低于此值才算候选
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// 像素框面积下限，过小的检测不采样
    #[serde(default = "default_min_bbox_area")]
    pub min_bbox_area: f64,
    /// 触发查询所需样本数
    #[serde(default = "default_min_feature_count")]
    pub min_feature_count: usize,
    /// 写回存储时的降采样步长
    #[serde(default = "default_feature_slice_size")]
    pub feature_slice_size: usize,
    /// 查询平均耗时上限（秒）
    #[serde(default = "default_max_query_time")]
    pub max_query_time: f64,
    #[serde(default = "default_query_window")]
    pub query_window: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_k_neighbors")]
    pub k_neighbors: usize,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_set_name")]
    pub set_name: String,
}

fn default_enabled() -> bool {
    true
}

fn default_similarity_threshold() -> f64 {
    60.0
}

fn default_min_bbox_area() -> f64 {
    5000.0
}

fn default_min_feature_count() -> usize {
    12
}

fn default_feature_slice_size() -> usize {
    10
}

fn default_max_query_time() -> f64 {
    4.0
}

fn default_query_window() -> usize {
    10
}

fn default_pool_size() -> usize {
    4
}

fn default_k_neighbors() -> usize {
    3
}

fn default_dimensions() -> usize {
    256
}

fn default_set_name() -> String {
    "reid_vector".to_string()
}

impl Default for ReidConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            similarity_threshold: default_similarity_threshold(),
            min_bbox_area: default_min_bbox_area(),
            min_feature_count: default_min_feature_count(),
            feature_slice_size: default_feature_slice_size(),
            max_query_time: default_max_query_time(),
            query_window: default_query_window(),
            pool_size: default_pool_size(),
            k_neighbors: default_k_neighbors(),
            dimensions: default_dimensions(),
            set_name: default_set_name(),
        }
    }
}

/// 身份表条目：全局 id 与相似度
#[derive(Debug, Clone, Default, PartialEq)]
struct IdentityEntry {
    gid: Option<String>,
    similarity: Option<f64>,
    /// 已计入“不同物体数”
    counted: bool,
}

#[derive(Debug, Clone)]
struct PendingFlush {
    gid: String,
    category: String,
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Default)]
struct IdentityState {
    active_ids: HashMap<u64, IdentityEntry>,
    active_query: HashSet<u64>,
    quality_features: HashMap<u64, Vec<Vec<f32>>>,
    features_for_database: HashMap<u64, PendingFlush>,
    unique_id_count: u64,
}

pub struct UuidManager {
    config: ReidConfig,
    state: Arc<Mutex<IdentityState>>,
    store: Option<Arc<dyn VectorStore>>,
    /// 串行化存储连接上的请求
    transport: Arc<tokio::sync::Mutex<()>>,
    pool: Arc<Semaphore>,
    latencies: Arc<Mutex<VecDeque<f64>>>,
    reid_enabled: Arc<AtomicBool>,
}

impl UuidManager {
    pub fn new(config: ReidConfig, store: Option<Arc<dyn VectorStore>>) -> Self {
        let enabled = config.enabled && store.is_some();
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            config,
            state: Arc::new(Mutex::new(IdentityState::default())),
            store,
            transport: Arc::new(tokio::sync::Mutex::new(())),
            pool,
            latencies: Arc::new(Mutex::new(VecDeque::new())),
            reid_enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// 后台连接存储并确保描述子集合存在
    pub fn connect(&self) {
        let Some(store) = self.store.clone() else { return };
        let transport = Arc::clone(&self.transport);
        let set_name = self.config.set_name.clone();
        let dimensions = self.config.dimensions;
        tokio::spawn(async move {
            let _wire = transport.lock().await;
            let result = async {
                store.connect().await?;
                if !store.find_schema(&set_name).await? {
                    store.add_schema(&set_name, "L2", dimensions).await?;
                }
                Ok::<_, flux_scene_core::FusionError>(())
            }
            .await;
            match result {
                Ok(()) => info!(set = %set_name, "ReID store connected"),
                Err(e) => warn!(error = %e, "ReID store unavailable"),
            }
        });
    }

    pub fn reid_enabled(&self) -> bool {
        self.reid_enabled.load(Ordering::SeqCst)
    }

    /// 近似的不同物体数
    pub fn unique_id_count(&self) -> u64 {
        self.state.lock().unique_id_count
    }

    /// 当前在途查询数
    pub fn queries_in_flight(&self) -> usize {
        self.state.lock().active_query.len()
    }

    /// 为物体分配/延续全局身份，必要时发起一次异步相似度查询
    pub fn assign_id(&self, obj: &mut MovingObject) {
        let Some(rv_id) = obj.rv_id else { return };
        let mut state = self.state.lock();

        let unresolved = match state.active_ids.get(&rv_id) {
            None => {
                let counted = obj.reid.is_none();
                if counted {
                    state.unique_id_count += 1;
                }
                state.active_ids.insert(rv_id, IdentityEntry { counted, ..Default::default() });
                true
            }
            Some(entry) => entry.gid.is_none(),
        };

        if !unresolved {
            Self::pick_best_id(&mut state, rv_id, obj);
            return;
        }

        self.gather_quality_features(&mut state, rv_id, obj);
        let ready = state
            .quality_features
            .get(&rv_id)
            .map(|f| f.len() >= self.config.min_feature_count)
            .unwrap_or(false);
        if ready && self.reid_enabled() && !state.active_query.contains(&rv_id) {
            state.active_query.insert(rv_id);
            let features = state.quality_features.get(&rv_id).cloned().unwrap_or_default();
            drop(state);
            self.spawn_query(rv_id, obj.gid().to_string(), obj.category.clone(), features);
        }
    }

    fn gather_quality_features(&self, state: &mut IdentityState, rv_id: u64, obj: &MovingObject) {
        let (Some(vector), Some(area)) = (&obj.reid, obj.pixel_area()) else { return };
        if area > self.config.min_bbox_area {
            state.quality_features.entry(rv_id).or_default().push(vector.clone());
        }
    }

    fn pick_best_id(state: &mut IdentityState, rv_id: u64, obj: &mut MovingObject) {
        let Some(entry) = state.active_ids.get(&rv_id) else { return };
        if let Some(gid) = &entry.gid {
            obj.gid = Some(gid.clone());
            obj.similarity = entry.similarity;
        }
        if let (Some(vector), Some(pending)) = (&obj.reid, state.features_for_database.get_mut(&rv_id)) {
            pending.vectors.push(vector.clone());
        }
    }

    fn spawn_query(&self, rv_id: u64, current_gid: String, category: String, features: Vec<Vec<f32>>) {
        let Some(store) = self.store.clone() else { return };
        let state = Arc::clone(&self.state);
        let transport = Arc::clone(&self.transport);
        let pool = Arc::clone(&self.pool);
        let latencies = Arc::clone(&self.latencies);
        let reid_enabled = Arc::clone(&self.reid_enabled);
        let config = self.config.clone();

        debug!(rv_id, category = %category, samples = features.len(), "Submitting similarity query");
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else { return };
            let started = Instant::now();
            let result = {
                let _wire = transport.lock().await;
                store
                    .find_similarity_scores(&config.set_name, &category, &features, config.k_neighbors)
                    .await
            };
            record_latency(&latencies, &reid_enabled, &config, started.elapsed().as_secs_f64());

            let best = match result {
                Ok(neighbors) => choose_match(&neighbors, config.similarity_threshold),
                Err(e) => {
                    warn!(rv_id, error = %e, "Similarity query failed");
                    None
                }
            };

            let mut state = state.lock();
            state.active_query.remove(&rv_id);
            if !state.active_ids.contains_key(&rv_id) {
                debug!(rv_id, "Track ended before query resolved, discarding result");
                return;
            }
            update_active_dict(&mut state, rv_id, best, current_gid, category, features);
        });
    }

    /// 追踪器稳定集合之外的 id 视为结束：写回样本、计数、清理
    pub fn prune_inactive_tracks(&self, reliable: &HashSet<u64>) {
        let mut flushes = Vec::new();
        {
            let mut state = self.state.lock();
            let inactive: Vec<u64> = state
                .active_ids
                .keys()
                .filter(|id| !reliable.contains(id))
                .copied()
                .collect();
            for rv_id in inactive {
                let entry = state.active_ids.remove(&rv_id).unwrap_or_default();
                state.active_query.remove(&rv_id);
                state.quality_features.remove(&rv_id);
                if !entry.counted && entry.similarity.is_none() {
                    state.unique_id_count += 1;
                }
                if let Some(pending) = state.features_for_database.remove(&rv_id) {
                    flushes.push((rv_id, pending));
                }
            }
        }

        let Some(store) = self.store.clone() else { return };
        let stride = self.config.feature_slice_size.max(1);
        for (rv_id, pending) in flushes {
            let vectors: Vec<Vec<f32>> = pending.vectors.into_iter().step_by(stride).collect();
            if vectors.is_empty() {
                continue;
            }
            let store = Arc::clone(&store);
            let transport = Arc::clone(&self.transport);
            let set_name = self.config.set_name.clone();
            tokio::spawn(async move {
                let _wire = transport.lock().await;
                if let Err(e) = store
                    .add_entry(&set_name, &pending.gid, rv_id, &pending.category, &vectors)
                    .await
                {
                    warn!(rv_id, gid = %pending.gid, error = %e, "Failed to store ReID descriptors");
                }
            });
        }
    }
}

fn record_latency(
    latencies: &Mutex<VecDeque<f64>>,
    reid_enabled: &AtomicBool,
    config: &ReidConfig,
    elapsed: f64,
) {
    let mut window = latencies.lock();
    window.push_back(elapsed);
    while window.len() > config.query_window.max(1) {
        window.pop_front();
    }
    let average = window.iter().sum::<f64>() / window.len() as f64;
    if average > config.max_query_time && reid_enabled.swap(false, Ordering::SeqCst) {
        error!(
            average_secs = average,
            limit_secs = config.max_query_time,
            "ReID queries too slow, disabling ReID for this process"
        );
    }
}

/// 每个样本取最近邻；低于阈值的候选中得票过半者胜出
fn choose_match(neighbors: &[Vec<Neighbor>], threshold: f64) -> Option<(String, f64)> {
    let best: Vec<&Neighbor> = neighbors
        .iter()
        .filter_map(|row| row.iter().min_by(|a, b| a.distance.total_cmp(&b.distance)))
        .collect();
    if best.is_empty() {
        return None;
    }

    let mut votes: HashMap<&str, (usize, f64)> = HashMap::new();
    for n in best.iter().filter(|n| n.distance < threshold) {
        let slot = votes.entry(n.uuid.as_str()).or_insert((0, f64::INFINITY));
        slot.0 += 1;
        slot.1 = slot.1.min(n.distance);
    }
    let (uuid, (count, distance)) = votes
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.total_cmp(&a.1 .1)))?;
    if count * 2 >= best.len() {
        Some((uuid.to_string(), distance))
    } else {
        None
    }
}

fn update_active_dict(
    state: &mut IdentityState,
    rv_id: u64,
    best: Option<(String, f64)>,
    current_gid: String,
    category: String,
    features: Vec<Vec<f32>>,
) {
    let taken = |state: &IdentityState, gid: &str| {
        state
            .active_ids
            .iter()
            .any(|(id, e)| *id != rv_id && e.gid.as_deref() == Some(gid))
    };

    let (gid, similarity) = match best {
        Some((db_id, sim)) if !taken(state, &db_id) => {
            debug!(rv_id, gid = %db_id, similarity = sim, "ReID match");
            (db_id, Some(sim))
        }
        _ => (current_gid, None),
    };
    if let Some(entry) = state.active_ids.get_mut(&rv_id) {
        entry.gid = Some(gid.clone());
        entry.similarity = similarity;
    }
    state
        .features_for_database
        .insert(rv_id, PendingFlush { gid, category, vectors: features });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::ObjectClassRegistry;
    use async_trait::async_trait;
    use flux_scene_core::Result;
    use flux_scene_types::{BoundingBox, Detection};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn object(rv_id: u64, reid: Option<Vec<f32>>) -> MovingObject {
        let det = Detection {
            translation: Some(vec![0.0, 0.0, 0.0]),
            bounding_box_px: Some(BoundingBox::new(0.0, 0.0, 100.0, 100.0)),
            ..Default::default()
        };
        let mut obj =
            MovingObject::from_detection(&det, "person", ObjectClassRegistry::new().lookup("person"), 0.0, None, None)
                .unwrap();
        obj.set_gid(format!("local-{rv_id}"));
        obj.rv_id = Some(rv_id);
        obj.reid = reid;
        obj
    }

    fn config(min_feature_count: usize) -> ReidConfig {
        ReidConfig { min_feature_count, dimensions: 2, set_name: "test".into(), ..Default::default() }
    }

    /// 记录并发度的慢存储
    #[derive(Default)]
    struct SlowStore {
        calls: AtomicUsize,
        current: AtomicUsize,
        max_concurrent: AtomicUsize,
        delay_ms: u64,
        answer: Option<Neighbor>,
    }

    #[async_trait]
    impl VectorStore for SlowStore {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn add_schema(&self, _: &str, _: &str, _: usize) -> Result<()> {
            Ok(())
        }
        async fn find_schema(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn add_entry(&self, _: &str, _: &str, _: u64, _: &str, _: &[Vec<f32>]) -> Result<()> {
            Ok(())
        }
        async fn find_similarity_scores(
            &self,
            _: &str,
            _: &str,
            vectors: &[Vec<f32>],
            _: usize,
        ) -> Result<Vec<Vec<Neighbor>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vectors.iter().map(|_| self.answer.iter().cloned().collect()).collect())
        }
    }

    #[tokio::test]
    async fn test_no_vector_counted_once_at_assignment() {
        let manager = UuidManager::new(config(12), None);
        for _ in 0..20 {
            let mut obj = object(7, None);
            manager.assign_id(&mut obj);
        }
        assert_eq!(manager.unique_id_count(), 1);

        manager.prune_inactive_tracks(&HashSet::new());
        assert_eq!(manager.unique_id_count(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_vector_counted_at_prune() {
        let manager = UuidManager::new(config(12), None);
        for _ in 0..5 {
            let mut obj = object(3, Some(vec![1.0, 2.0]));
            manager.assign_id(&mut obj);
        }
        assert_eq!(manager.unique_id_count(), 0);

        manager.prune_inactive_tracks(&HashSet::from([3]));
        assert_eq!(manager.unique_id_count(), 0);
        manager.prune_inactive_tracks(&HashSet::new());
        assert_eq!(manager.unique_id_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_query_in_flight_per_track() {
        let store = Arc::new(SlowStore { delay_ms: 100, ..Default::default() });
        let manager = Arc::new(UuidManager::new(config(1), Some(store.clone() as Arc<dyn VectorStore>)));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let mut obj = object(42, Some(vec![0.5, 0.5]));
                manager.assign_id(&mut obj);
                assert!(manager.queries_in_flight() <= 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(manager.queries_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_match_overrides_gid() {
        let store = Arc::new(SlowStore {
            delay_ms: 0,
            answer: Some(Neighbor { uuid: "known".into(), rv_id: 1, distance: 10.0 }),
            ..Default::default()
        });
        let manager = UuidManager::new(config(2), Some(store as Arc<dyn VectorStore>));
        for _ in 0..2 {
            let mut obj = object(5, Some(vec![0.0, 0.0]));
            manager.assign_id(&mut obj);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut obj = object(5, Some(vec![0.0, 0.0]));
        manager.assign_id(&mut obj);
        assert_eq!(obj.gid(), "known");
        assert_eq!(obj.similarity, Some(10.0));

        manager.prune_inactive_tracks(&HashSet::new());
        assert_eq!(manager.unique_id_count(), 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips() {
        let store = Arc::new(SlowStore { delay_ms: 80, ..Default::default() });
        let mut cfg = config(1);
        cfg.max_query_time = 0.01;
        let manager = UuidManager::new(cfg, Some(store.clone() as Arc<dyn VectorStore>));
        assert!(manager.reid_enabled());

        let mut obj = object(1, Some(vec![0.0, 0.0]));
        manager.assign_id(&mut obj);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.reid_enabled());

        let mut other = object(2, Some(vec![0.0, 0.0]));
        manager.assign_id(&mut other);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_majority_vote() {
        let n = |uuid: &str, d: f64| vec![Neighbor { uuid: uuid.into(), rv_id: 0, distance: d }];
        let rows = vec![n("a", 10.0), n("a", 20.0), n("b", 5.0), n("c", 90.0)];
        assert_eq!(choose_match(&rows, 60.0), Some(("a".to_string(), 10.0)));

        let scattered = vec![n("a", 10.0), n("b", 10.0), n("c", 10.0), n("d", 10.0), n("e", 10.0)];
        assert_eq!(choose_match(&scattered, 60.0), None);

        let far = vec![n("a", 70.0), n("a", 80.0)];
        assert_eq!(choose_match(&far, 60.0), None);
    }
}

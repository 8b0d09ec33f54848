//! 场景缓存：按场景、相机、传感器 id 查找，显式失效后整体比对刷新

use crate::child::ChildLink;
use crate::geometry::Pose;
use crate::scene::Scene;
use crate::tracking::TrackingContext;
use async_trait::async_trait;
use flux_scene_core::Result;
use flux_scene_types::{AssetRecord, ChildKind, ChildSceneRecord, SceneRecord};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 外部场景存储
#[async_trait]
pub trait SceneStore: Send + Sync {
    async fn get_scenes(&self) -> Result<Vec<SceneRecord>>;

    async fn get_child_scenes(&self, parent: &str) -> Result<Vec<ChildSceneRecord>>;

    async fn get_assets(&self) -> Result<Vec<AssetRecord>>;

    /// 把相机上报的内参与畸变写回存储，供未标定相机重新计算位姿
    async fn update_camera(&self, _camera_id: &str, _parameters: &Value) -> Result<()> {
        Ok(())
    }
}

/// 内存存储
#[derive(Default)]
pub struct InMemorySceneStore {
    scenes: RwLock<Vec<SceneRecord>>,
    children: RwLock<HashMap<String, Vec<ChildSceneRecord>>>,
    assets: RwLock<Vec<AssetRecord>>,
}

impl InMemorySceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scenes(&self, scenes: Vec<SceneRecord>) {
        *self.scenes.write() = scenes;
    }

    pub fn set_child_scenes(&self, parent: &str, children: Vec<ChildSceneRecord>) {
        self.children.write().insert(parent.to_string(), children);
    }

    pub fn set_assets(&self, assets: Vec<AssetRecord>) {
        *self.assets.write() = assets;
    }
}

#[async_trait]
impl SceneStore for InMemorySceneStore {
    async fn get_scenes(&self) -> Result<Vec<SceneRecord>> {
        Ok(self.scenes.read().clone())
    }

    async fn get_child_scenes(&self, parent: &str) -> Result<Vec<ChildSceneRecord>> {
        Ok(self.children.read().get(parent).cloned().unwrap_or_default())
    }

    async fn get_assets(&self) -> Result<Vec<AssetRecord>> {
        Ok(self.assets.read().clone())
    }
}

pub struct CacheManager {
    store: Arc<dyn SceneStore>,
    ctx: TrackingContext,
    scenes: HashMap<String, Scene>,
    by_camera: HashMap<String, String>,
    by_sensor: HashMap<String, String>,
    /// 子场景 id → 链接（本地与远程）
    child_links: HashMap<String, ChildLink>,
    child_records: Vec<ChildSceneRecord>,
    stale: bool,
}

impl CacheManager {
    pub fn new(store: Arc<dyn SceneStore>, ctx: TrackingContext) -> Self {
        Self {
            store,
            ctx,
            scenes: HashMap::new(),
            by_camera: HashMap::new(),
            by_sensor: HashMap::new(),
            child_links: HashMap::new(),
            child_records: Vec::new(),
            stale: true,
        }
    }

    pub fn store(&self) -> &Arc<dyn SceneStore> {
        &self.store
    }

    /// 下次查找前刷新
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub async fn check_refresh(&mut self) {
        if !self.stale {
            return;
        }
        self.stale = false;
        if let Err(e) = self.refresh_scenes().await {
            error!(error = %e, "Scene refresh failed, keeping cached scenes");
        }
    }

    /// 与存储比对：删除消失的场景，新建未见过的场景，已有场景原地更新
    pub async fn refresh_scenes(&mut self) -> Result<()> {
        let records = self.store.get_scenes().await?;
        let fresh: HashSet<&str> = records.iter().map(|r| r.uid.as_str()).collect();

        let gone: Vec<String> = self.scenes.keys().filter(|k| !fresh.contains(k.as_str())).cloned().collect();
        for uid in gone {
            if let Some(scene) = self.scenes.remove(&uid) {
                info!(scene_id = %uid, "Scene removed");
                tokio::spawn(scene.shutdown());
            }
        }

        for record in &records {
            match self.scenes.get_mut(&record.uid) {
                Some(scene) => scene.update(record),
                None => {
                    info!(scene_id = %record.uid, name = %record.name, "Scene created");
                    self.scenes.insert(record.uid.clone(), Scene::from_record(record, self.ctx.clone()));
                }
            }
        }

        self.break_parent_cycles();
        self.rebuild_indices();
        self.refresh_children().await;
        debug!(scenes = self.scenes.len(), "Scene cache refreshed");
        Ok(())
    }

    fn rebuild_indices(&mut self) {
        self.by_camera.clear();
        self.by_sensor.clear();
        for scene in self.scenes.values() {
            for camera_id in scene.cameras.keys() {
                self.by_camera.insert(camera_id.clone(), scene.uid.clone());
            }
            for sensor_id in scene.sensors.keys() {
                self.by_sensor.insert(sensor_id.clone(), scene.uid.clone());
            }
        }
    }

    /// 沿父链行走，会闭环的父链接被丢弃
    fn break_parent_cycles(&mut self) {
        let mut uids: Vec<String> = self.scenes.keys().cloned().collect();
        uids.sort();
        for uid in uids {
            let mut seen = HashSet::from([uid.clone()]);
            let mut cursor = self.scenes.get(&uid).and_then(|s| s.parent.clone());
            let mut cycle = false;
            while let Some(parent) = cursor {
                if !seen.insert(parent.clone()) {
                    cycle = parent == uid;
                    break;
                }
                cursor = self.scenes.get(&parent).and_then(|s| s.parent.clone());
            }
            if cycle {
                if let Some(scene) = self.scenes.get_mut(&uid) {
                    error!(scene_id = %uid, parent = ?scene.parent, "Parent link would close a cycle, unlinking");
                    scene.parent = None;
                }
            }
        }
    }

    async fn refresh_children(&mut self) {
        self.child_links.clear();
        self.child_records.clear();

        for scene in self.scenes.values() {
            if let Some(parent) = &scene.parent {
                self.child_links.insert(
                    scene.uid.clone(),
                    ChildLink {
                        child_id: scene.uid.clone(),
                        name: scene.name.clone(),
                        parent: parent.clone(),
                        kind: ChildKind::Local,
                        pose: scene.transform.unwrap_or_default(),
                        retrack: scene.retrack,
                    },
                );
            }
        }

        let parents: Vec<String> =
            self.scenes.values().filter(|s| !s.children.is_empty()).map(|s| s.uid.clone()).collect();
        for parent in parents {
            let records = match self.store.get_child_scenes(&parent).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(scene_id = %parent, error = %e, "Failed to fetch child scenes");
                    continue;
                }
            };
            for record in records {
                let Some(link) = ChildLink::from_record(&record) else {
                    warn!(child = %record.name, "Child scene record without id");
                    continue;
                };
                if link.kind == ChildKind::Local {
                    if let Some(child) = self.scenes.get_mut(&link.child_id) {
                        child.retrack = record.retrack;
                    }
                    // 本地子场景沿用场景自身的变换
                    if let Some(existing) = self.child_links.get_mut(&link.child_id) {
                        existing.retrack = record.retrack;
                        self.child_records.push(record);
                        continue;
                    }
                }
                self.child_links.insert(link.child_id.clone(), link);
                self.child_records.push(record);
            }
        }
    }

    pub async fn scene_with_id(&mut self, uid: &str) -> Option<&mut Scene> {
        self.check_refresh().await;
        self.scenes.get_mut(uid)
    }

    pub async fn scene_with_camera(&mut self, camera_id: &str) -> Option<&mut Scene> {
        self.check_refresh().await;
        let uid = self.by_camera.get(camera_id)?;
        self.scenes.get_mut(uid)
    }

    pub async fn scene_with_sensor(&mut self, sensor_id: &str) -> Option<&mut Scene> {
        self.check_refresh().await;
        let uid = self.by_sensor.get(sensor_id)?;
        self.scenes.get_mut(uid)
    }

    /// 按子场景 id（本地 uid 或远程 id）查找链接
    pub async fn child_link(&mut self, child_id: &str) -> Option<ChildLink> {
        self.check_refresh().await;
        self.child_links.get(child_id).cloned()
    }

    /// 不触发刷新
    pub fn scenes(&self) -> impl Iterator<Item = &Scene> {
        self.scenes.values()
    }

    pub fn scenes_mut(&mut self) -> impl Iterator<Item = &mut Scene> {
        self.scenes.values_mut()
    }

    pub fn get(&self, uid: &str) -> Option<&Scene> {
        self.scenes.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.scenes.contains_key(uid)
    }

    pub fn child_records(&self) -> &[ChildSceneRecord] {
        &self.child_records
    }

    pub async fn get_assets(&self) -> Result<Vec<AssetRecord>> {
        self.store.get_assets().await
    }

    /// 场景坐标 → 祖先场景坐标的复合变换；`ancestor` 不在父链上时返回 None
    pub fn composed_transform(&self, scene_id: &str, ancestor: &str) -> Option<Pose> {
        let mut acc = Pose::identity();
        let mut cursor = scene_id.to_string();
        let mut hops = 0;
        while cursor != ancestor {
            let scene = self.scenes.get(&cursor)?;
            acc = scene.transform.unwrap_or_default().compose(&acc);
            cursor = scene.parent.clone()?;
            hops += 1;
            if hops > self.scenes.len() {
                return None;
            }
        }
        Some(acc)
    }

    pub async fn shutdown(self) {
        for (_, scene) in self.scenes {
            scene.shutdown().await;
        }
    }
}

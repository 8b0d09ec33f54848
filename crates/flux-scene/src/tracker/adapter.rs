//! 把领域物体转换为追踪器输入，并把稳定轨迹还原为带全局身份的物体

use super::{DistanceType, TrackState, Tracker, TrackerInput};
use crate::category::DEFAULT_TRACKING_RADIUS;
use crate::object::MovingObject;
use crate::reid::UuidManager;
use flux_scene_core::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// 直通物体未刷新时保留的时长（秒）
pub const MAX_UNRELIABLE_TIME: f64 = 0.3333;

/// 一次提交
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub objects: Vec<MovingObject>,
    pub when: f64,
    /// 上游已追踪的直通物体
    pub already_tracked: Vec<MovingObject>,
    pub frame_rate: Option<f64>,
}

pub struct CategoryTracker {
    category: String,
    tracker: Box<dyn Tracker>,
    distance: DistanceType,
    uuid_manager: Arc<UuidManager>,
    /// 上一轮追踪输出
    objects: Vec<MovingObject>,
    /// 上一轮直通物体
    already_tracked: Vec<MovingObject>,
}

impl CategoryTracker {
    pub fn new(
        category: impl Into<String>,
        tracker: Box<dyn Tracker>,
        distance: DistanceType,
        uuid_manager: Arc<UuidManager>,
    ) -> Self {
        Self {
            category: category.into(),
            tracker,
            distance,
            uuid_manager,
            objects: Vec::new(),
            already_tracked: Vec::new(),
        }
    }

    pub fn uuid_manager(&self) -> &Arc<UuidManager> {
        &self.uuid_manager
    }

    /// 处理一批，返回本轮完整结果（追踪输出 + 直通物体）
    pub fn track(&mut self, batch: Batch) -> Result<Vec<MovingObject>> {
        if let Some(rate) = batch.frame_rate {
            self.tracker.update_params(rate);
        }

        let Batch { mut objects, when, already_tracked, .. } = batch;
        for (i, obj) in objects.iter_mut().enumerate() {
            obj.submission_id = Some(i);
        }
        self.update_tracks(&objects, when)?;

        let reliable = self.tracker.reliable_tracks();
        let reliable_ids: HashSet<u64> = reliable.iter().map(|t| t.id).collect();
        self.uuid_manager.prune_inactive_tracks(&reliable_ids);

        let mut tracked = Vec::with_capacity(reliable.len());
        for state in &reliable {
            if let Some(obj) = self.resolve(state, &objects, when) {
                tracked.push(obj);
            }
        }
        self.objects = tracked;

        self.merge_already_tracked(already_tracked, when);

        debug!(
            category = %self.category,
            tracked = self.objects.len(),
            passthrough = self.already_tracked.len(),
            "Category tracked"
        );
        let mut result = self.objects.clone();
        result.extend(self.already_tracked.iter().cloned());
        Ok(result)
    }

    fn update_tracks(&mut self, objects: &[MovingObject], when: f64) -> Result<()> {
        let inputs: Vec<TrackerInput> = objects
            .iter()
            .enumerate()
            .map(|(i, obj)| TrackerInput {
                submission_id: i,
                position: obj.location,
                size: obj.size.unwrap_or([1.0, 1.0, 1.0]),
                yaw: obj
                    .rotation
                    .map(|[x, y, z, w]| (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z)))
                    .unwrap_or(0.0),
                confidence: obj.confidence.unwrap_or(1.0),
            })
            .collect();

        // 关联半径取本批物体追踪半径的平均值
        let radius = if objects.is_empty() {
            DEFAULT_TRACKING_RADIUS
        } else {
            objects.iter().map(|o| o.class.tracking_radius).sum::<f64>() / objects.len() as f64
        };
        self.tracker.track(inputs, when, self.distance, radius)
    }

    /// 轨迹 → 物体：本轮有测量则取提交的物体并延续身份，否则沿用上一轮物体
    fn resolve(&self, state: &TrackState, objects: &[MovingObject], when: f64) -> Option<MovingObject> {
        let previous = self.objects.iter().find(|o| o.rv_id == Some(state.id));
        if state.last_measured != when {
            return previous.cloned();
        }

        let mut obj = objects.get(state.submission_id)?.clone();
        obj.location = state.position;
        obj.velocity = Some(state.velocity);
        obj.rv_id = Some(state.id);
        match previous {
            Some(prev) => {
                obj.set_previous(prev);
                obj.infer_rotation_from_velocity();
            }
            None => obj.set_gid(Uuid::new_v4().to_string()),
        }
        self.uuid_manager.assign_id(&mut obj);
        Some(obj)
    }

    /// 按检测 id 合并上游已追踪物体，超时未刷新的丢弃
    fn merge_already_tracked(&mut self, incoming: Vec<MovingObject>, when: f64) {
        let mut merged: Vec<MovingObject> = Vec::with_capacity(incoming.len());
        for mut obj in incoming {
            match self.already_tracked.iter().find(|p| p.oid.is_some() && p.oid == obj.oid) {
                Some(prev) => {
                    obj.set_previous(prev);
                    obj.infer_rotation_from_velocity();
                }
                None => {
                    let gid = obj.oid.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                    obj.set_gid(gid);
                }
            }
            obj.last_seen = when;
            merged.push(obj);
        }

        for old in self.already_tracked.drain(..) {
            let refreshed = merged.iter().any(|o| o.oid.is_some() && o.oid == old.oid);
            if !refreshed && when - old.last_seen < MAX_UNRELIABLE_TIME {
                merged.push(old);
            }
        }
        self.already_tracked = merged;
    }
}

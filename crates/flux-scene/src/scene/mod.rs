//! 单个物理场景：相机、传感器、区域、绊线与按类别的追踪

pub mod events;

pub use events::{EventKind, EventType, SceneEvent};

use crate::category::ObjectClassRegistry;
use crate::geometry::earth::lla_to_ecef;
use crate::geometry::{CameraPose, Pose};
use crate::object::MovingObject;
use crate::region::{Region, Tripwire};
use crate::tracker::Batch;
use crate::tracking::{Tracking, TrackingContext};
use flux_scene_core::Result;
use flux_scene_types::{CameraRecord, DetectionMessage, SceneDataMessage, SceneRecord, SensorMessage};
use nalgebra::Point3;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Camera {
    pub uid: String,
    pub name: String,
    /// 未标定的相机没有位姿，其检测被丢弃
    pub pose: Option<CameraPose>,
}

impl Camera {
    pub fn from_record(record: &CameraRecord) -> Self {
        let pose = match CameraPose::from_record(record) {
            Ok(pose) => pose,
            Err(e) => {
                warn!(camera_id = %record.uid, error = %e, "Invalid camera calibration");
                None
            }
        };
        Self {
            uid: record.uid.clone(),
            name: record.name.clone().unwrap_or_else(|| record.uid.clone()),
            pose,
        }
    }
}

pub struct Scene {
    pub uid: String,
    pub name: String,
    pub parent: Option<String>,
    /// 本场景坐标 → 父场景坐标
    pub transform: Option<Pose>,
    pub cameras: HashMap<String, Camera>,
    pub sensors: HashMap<String, Region>,
    pub regions: HashMap<String, Region>,
    pub tripwires: HashMap<String, Tripwire>,
    pub children: Vec<String>,
    /// 作为子场景时，父场景是否重新追踪其输出
    pub retrack: bool,
    pub output_lla: bool,
    pub regulated_rate: Option<f64>,
    pub external_update_rate: Option<f64>,
    ctx: TrackingContext,
    tracking: Tracking,
    events: Vec<SceneEvent>,
    ref_frame_rate: Option<f64>,
}

impl Scene {
    pub fn from_record(record: &SceneRecord, ctx: TrackingContext) -> Self {
        let tracking = Tracking::new(record.uid.clone(), record.tracker.clone(), ctx.clone());
        let mut scene = Self {
            uid: record.uid.clone(),
            name: record.name.clone(),
            parent: None,
            transform: None,
            cameras: HashMap::new(),
            sensors: HashMap::new(),
            regions: HashMap::new(),
            tripwires: HashMap::new(),
            children: Vec::new(),
            retrack: true,
            output_lla: false,
            regulated_rate: None,
            external_update_rate: None,
            ctx,
            tracking,
            events: Vec::new(),
            ref_frame_rate: None,
        };
        scene.update(record);
        scene
    }

    /// 原地应用新的元数据；追踪状态与区域成员保持不变
    pub fn update(&mut self, record: &SceneRecord) {
        self.name = record.name.clone();
        self.parent = record.parent.clone();
        self.transform = record.transform.as_ref().and_then(|t| match Pose::from_record(t) {
            Ok(pose) => Some(pose),
            Err(e) => {
                warn!(scene_id = %self.uid, error = %e, "Invalid scene transform");
                None
            }
        });
        self.retrack = record.retrack.unwrap_or(true);
        self.output_lla = record.output_lla;
        self.regulated_rate = record.regulated_rate;
        self.external_update_rate = record.external_update_rate;
        self.children = record.children.clone();

        self.cameras = record.cameras.iter().map(|c| (c.uid.clone(), Camera::from_record(c))).collect();

        sync_regions(&mut self.regions, &record.regions, false);
        sync_regions(&mut self.sensors, &record.sensors, true);

        let keep: HashSet<&str> = record.tripwires.iter().map(|t| t.uid.as_str()).collect();
        self.tripwires.retain(|uid, _| keep.contains(uid.as_str()));
        for tw in &record.tripwires {
            match self.tripwires.get_mut(&tw.uid) {
                Some(existing) => existing.update(tw),
                None => {
                    self.tripwires.insert(tw.uid.clone(), Tripwire::from_record(tw));
                }
            }
        }

        if record.tracker.as_deref() != self.tracking.tracker_name() {
            info!(scene_id = %self.uid, tracker = ?record.tracker, "Tracker changed, restarting tracking");
            let fresh = Tracking::new(self.uid.clone(), record.tracker.clone(), self.ctx.clone());
            let old = std::mem::replace(&mut self.tracking, fresh);
            tokio::spawn(old.shutdown());
        }
    }

    pub fn tracking(&self) -> &Tracking {
        &self.tracking
    }

    pub fn current_objects(&self, category: &str) -> Arc<Vec<MovingObject>> {
        self.tracking.current_objects(category)
    }

    pub fn unique_id_count(&self, category: &str) -> u64 {
        self.tracking.unique_id_count(category)
    }

    pub fn camera(&self, camera_id: &str) -> Option<&Camera> {
        self.cameras.get(camera_id)
    }

    /// 相机检测；未知相机返回 `Ok(false)`
    pub fn process_camera_data(
        &mut self,
        msg: &DetectionMessage,
        when: f64,
        classes: &ObjectClassRegistry,
    ) -> Result<bool> {
        let Some(camera) = self.cameras.get_mut(&msg.id) else {
            warn!(scene_id = %self.uid, camera_id = %msg.id, "Unknown camera");
            return Ok(false);
        };
        if let Some(rate) = msg.frame_rate {
            self.ref_frame_rate = Some(self.ref_frame_rate.map_or(rate, |r| r.min(rate)));
        }
        if let (Some(intrinsics), Some(pose)) = (&msg.intrinsics, camera.pose.as_mut()) {
            pose.set_intrinsics(intrinsics, msg.distortion.as_ref());
        }
        let Some(pose) = camera.pose.clone() else {
            info!(camera_id = %msg.id, "Discarding detections: camera has no pose");
            return Ok(true);
        };

        for (category, detections) in &msg.objects {
            let class = classes.lookup(category);
            let mut objects = Vec::with_capacity(detections.len());
            for det in detections {
                let mut det = det.clone();
                // 未附带内参时框为像素坐标
                if msg.intrinsics.is_none() && det.bounding_box.is_none() {
                    det.bounding_box = det.bounding_box_px.map(|px| pose.intrinsics().undistort_bbox(&px));
                }
                match MovingObject::from_detection(&det, category, class.clone(), when, Some(&msg.id), Some(&pose)) {
                    Ok(obj) => objects.push(obj),
                    Err(e) => debug!(camera_id = %msg.id, error = %e, "Skipping detection"),
                }
            }
            self.finish_processing(category, when, objects, Vec::new());
        }
        Ok(true)
    }

    /// 子场景数据：经子场景变换映射到本场景坐标
    pub fn process_scene_data(
        &mut self,
        msg: &SceneDataMessage,
        child_pose: &Pose,
        retrack: bool,
        category: &str,
        when: f64,
        classes: &ObjectClassRegistry,
    ) -> Result<bool> {
        if let Some(rate) = msg.frame_rate {
            self.note_frame_rate(rate);
        }
        let class = classes.lookup(category);
        let mut objects = Vec::new();
        let mut already_tracked = Vec::new();

        for det in &msg.objects {
            let mut det = det.clone();
            // 场景层级之间不传递 ReID
            det.reid = None;
            let point = match (det.lat_long_alt.take(), det.translation.take()) {
                (Some(_), Some(_)) => {
                    warn!(scene_id = %self.uid, "Input data must have only one of lat_long_alt and translation");
                    return Ok(true);
                }
                (Some(lla), None) if lla.len() == 3 => Point3::from(lla_to_ecef(lla[0], lla[1], lla[2])),
                (None, Some(t)) if t.len() >= 2 => Point3::new(t[0], t[1], t.get(2).copied().unwrap_or(0.0)),
                _ => {
                    debug!(scene_id = %self.uid, "Child object without usable location");
                    continue;
                }
            };
            let p = child_pose.transform_point(&point);
            det.translation = Some(vec![p.x, p.y, p.z]);

            let obj = match MovingObject::from_detection(&det, category, class.clone(), when, None, None) {
                Ok(obj) => obj,
                Err(e) => {
                    debug!(scene_id = %self.uid, child = %msg.id, error = %e, "Skipping child object");
                    continue;
                }
            };
            if retrack {
                objects.push(obj);
            } else {
                already_tracked.push(obj);
            }
        }

        self.finish_processing(category, when, objects, already_tracked);
        Ok(true)
    }

    /// 参考帧率取所有输入中最低的
    fn note_frame_rate(&mut self, rate: f64) {
        self.ref_frame_rate = Some(self.ref_frame_rate.map_or(rate, |r| r.min(rate)));
    }

    /// 可见性 → 异步提交追踪 → 基于当前快照评估事件
    pub fn finish_processing(
        &mut self,
        category: &str,
        when: f64,
        mut objects: Vec<MovingObject>,
        already_tracked: Vec<MovingObject>,
    ) {
        self.update_visible(&mut objects);
        let batch = Batch {
            objects,
            when,
            already_tracked,
            frame_rate: self.ref_frame_rate,
        };
        self.tracking.submit(category, batch);
        self.update_events(category, when);
    }

    pub fn update_visible(&self, objects: &mut [MovingObject]) {
        for obj in objects {
            let p = obj.point2();
            let mut visible: Vec<String> = self
                .cameras
                .values()
                .filter(|c| {
                    c.pose
                        .as_ref()
                        .and_then(CameraPose::region_of_view)
                        .is_some_and(|rov| rov.contains(&p))
                })
                .map(|c| c.uid.clone())
                .collect();
            visible.sort();
            obj.visibility = visible;
        }
    }

    /// 传感器数值；未知传感器返回 `Ok(false)`
    pub fn process_sensor_data(&mut self, msg: &SensorMessage, when: f64) -> Result<bool> {
        let Some(sensor) = self.sensors.get_mut(&msg.id) else {
            warn!(scene_id = %self.uid, sensor_id = %msg.id, "Unknown sensor");
            return Ok(false);
        };
        if sensor.reading.last_when.is_some_and(|last| when <= last) {
            info!(sensor_id = %msg.id, when = when, "Discarding past sensor data");
            return Ok(true);
        }

        sensor.reading.last_value = sensor.reading.value.replace(msg.value.clone());
        sensor.reading.last_when = Some(when);
        let members: Vec<MovingObject> = sensor.objects.values().flatten().cloned().collect();
        events::record_sensor_value(&msg.id, sensor, &members);

        self.events.push(SceneEvent {
            kind: EventKind::Region,
            event_type: EventType::Value,
            source_id: msg.id.clone(),
            from_sensor: true,
        });
        Ok(true)
    }

    /// 取走待发布的事件
    pub fn take_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub async fn shutdown(self) {
        self.tracking.shutdown().await;
    }
}

fn sync_regions(existing: &mut HashMap<String, Region>, records: &[flux_scene_types::RegionRecord], from_sensor: bool) {
    let keep: HashSet<&str> = records.iter().map(|r| r.uid.as_str()).collect();
    existing.retain(|uid, _| keep.contains(uid.as_str()));
    for record in records {
        match existing.get_mut(&record.uid) {
            Some(region) => region.update(record),
            None => {
                existing.insert(record.uid.clone(), Region::from_record(record, from_sensor));
            }
        }
    }
}

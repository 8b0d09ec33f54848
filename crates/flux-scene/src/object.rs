//! 融合后的运动物体

use crate::category::{ObjectClass, ShiftType};
use crate::geometry::CameraPose;
use flux_scene_core::{FusionError, Result};
use flux_scene_types::{BoundingBox, Detection};
use nalgebra::{Point2, Point3, UnitQuaternion, Vector3};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 已发布位置历史上限
pub const LOCATION_LIMIT: usize = 20;
/// 低于此速度（m/s）不根据速度推断朝向
pub const SPEED_THRESHOLD: f64 = 0.1;

/// 沿身份链向前传递的数据，同一 gid 的所有帧共享
#[derive(Debug, Default)]
pub struct ChainData {
    /// 区域 uid → 进入时间（epoch 秒）
    pub regions: HashMap<String, f64>,
    /// (时间, 位置)，最新在前
    pub published_locations: VecDeque<(f64, Point3<f64>)>,
    /// 传感器 uid → [(ISO 时间, 数值)]
    pub sensors: HashMap<String, Vec<(String, Value)>>,
    /// 绊线 uid → 已上报穿越的最新位置时间
    pub reported_crossings: HashMap<String, f64>,
}

impl ChainData {
    /// 记录一次发布位置；同一时刻的重复快照只记一次
    pub fn push_location(&mut self, when: f64, location: Point3<f64>) {
        if matches!(self.published_locations.front(), Some((last, _)) if *last == when) {
            return;
        }
        self.published_locations.push_front((when, location));
        self.published_locations.truncate(LOCATION_LIMIT);
    }

    /// 最近两次发布位置（新, 旧）
    pub fn last_segment(&self) -> Option<(Point2<f64>, Point2<f64>)> {
        let newest = self.published_locations.front()?;
        let previous = self.published_locations.get(1)?;
        Some((newest.1.xy(), previous.1.xy()))
    }

    /// 该绊线尚未上报过的最近运动段 (段末时间, 新, 旧)
    pub fn unreported_segment(&self, tripwire: &str) -> Option<(f64, Point2<f64>, Point2<f64>)> {
        let when = self.published_locations.front()?.0;
        if self.reported_crossings.get(tripwire) == Some(&when) {
            return None;
        }
        let (newest, previous) = self.last_segment()?;
        Some((when, newest, previous))
    }
}

/// 单个相机对物体的一次观测
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub camera_id: Option<String>,
    pub point: Point3<f64>,
    pub when: f64,
}

#[derive(Debug, Clone)]
pub struct MovingObject {
    /// 消息内的检测 id
    pub oid: Option<String>,
    /// 全局 id，由追踪线程分配
    pub gid: Option<String>,
    pub category: String,
    pub class: ObjectClass,
    pub camera_id: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    pub bounding_box_px: Option<BoundingBox>,
    pub when: f64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub location: Point3<f64>,
    pub velocity: Option<Vector3<f64>>,
    pub rotation: Option<[f64; 4]>,
    pub size: Option<[f64; 3]>,
    pub confidence: Option<f64>,
    pub reid: Option<Vec<f32>>,
    pub similarity: Option<f64>,
    pub frame_count: u32,
    /// 追踪器内部 id
    pub rv_id: Option<u64>,
    /// 提交追踪器时附带的序号
    pub submission_id: Option<usize>,
    pub visibility: Vec<String>,
    pub observations: Vec<Observation>,
    pub chain: Arc<Mutex<ChainData>>,
    pub info: Map<String, Value>,
}

impl MovingObject {
    /// 由一条检测构造；有相机位姿时映射到场景坐标，否则 `translation` 视为场景坐标
    pub fn from_detection(
        det: &Detection,
        category: &str,
        class: ObjectClass,
        when: f64,
        camera_id: Option<&str>,
        camera: Option<&CameraPose>,
    ) -> Result<Self> {
        let mut size = det.size.as_deref().and_then(to_array3).or(class.size);

        let location = match (det.translation.as_deref().and_then(to_array3), camera, &det.bounding_box) {
            (Some(t), Some(cam), _) => cam.camera_point_to_world(&Point3::from(t)),
            (Some(t), None, _) => Point3::from(t),
            (None, Some(cam), Some(bbox)) => {
                if size.is_none() {
                    size = estimate_size(bbox, cam);
                }
                ground_location(bbox, cam, class.shift, size).ok_or_else(|| {
                    FusionError::geometry("detection base point does not intersect the ground plane")
                })?
            }
            _ => return Err(FusionError::schema("detection has neither translation nor bounding box")),
        };

        let rotation = det.rotation.as_deref().and_then(to_array4).map(|q| match camera {
            Some(cam) => cam.pose().transform_rotation(&q),
            None => q,
        });

        let mut info = det.extra.clone();
        for key in RESERVED_KEYS {
            info.remove(*key);
        }

        Ok(Self {
            oid: det.id.clone(),
            gid: None,
            category: category.to_string(),
            class,
            camera_id: camera_id.map(str::to_string),
            bounding_box: det.bounding_box,
            bounding_box_px: det.bounding_box_px,
            when,
            first_seen: when,
            last_seen: when,
            location,
            velocity: det.velocity.as_deref().and_then(to_array3).map(Vector3::from),
            rotation,
            size,
            confidence: det.confidence,
            reid: det.reid.as_ref().map(|r| r.values()).filter(|v| !v.is_empty()),
            similarity: None,
            frame_count: 0,
            rv_id: None,
            submission_id: None,
            visibility: Vec::new(),
            observations: vec![Observation {
                camera_id: camera_id.map(str::to_string),
                point: location,
                when,
            }],
            chain: Arc::new(Mutex::new(ChainData::default())),
            info,
        })
    }

    pub fn gid(&self) -> &str {
        self.gid.as_deref().unwrap_or("")
    }

    /// 平面位置
    pub fn point2(&self) -> Point2<f64> {
        self.location.xy()
    }

    /// 延续上一帧的身份
    pub fn set_previous(&mut self, prev: &MovingObject) {
        self.gid = prev.gid.clone();
        self.first_seen = prev.first_seen;
        self.frame_count = prev.frame_count + 1;
        self.chain = Arc::clone(&prev.chain);
        if self.similarity.is_none() {
            self.similarity = prev.similarity;
        }
        if self.velocity.is_none() {
            let dt = self.when - prev.when;
            if dt > 0.0 {
                self.velocity = Some((self.location - prev.location) / dt);
            }
        }
        let mut observations = prev.observations.clone();
        observations.append(&mut self.observations);
        observations.sort_by(|a, b| a.when.total_cmp(&b.when));
        observations.dedup_by(|a, b| a.camera_id == b.camera_id && a.when == b.when);
        // 每个相机只保留最新观测
        let mut latest: Vec<Observation> = Vec::new();
        for obs in observations.into_iter().rev() {
            if !latest.iter().any(|o| o.camera_id == obs.camera_id) {
                latest.push(obs);
            }
        }
        latest.reverse();
        self.observations = latest;
    }

    /// 铸造新的全局 id，帧计数归 1
    pub fn set_gid(&mut self, gid: impl Into<String>) {
        self.gid = Some(gid.into());
        self.first_seen = self.when;
        self.frame_count = 1;
        self.chain = Arc::new(Mutex::new(ChainData::default()));
    }

    /// 速度超过阈值时朝向取运动方向（绕 z 轴）
    pub fn infer_rotation_from_velocity(&mut self) {
        if !self.class.rotation_from_velocity {
            return;
        }
        if let Some(v) = self.velocity {
            let speed = v.xy().norm();
            if speed > SPEED_THRESHOLD {
                let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), v.y.atan2(v.x));
                self.rotation = Some([q.i, q.j, q.k, q.w]);
            }
        }
    }

    /// 把像素框面积作为 ReID 样本质量依据
    pub fn pixel_area(&self) -> Option<f64> {
        self.bounding_box_px.map(|b| b.area())
    }
}

/// 输出报文里由引擎填写的字段，不从输入透传
const RESERVED_KEYS: &[&str] = &[
    "visibility",
    "regions",
    "sensors",
    "similarity",
    "first_seen",
    "camera_bounds",
    "direction",
    "from_child_scene",
];

fn to_array3(v: &[f64]) -> Option<[f64; 3]> {
    match v {
        [x, y, z] => Some([*x, *y, *z]),
        [x, y] => Some([*x, *y, 0.0]),
        _ => None,
    }
}

fn to_array4(v: &[f64]) -> Option<[f64; 4]> {
    match v {
        [x, y, z, w] => Some([*x, *y, *z, *w]),
        _ => None,
    }
}

/// 占地尺寸缺省时，由框底两角在地面上的距离估计
fn estimate_size(bbox: &BoundingBox, camera: &CameraPose) -> Option<[f64; 3]> {
    let bottom = bbox.y + bbox.height;
    let left = camera.ground_point(bbox.x, bottom)?;
    let right = camera.ground_point(bbox.x + bbox.width, bottom)?;
    let width = (right - left).norm();
    if width <= 0.0 || bbox.width <= 0.0 {
        return None;
    }
    Some([width, width, width * bbox.height / bbox.width])
}

fn ground_location(
    bbox: &BoundingBox,
    camera: &CameraPose,
    shift: ShiftType,
    size: Option<[f64; 3]>,
) -> Option<Point3<f64>> {
    let (bx, by) = bbox.bottom_center();
    let base = camera.ground_point(bx, by)?;
    let origin = camera.origin();

    let push_back = |p: Point3<f64>| -> Point3<f64> {
        let Some(size) = size else { return p };
        let offset = (size[0] + size[1]) / 2.0 / 2.0;
        let dir = Vector3::new(p.x - origin.x, p.y - origin.y, 0.0);
        let n = dir.norm();
        if n <= f64::EPSILON {
            return p;
        }
        p + dir / n * offset
    };

    match shift {
        ShiftType::None => Some(base),
        ShiftType::Type1 => Some(push_back(base)),
        ShiftType::Type2 => {
            let horizontal = ((base.x - origin.x).powi(2) + (base.y - origin.y).powi(2)).sqrt();
            let angle = origin.z.atan2(horizontal).to_degrees();
            let raised = by - (bbox.height / 2.0) * (angle / 90.0);
            let p = camera.ground_point(bx, raised).unwrap_or(base);
            Some(push_back(p))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::ObjectClassRegistry;
    use crate::geometry::{CameraIntrinsics, Pose};

    fn camera() -> CameraPose {
        let pose = Pose::from_components(&[0.0, 0.0, 3.0], &[-135.0, 0.0, 0.0], None).unwrap();
        CameraPose::new(pose, CameraIntrinsics::from_fov(70.0, 640.0, 480.0), (640.0, 480.0))
    }

    fn at(x: f64, y: f64, when: f64) -> MovingObject {
        let det = Detection {
            translation: Some(vec![x, y, 0.0]),
            ..Default::default()
        };
        MovingObject::from_detection(&det, "person", ObjectClassRegistry::new().lookup("person"), when, None, None)
            .unwrap()
    }

    #[test]
    fn test_frame_count_chain() {
        let mut first = at(0.0, 0.0, 0.0);
        first.set_gid("g1");
        assert_eq!(first.frame_count, 1);

        let mut prev = first;
        for i in 1..5 {
            let mut next = at(i as f64 * 0.1, 0.0, i as f64 * 0.1);
            next.set_previous(&prev);
            assert_eq!(next.frame_count, prev.frame_count + 1);
            assert_eq!(next.gid(), "g1");
            assert!(Arc::ptr_eq(&next.chain, &prev.chain));
            prev = next;
        }
        assert_eq!(prev.frame_count, 5);
        assert_eq!(prev.first_seen, 0.0);

        let mut reborn = at(9.0, 9.0, 1.0);
        reborn.set_previous(&prev);
        reborn.set_gid("g2");
        assert_eq!(reborn.frame_count, 1);
        assert!(!Arc::ptr_eq(&reborn.chain, &prev.chain));
    }

    #[test]
    fn test_velocity_and_rotation() {
        let mut prev = at(0.0, 0.0, 0.0);
        prev.set_gid("g");
        let mut class = ObjectClassRegistry::new().lookup("vehicle");
        class.rotation_from_velocity = true;
        let mut next = at(0.0, 1.0, 0.5);
        next.class = class;
        next.set_previous(&prev);
        next.infer_rotation_from_velocity();
        let v = next.velocity.unwrap();
        assert!((v.y - 2.0).abs() < 1e-9);
        let [_, _, z, w] = next.rotation.unwrap();
        // 朝向 +y，绕 z 轴 90 度
        assert!((z - (0.5f64).sqrt()).abs() < 1e-9);
        assert!((w - (0.5f64).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_location_from_bbox_is_pushed_back() {
        let cam = camera();
        // 图像中心列、框底在主点
        let bbox = BoundingBox::new(-0.05, -0.2, 0.1, 0.2);
        let det = Detection { bounding_box: Some(bbox), ..Default::default() };
        let obj = MovingObject::from_detection(
            &det,
            "person",
            ObjectClassRegistry::new().lookup("person"),
            0.0,
            Some("cam1"),
            Some(&cam),
        )
        .unwrap();
        // 底点落地于 y=3，再后移 0.25
        assert!((obj.location.y - 3.25).abs() < 1e-9);
        assert!(obj.location.x.abs() < 1e-9);
        assert_eq!(obj.observations.len(), 1);
    }

    #[test]
    fn test_missing_location_is_schema_error() {
        let det = Detection::default();
        let err = MovingObject::from_detection(&det, "person", ObjectClassRegistry::new().lookup("person"), 0.0, None, None)
            .unwrap_err();
        assert!(err.is_message_scoped());
    }

    #[test]
    fn test_published_locations_capped_and_deduped() {
        let mut chain = ChainData::default();
        for i in 0..30 {
            chain.push_location(i as f64, Point3::new(i as f64, 0.0, 0.0));
        }
        chain.push_location(29.0, Point3::new(100.0, 0.0, 0.0));
        assert_eq!(chain.published_locations.len(), LOCATION_LIMIT);
        let (newest, prev) = chain.last_segment().unwrap();
        assert_eq!(newest.x, 29.0);
        assert_eq!(prev.x, 28.0);
    }
}

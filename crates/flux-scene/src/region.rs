//! 区域与绊线：形状判定以及按类别维护的成员状态

use crate::geometry::{circle_contains, cross_sign, segments_intersect, Polygon, Pose};
use crate::object::MovingObject;
use flux_scene_types::{AreaRecord, RegionRecord, TripwireRecord};
use nalgebra::Point2;
use serde_json::{json, Value};
use std::collections::HashMap;

/// 两次事件之间的最小间隔（秒）
pub const DEBOUNCE_DELAY: f64 = 0.5;
/// 进入区域前物体至少存活的帧数（严格大于）
pub const MIN_FRAMES_FOR_EVENTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Area {
    Scene,
    Circle { center: Point2<f64>, radius: f64 },
    Poly(Polygon),
}

impl Area {
    pub fn from_record(record: &AreaRecord) -> Self {
        match record {
            AreaRecord::Scene => Area::Scene,
            AreaRecord::Circle { center, radius } => Area::Circle {
                center: Point2::new(center[0], center[1]),
                radius: *radius,
            },
            AreaRecord::Poly(points) => Area::Poly(Polygon::from_pairs(points)),
        }
    }

    pub fn contains(&self, p: &Point2<f64>) -> bool {
        match self {
            Area::Scene => true,
            Area::Circle { center, radius } => circle_contains(center, *radius, p),
            Area::Poly(poly) => poly.contains(p),
        }
    }

    /// 套用子场景变换后的形状；圆半径按变换的平面缩放调整
    pub fn transformed(&self, pose: &Pose) -> Self {
        match self {
            Area::Scene => Area::Scene,
            Area::Circle { center, radius } => {
                let c = pose.transform_point_2d(center);
                let edge = pose.transform_point_2d(&Point2::new(center.x + radius, center.y));
                Area::Circle { center: c, radius: (edge - c).norm() }
            }
            Area::Poly(poly) => Area::Poly(Polygon::new(
                poly.points().iter().map(|p| pose.transform_point_2d(p)).collect(),
            )),
        }
    }

    fn serialize_into(&self, out: &mut serde_json::Map<String, Value>) {
        match self {
            Area::Scene => {
                out.insert("area".into(), json!("scene"));
            }
            Area::Circle { center, radius } => {
                out.insert("area".into(), json!("circle"));
                out.insert("center".into(), json!([center.x, center.y]));
                out.insert("radius".into(), json!(radius));
            }
            Area::Poly(poly) => {
                out.insert("area".into(), json!("poly"));
                out.insert("points".into(), json!(poly.to_pairs()));
            }
        }
    }
}

/// 传感器区域的当前读数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub value: Option<Value>,
    pub last_value: Option<Value>,
    pub last_when: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Region {
    pub uid: String,
    pub name: String,
    pub area: Area,
    pub singleton_type: Option<String>,
    pub from_sensor: bool,
    /// 类别 → 当前成员，每轮更新
    pub objects: HashMap<String, Vec<MovingObject>>,
    /// 本轮的进入
    pub entered: HashMap<String, Vec<MovingObject>>,
    /// 本轮的离开 (物体, 停留秒数)
    pub exited: HashMap<String, Vec<(MovingObject, f64)>>,
    /// 上次发出事件时各类别的成员数
    pub last_counts: HashMap<String, usize>,
    /// 上次发出事件的时间
    pub when: f64,
    pub reading: SensorReading,
}

impl Region {
    pub fn from_record(record: &RegionRecord, from_sensor: bool) -> Self {
        Self {
            uid: record.uid.clone(),
            name: record.name.clone(),
            area: Area::from_record(&record.area_kind()),
            singleton_type: record.singleton_type.clone(),
            from_sensor,
            objects: HashMap::new(),
            entered: HashMap::new(),
            exited: HashMap::new(),
            last_counts: HashMap::new(),
            when: 0.0,
            reading: SensorReading::default(),
        }
    }

    /// 原地更新形状与名称，保留成员状态
    pub fn update(&mut self, record: &RegionRecord) {
        self.name = record.name.clone();
        self.area = Area::from_record(&record.area_kind());
        self.singleton_type = record.singleton_type.clone();
    }

    pub fn contains(&self, p: &Point2<f64>) -> bool {
        self.area.contains(p)
    }

    pub fn is_environmental(&self) -> bool {
        self.singleton_type.as_deref() == Some("environmental")
    }

    pub fn count(&self, category: &str) -> usize {
        self.objects.get(category).map(Vec::len).unwrap_or(0)
    }

    /// 清空已发布的进入/离开记录
    pub fn clear_transients(&mut self) {
        self.entered.clear();
        self.exited.clear();
    }

    /// 事件 metadata
    pub fn serialize(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("uuid".into(), json!(self.uid));
        out.insert("title".into(), json!(self.name));
        self.area.serialize_into(&mut out);
        if self.from_sensor {
            out.insert("fromSensor".into(), json!(true));
        }
        Value::Object(out)
    }
}

/// 绊线穿越
#[derive(Debug, Clone)]
pub struct Crossing {
    pub object: MovingObject,
    pub direction: i8,
}

#[derive(Debug, Clone)]
pub struct Tripwire {
    pub uid: String,
    pub name: String,
    pub points: Vec<Point2<f64>>,
    /// 类别 → 最近一次发出事件的穿越列表
    pub objects: HashMap<String, Vec<Crossing>>,
    pub when: f64,
}

impl Tripwire {
    pub fn from_record(record: &TripwireRecord) -> Self {
        Self {
            uid: record.uid.clone(),
            name: record.name.clone(),
            points: record.points.iter().map(|p| Point2::new(p[0], p[1])).collect(),
            objects: HashMap::new(),
            when: 0.0,
        }
    }

    pub fn update(&mut self, record: &TripwireRecord) {
        self.name = record.name.clone();
        self.points = record.points.iter().map(|p| Point2::new(p[0], p[1])).collect();
    }

    /// 运动段（新 → 旧）与绊线的穿越方向；未穿越为 0
    ///
    /// 方向为 `(b - a) × (旧位置 - a)` 的符号，绊线点序反转则方向反转。
    pub fn crossing_direction(&self, newest: &Point2<f64>, previous: &Point2<f64>) -> i8 {
        for seg in self.points.windows(2) {
            let (a, b) = (&seg[0], &seg[1]);
            if segments_intersect(newest, previous, a, b) {
                return cross_sign(a, b, previous);
            }
        }
        0
    }

    pub fn count(&self, category: &str) -> usize {
        self.objects.get(category).map(Vec::len).unwrap_or(0)
    }

    pub fn serialize(&self) -> Value {
        json!({
            "uuid": self.uid,
            "title": self.name,
            "points": self.points.iter().map(|p| [p.x, p.y]).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripwire(points: Vec<[f64; 2]>) -> Tripwire {
        Tripwire::from_record(&TripwireRecord { uid: "tw".into(), name: "gate".into(), points })
    }

    #[test]
    fn test_tripwire_reverse_flips_sign() {
        let forward = tripwire(vec![[0.0, -1.0], [0.0, 1.0]]);
        let reverse = tripwire(vec![[0.0, 1.0], [0.0, -1.0]]);
        let (newest, previous) = (Point2::new(1.0, 0.0), Point2::new(-1.0, 0.0));

        let d = forward.crossing_direction(&newest, &previous);
        assert_ne!(d, 0);
        assert_eq!(reverse.crossing_direction(&newest, &previous), -d);

        // 反向运动方向也反转
        assert_eq!(forward.crossing_direction(&previous, &newest), -d);
    }

    #[test]
    fn test_tripwire_no_crossing() {
        let tw = tripwire(vec![[0.0, -1.0], [0.0, 1.0]]);
        assert_eq!(tw.crossing_direction(&Point2::new(1.0, 0.0), &Point2::new(2.0, 0.0)), 0);
        assert_eq!(tw.crossing_direction(&Point2::new(-1.0, 5.0), &Point2::new(1.0, 5.0)), 0);
    }

    #[test]
    fn test_polyline_tripwire() {
        let tw = tripwire(vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0]]);
        assert_ne!(tw.crossing_direction(&Point2::new(3.0, 1.0), &Point2::new(1.0, 1.0)), 0);
    }

    #[test]
    fn test_region_update_keeps_members() {
        let record = RegionRecord::polygon("r1", "door", vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]);
        let mut region = Region::from_record(&record, false);
        region.objects.insert("person".into(), Vec::new());
        region.last_counts.insert("person".into(), 2);

        let mut moved = record.clone();
        moved.name = "front door".into();
        moved.points = vec![[0.0, 0.0], [5.0, 0.0], [5.0, 5.0], [0.0, 5.0]];
        region.update(&moved);
        assert_eq!(region.name, "front door");
        assert!(region.contains(&Point2::new(4.0, 4.0)));
        assert_eq!(region.last_counts["person"], 2);
    }

    #[test]
    fn test_area_transform() {
        let pose = Pose::from_components(&[10.0, 0.0, 0.0], &[0.0, 0.0, 0.0], Some(&[2.0])).unwrap();
        let circle = Area::Circle { center: Point2::new(1.0, 1.0), radius: 1.0 };
        match circle.transformed(&pose) {
            Area::Circle { center, radius } => {
                assert!((center.x - 12.0).abs() < 1e-9);
                assert!((radius - 2.0).abs() < 1e-9);
            }
            other => panic!("unexpected area {other:?}"),
        }
    }

    #[test]
    fn test_sensor_metadata() {
        let record = RegionRecord {
            uid: "temp".into(),
            name: "thermo".into(),
            area: Some("circle".into()),
            points: vec![],
            radius: Some(2.0),
            center: Some([0.0, 0.0]),
            singleton_type: Some("environmental".into()),
        };
        let region = Region::from_record(&record, true);
        assert!(region.is_environmental());
        let meta = region.serialize();
        assert_eq!(meta["fromSensor"], json!(true));
        assert_eq!(meta["area"], json!("circle"));
    }
}

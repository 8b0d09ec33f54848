//! 场景存储（REST）返回的记录

use crate::detection::Intrinsics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 位姿：4x4 矩阵，或平移/旋转/缩放分量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoseRecord {
    Matrix(Vec<Vec<f64>>),
    Components {
        translation: Vec<f64>,
        rotation: Vec<f64>,
        #[serde(default)]
        scale: Option<Vec<f64>>,
    },
}

/// 场景
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// 本场景坐标到父场景坐标的变换
    #[serde(default)]
    pub transform: Option<PoseRecord>,
    #[serde(default)]
    pub retrack: Option<bool>,
    #[serde(default)]
    pub output_lla: bool,
    #[serde(default)]
    pub regulated_rate: Option<f64>,
    #[serde(default)]
    pub external_update_rate: Option<f64>,
    /// 追踪器名称，缺省用默认追踪器
    #[serde(default)]
    pub tracker: Option<String>,
    #[serde(default)]
    pub cameras: Vec<CameraRecord>,
    #[serde(default)]
    pub regions: Vec<RegionRecord>,
    #[serde(default)]
    pub tripwires: Vec<TripwireRecord>,
    #[serde(default)]
    pub sensors: Vec<SensorRecord>,
    /// 子场景名称
    #[serde(default)]
    pub children: Vec<String>,
}

impl SceneRecord {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            parent: None,
            transform: None,
            retrack: None,
            output_lla: false,
            regulated_rate: None,
            external_update_rate: None,
            tracker: None,
            cameras: Vec::new(),
            regions: Vec::new(),
            tripwires: Vec::new(),
            sensors: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// 相机；`translation` 与 `rotation` 同时存在才视为已标定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub translation: Option<Vec<f64>>,
    #[serde(default)]
    pub rotation: Option<Vec<f64>>,
    #[serde(default)]
    pub scale: Option<Vec<f64>>,
    #[serde(default)]
    pub intrinsics: Option<Intrinsics>,
    /// 水平视场角（度），无内参时使用
    #[serde(default)]
    pub fov: Option<f64>,
    #[serde(default)]
    pub distortion: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub resolution: Option<[f64; 2]>,
}

/// 区域形状
#[derive(Debug, Clone, PartialEq)]
pub enum AreaRecord {
    Scene,
    Circle { center: [f64; 2], radius: f64 },
    Poly(Vec<[f64; 2]>),
}

/// 区域（传感器区域共用此结构）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub points: Vec<[f64; 2]>,
    #[serde(default)]
    pub radius: Option<f64>,
    #[serde(default)]
    pub center: Option<[f64; 2]>,
    #[serde(default)]
    pub singleton_type: Option<String>,
}

impl RegionRecord {
    pub fn polygon(uid: impl Into<String>, name: impl Into<String>, points: Vec<[f64; 2]>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            area: Some("poly".to_string()),
            points,
            radius: None,
            center: None,
            singleton_type: None,
        }
    }

    /// 形状；未声明时有点集按多边形，否则整场景
    pub fn area_kind(&self) -> AreaRecord {
        match self.area.as_deref() {
            Some("scene") => AreaRecord::Scene,
            Some("circle") => AreaRecord::Circle {
                center: self.center.unwrap_or([0.0, 0.0]),
                radius: self.radius.unwrap_or(0.0),
            },
            _ if self.points.is_empty() => AreaRecord::Scene,
            _ => AreaRecord::Poly(self.points.clone()),
        }
    }
}

pub type SensorRecord = RegionRecord;

/// 绊线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripwireRecord {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    pub points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    Local,
    Remote,
}

/// 子场景链接
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSceneRecord {
    pub name: String,
    pub parent: String,
    pub child_type: ChildKind,
    /// 本地子场景 uid
    #[serde(default)]
    pub child: Option<String>,
    #[serde(default)]
    pub remote_child_id: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default)]
    pub transform: Option<PoseRecord>,
    #[serde(default)]
    pub retrack: bool,
}

/// 物体类别资产，覆盖内置类别参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub name: String,
    #[serde(default)]
    pub x_size: Option<f64>,
    #[serde(default)]
    pub y_size: Option<f64>,
    #[serde(default)]
    pub z_size: Option<f64>,
    #[serde(default)]
    pub tracking_radius: Option<f64>,
    #[serde(default)]
    pub shift_type: Option<u8>,
    #[serde(default)]
    pub rotation_from_velocity: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_region_area_kind() {
        let r: RegionRecord = serde_json::from_value(json!({
            "uid": "r1", "name": "door", "points": [[0, 0], [1, 0], [1, 1]]
        }))
        .unwrap();
        assert!(matches!(r.area_kind(), AreaRecord::Poly(p) if p.len() == 3));

        let c: RegionRecord = serde_json::from_value(json!({
            "uid": "s1", "area": "circle", "center": [1.0, 2.0], "radius": 3.0
        }))
        .unwrap();
        assert_eq!(c.area_kind(), AreaRecord::Circle { center: [1.0, 2.0], radius: 3.0 });

        let s: RegionRecord = serde_json::from_value(json!({"uid": "s2"})).unwrap();
        assert_eq!(s.area_kind(), AreaRecord::Scene);
    }

    #[test]
    fn test_pose_record_forms() {
        let m: PoseRecord = serde_json::from_value(json!([[1, 0, 0, 0], [0, 1, 0, 0], [0, 0, 1, 0], [0, 0, 0, 1]])).unwrap();
        assert!(matches!(m, PoseRecord::Matrix(_)));
        let c: PoseRecord = serde_json::from_value(json!({"translation": [1, 2, 3], "rotation": [0, 0, 90]})).unwrap();
        assert!(matches!(c, PoseRecord::Components { scale: None, .. }));
    }

    #[test]
    fn test_child_record() {
        let c: ChildSceneRecord = serde_json::from_value(json!({
            "name": "floor1", "parent": "building", "child_type": "remote",
            "remote_child_id": "rc-1", "host_name": "10.0.0.2", "retrack": true
        }))
        .unwrap();
        assert_eq!(c.child_type, ChildKind::Remote);
        assert!(c.retrack);
    }
}

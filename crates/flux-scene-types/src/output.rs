//! 发布到总线的融合结果与事件

use crate::detection::BoundingBox;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 物体在某区域内的成员信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub entered: String,
}

/// 融合后的物体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    #[serde(rename = "id")]
    pub gid: String,
    #[serde(rename = "type")]
    pub category: String,
    pub translation: [f64; 3],
    #[serde(default)]
    pub size: Option<[f64; 3]>,
    #[serde(default)]
    pub velocity: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_long_alt: Option<[f64; 3]>,
    #[serde(default)]
    pub visibility: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub camera_bounds: BTreeMap<String, BoundingBox>,
    #[serde(default)]
    pub regions: BTreeMap<String, RegionEntry>,
    #[serde(default)]
    pub sensors: BTreeMap<String, Vec<(String, Value)>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub first_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<i8>,
    #[serde(flatten)]
    pub info: Map<String, Value>,
}

/// 场景/区域检测报文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub id: String,
    pub name: String,
    pub timestamp: String,
    pub objects: Vec<ObjectRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_detection_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

/// 限速的全类别合并视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatedOutput {
    pub timestamp: String,
    pub id: String,
    pub name: String,
    pub scene_rate: f64,
    pub rate: BTreeMap<String, f64>,
    pub objects: Vec<ObjectRecord>,
}

/// 离开记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub object: ObjectRecord,
    pub dwell: f64,
}

/// 区域/绊线事件
///
/// `source` 携带 `<kind>_id` 与 `<kind>_name`，kind 为 `region` 或 `tripwire`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub timestamp: String,
    pub scene_id: String,
    pub scene_name: String,
    #[serde(flatten)]
    pub source: Map<String, Value>,
    pub counts: BTreeMap<String, usize>,
    pub objects: Vec<ObjectRecord>,
    pub entered: Vec<ObjectRecord>,
    pub exited: Vec<ExitRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl EventMessage {
    pub fn new(
        timestamp: String,
        scene_id: impl Into<String>,
        scene_name: impl Into<String>,
        kind: &str,
        source_id: &str,
        source_name: &str,
    ) -> Self {
        let mut source = Map::new();
        source.insert(format!("{kind}_id"), Value::String(source_id.to_string()));
        source.insert(format!("{kind}_name"), Value::String(source_name.to_string()));
        Self {
            timestamp,
            scene_id: scene_id.into(),
            scene_name: scene_name.into(),
            source,
            counts: BTreeMap::new(),
            objects: Vec::new(),
            entered: Vec::new(),
            exited: Vec::new(),
            value: None,
            metadata: Value::Null,
        }
    }

    /// 事件所有对象的可变迭代（objects、entered、exited）
    pub fn all_objects_mut(&mut self) -> impl Iterator<Item = &mut ObjectRecord> {
        self.objects
            .iter_mut()
            .chain(self.entered.iter_mut())
            .chain(self.exited.iter_mut().map(|e| &mut e.object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object() -> ObjectRecord {
        ObjectRecord {
            gid: "g1".into(),
            category: "person".into(),
            translation: [1.0, 2.0, 0.0],
            size: None,
            velocity: None,
            rotation: None,
            lat_long_alt: None,
            visibility: vec!["cam1".into()],
            camera_bounds: BTreeMap::new(),
            regions: BTreeMap::new(),
            sensors: BTreeMap::new(),
            confidence: Some(0.8),
            similarity: None,
            first_seen: None,
            direction: None,
            info: Map::new(),
        }
    }

    #[test]
    fn test_object_serializes_gid_as_id() {
        let v = serde_json::to_value(object()).unwrap();
        assert_eq!(v["id"], "g1");
        assert_eq!(v["type"], "person");
        assert!(v.get("rotation").is_none());
    }

    #[test]
    fn test_event_source_keys() {
        let mut ev = EventMessage::new("t".into(), "s1", "lobby", "tripwire", "tw1", "gate");
        ev.exited.push(ExitRecord { object: object(), dwell: 1.5 });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["tripwire_id"], json!("tw1"));
        assert_eq!(v["tripwire_name"], json!("gate"));
        assert_eq!(v["exited"][0]["dwell"], json!(1.5));
        let back: EventMessage = serde_json::from_value(v).unwrap();
        assert_eq!(back.source["tripwire_id"], json!("tw1"));
        assert_eq!(ev.all_objects_mut().count(), 1);
    }
}

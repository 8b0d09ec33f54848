//! 子场景联邦：链接、远程会话契约与事件再发布时的坐标变换

use crate::geometry::Pose;
use async_trait::async_trait;
use flux_scene_core::Result;
use flux_scene_types::{ChildKind, ChildSceneRecord, EventMessage, Message};
use nalgebra::{Point2, Point3};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 父场景处理子场景数据所需的信息
#[derive(Debug, Clone)]
pub struct ChildLink {
    /// 本地子场景 uid 或远程子场景 id
    pub child_id: String,
    pub name: String,
    pub parent: String,
    pub kind: ChildKind,
    /// 子场景坐标 → 父场景坐标
    pub pose: Pose,
    pub retrack: bool,
}

impl ChildLink {
    pub fn from_record(record: &ChildSceneRecord) -> Option<Self> {
        let child_id = match record.child_type {
            ChildKind::Local => record.child.clone(),
            ChildKind::Remote => record.remote_child_id.clone(),
        }?;
        let pose = match &record.transform {
            Some(t) => match Pose::from_record(t) {
                Ok(pose) => pose,
                Err(e) => {
                    warn!(child = %record.name, error = %e, "Invalid child transform");
                    return None;
                }
            },
            None => Pose::identity(),
        };
        Some(Self {
            child_id,
            name: record.name.clone(),
            parent: record.parent.clone(),
            kind: record.child_type,
            pose,
            retrack: record.retrack,
        })
    }
}

/// 远程子场景会话产生的事件
#[derive(Debug, Clone)]
pub enum ChildEvent {
    Connected { child_id: String },
    Disconnected { child_id: String },
    Message { child_id: String, message: Message },
}

/// 建立到远程子场景总线的会话
///
/// 连接成功后订阅 `filters`，收到的消息与连接状态写入 `events`。断开后不自动重连。
#[async_trait]
pub trait ChildConnector: Send + Sync {
    async fn connect(
        &self,
        record: &ChildSceneRecord,
        filters: Vec<String>,
        events: mpsc::Sender<ChildEvent>,
    ) -> Result<Box<dyn ChildSession>>;
}

#[async_trait]
pub trait ChildSession: Send {
    async fn close(self: Box<Self>);
}

/// 远程子场景的连接状态
pub struct RemoteChild {
    pub record: ChildSceneRecord,
    pub connected: bool,
    session: Option<Box<dyn ChildSession>>,
}

impl RemoteChild {
    pub fn new(record: ChildSceneRecord, session: Option<Box<dyn ChildSession>>) -> Self {
        Self { record, connected: false, session }
    }

    pub fn status(&self) -> &'static str {
        if self.connected {
            "connected"
        } else {
            "disconnected"
        }
    }

    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        info!(child = %self.record.name, "Remote child closed");
    }
}

/// 把子场景事件中的位置与区域形状变换到父场景坐标，并记录来源链
pub fn transform_event(event: &mut EventMessage, link: &ChildLink) {
    for obj in event.all_objects_mut() {
        let [x, y, z] = obj.translation;
        let p = link.pose.transform_point(&Point3::new(x, y, z));
        obj.translation = [p.x, p.y, p.z];
    }

    if !event.metadata.is_object() {
        event.metadata = json!({});
    }
    apply_child_transform(&mut event.metadata, &link.pose);

    if let Some(meta) = event.metadata.as_object_mut() {
        let chain = match meta.get("from_child_scene").and_then(Value::as_str) {
            Some(existing) => format!("{} > {}", link.name, existing),
            None => link.name.clone(),
        };
        meta.insert("from_child_scene".into(), Value::String(chain));
    }
}

/// 区域 metadata 中的 `points` 与 `center` 做平面变换，圆半径随变换缩放
pub fn apply_child_transform(metadata: &mut Value, pose: &Pose) {
    let transform = |v: &Value| -> Option<Value> {
        let arr = v.as_array()?;
        let (x, y) = (arr.first()?.as_f64()?, arr.get(1)?.as_f64()?);
        let p = pose.transform_point_2d(&Point2::new(x, y));
        Some(json!([p.x, p.y]))
    };

    let Some(meta) = metadata.as_object_mut() else { return };
    if let Some(Value::Array(points)) = meta.get_mut("points") {
        for point in points.iter_mut() {
            if let Some(p) = transform(point) {
                *point = p;
            }
        }
    }
    let Some(center) = meta.get("center").and_then(|c| {
        let arr = c.as_array()?;
        Some(Point2::new(arr.first()?.as_f64()?, arr.get(1)?.as_f64()?))
    }) else {
        return;
    };
    let c = pose.transform_point_2d(&center);
    meta.insert("center".into(), json!([c.x, c.y]));
    if let Some(radius) = meta.get("radius").and_then(Value::as_f64) {
        let edge = pose.transform_point_2d(&Point2::new(center.x + radius, center.y));
        meta.insert("radius".into(), json!((edge - c).norm()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_scene_types::ObjectRecord;

    fn link(name: &str, dx: f64) -> ChildLink {
        ChildLink {
            child_id: name.to_string(),
            name: name.to_string(),
            parent: "parent".into(),
            kind: ChildKind::Local,
            pose: Pose::from_components(&[dx, 0.0, 0.0], &[0.0, 0.0, 0.0], None).unwrap(),
            retrack: true,
        }
    }

    fn event() -> EventMessage {
        let mut e = EventMessage::new("t".into(), "child", "child", "region", "r1", "door");
        let obj: ObjectRecord = serde_json::from_value(json!({
            "id": "g1", "type": "person", "translation": [1.0, 2.0, 0.0]
        }))
        .unwrap();
        e.objects.push(obj);
        e.metadata = json!({"uuid": "r1", "area": "poly", "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]});
        e
    }

    #[test]
    fn test_transform_and_provenance_chain() {
        let mut e = event();
        transform_event(&mut e, &link("childB", 5.0));
        assert_eq!(e.objects[0].translation, [6.0, 2.0, 0.0]);
        assert_eq!(e.metadata["points"][1], json!([6.0, 0.0]));
        assert_eq!(e.metadata["from_child_scene"], "childB");

        transform_event(&mut e, &link("childA", 1.0));
        assert_eq!(e.objects[0].translation, [7.0, 2.0, 0.0]);
        assert_eq!(e.metadata["from_child_scene"], "childA > childB");
    }

    #[test]
    fn test_circle_radius_follows_scale() {
        let pose = Pose::from_components(&[1.0, 0.0, 0.0], &[0.0, 0.0, 0.0], Some(&[2.0, 2.0, 2.0][..])).unwrap();
        let mut meta = json!({"uuid": "r2", "area": "circle", "center": [1.0, 1.0], "radius": 1.5});
        apply_child_transform(&mut meta, &pose);

        let center: Vec<f64> = serde_json::from_value(meta["center"].clone()).unwrap();
        assert!((center[0] - 3.0).abs() < 1e-9);
        assert!((center[1] - 2.0).abs() < 1e-9);
        assert!((meta["radius"].as_f64().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_link_from_record() {
        let record: ChildSceneRecord = serde_json::from_value(json!({
            "name": "annex", "parent": "main", "child_type": "remote", "remote_child_id": "r-9",
            "host_name": "annex.local", "retrack": true
        }))
        .unwrap();
        let link = ChildLink::from_record(&record).unwrap();
        assert_eq!(link.child_id, "r-9");
        assert_eq!(link.kind, ChildKind::Remote);

        let missing: ChildSceneRecord =
            serde_json::from_value(json!({"name": "x", "parent": "main", "child_type": "local"})).unwrap();
        assert!(ChildLink::from_record(&missing).is_none());
    }
}

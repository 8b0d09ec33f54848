//! MovingObject → 输出记录

use crate::geometry::earth::ecef_to_lla;
use crate::object::MovingObject;
use crate::region::Crossing;
use crate::scene::Camera;
use flux_scene_types::time::format_iso;
use flux_scene_types::{BoundingBox, ObjectRecord, RegionEntry};
use nalgebra::Point3;
use std::collections::{BTreeMap, HashMap};

/// 生成输出记录时用到的场景信息
#[derive(Clone, Copy)]
pub struct BuildOptions<'a> {
    pub cameras: &'a HashMap<String, Camera>,
    /// 场景坐标为 ECEF，输出时附带经纬高
    pub output_lla: bool,
    /// 计算每个可见相机里的像素框
    pub camera_bounds: bool,
}

pub fn build_object(obj: &MovingObject, opts: BuildOptions<'_>) -> ObjectRecord {
    let velocity = obj.velocity.map(|v| [v.x, v.y, v.z]).unwrap_or([0.0, 0.0, 0.0]);
    let (regions, sensors) = {
        let chain = obj.chain.lock();
        let regions: BTreeMap<String, RegionEntry> = chain
            .regions
            .iter()
            .map(|(k, when)| (k.clone(), RegionEntry { entered: format_iso(*when) }))
            .collect();
        let sensors: BTreeMap<_, _> = chain.sensors.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        (regions, sensors)
    };

    let lat_long_alt = opts.output_lla.then(|| {
        let lla = ecef_to_lla(&obj.location.coords);
        [lla.x, lla.y, lla.z]
    });

    let mut info = obj.info.clone();
    if let Some(reid) = &obj.reid {
        info.insert("reid".into(), serde_json::json!(reid));
    }

    let mut record = ObjectRecord {
        gid: obj.gid().to_string(),
        category: obj.category.clone(),
        translation: [obj.location.x, obj.location.y, obj.location.z],
        size: obj.size,
        velocity: Some(velocity),
        rotation: obj.rotation,
        lat_long_alt,
        visibility: obj.visibility.clone(),
        camera_bounds: BTreeMap::new(),
        regions,
        sensors,
        confidence: obj.confidence,
        similarity: obj.similarity,
        first_seen: Some(format_iso(obj.first_seen)),
        direction: None,
        info,
    };
    if opts.camera_bounds {
        record.camera_bounds = camera_bounds(obj, opts.cameras);
    }
    record
}

pub fn build_objects<'o>(objects: impl IntoIterator<Item = &'o MovingObject>, opts: BuildOptions<'_>) -> Vec<ObjectRecord> {
    objects.into_iter().map(|o| build_object(o, opts)).collect()
}

/// 绊线事件里的物体带穿越方向
pub fn build_crossing(crossing: &Crossing, opts: BuildOptions<'_>) -> ObjectRecord {
    let mut record = build_object(&crossing.object, opts);
    record.direction = Some(crossing.direction);
    record
}

/// 检测来源相机用原始像素框，其它可见相机用估计尺寸投影
fn camera_bounds(obj: &MovingObject, cameras: &HashMap<String, Camera>) -> BTreeMap<String, BoundingBox> {
    let mut bounds = BTreeMap::new();
    for camera_id in &obj.visibility {
        if obj.camera_id.as_deref() == Some(camera_id.as_str()) {
            if let Some(px) = obj.bounding_box_px {
                bounds.insert(camera_id.clone(), px);
            }
            continue;
        }
        let Some(pose) = cameras.get(camera_id).and_then(|c| c.pose.as_ref()) else { continue };
        let Some(size) = obj.size else { continue };
        let base = pose.world_to_pixel(&obj.location);
        let top = pose.world_to_pixel(&Point3::new(obj.location.x, obj.location.y, obj.location.z + size[2]));
        if let (Some((bx, by)), Some((_, ty))) = (base, top) {
            let height = (by - ty).abs();
            let width = if size[2] > 0.0 { height * size[0] / size[2] } else { 0.0 };
            bounds.insert(camera_id.clone(), BoundingBox::new(bx - width / 2.0, by.min(ty), width, height));
        }
    }
    bounds
}

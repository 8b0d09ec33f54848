//! 区域与绊线事件状态机
//!
//! 成员关系每轮都更新；防抖只限制事件的发出。

use super::Scene;
use crate::builder::{build_crossing, build_object, build_objects, BuildOptions};
use crate::object::MovingObject;
use crate::region::{Crossing, Region, DEBOUNCE_DELAY, MIN_FRAMES_FOR_EVENTS};
use flux_scene_types::time::format_iso;
use flux_scene_types::{EventMessage, ExitRecord};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Region,
    Tripwire,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Region => "region",
            EventKind::Tripwire => "tripwire",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// 成员变化
    Objects,
    /// 成员数变化
    Count,
    /// 传感器读数
    Value,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Objects => "objects",
            EventType::Count => "count",
            EventType::Value => "value",
        }
    }
}

/// 待发布事件，发布时再从区域状态生成报文
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SceneEvent {
    pub kind: EventKind,
    pub event_type: EventType,
    pub source_id: String,
    /// 来源为传感器区域
    pub from_sensor: bool,
}

/// 区域一轮评估的结果
struct RegionChange {
    emitted: bool,
    count_changed: bool,
}

impl Scene {
    /// 基于该类别当前快照评估所有区域、传感器区域和绊线
    pub fn update_events(&mut self, category: &str, now: f64) {
        let current = self.tracking.current_objects(category);
        for obj in current.iter() {
            obj.chain.lock().push_location(obj.when, obj.location);
        }

        for (key, region) in self.regions.iter_mut() {
            let change = evaluate_region(key, region, category, &current, now);
            push_region_events(&mut self.events, key, false, change);
        }
        for (key, sensor) in self.sensors.iter_mut() {
            let change = evaluate_region(key, sensor, category, &current, now);
            push_region_events(&mut self.events, key, true, change);
        }

        for (key, tripwire) in self.tripwires.iter_mut() {
            let crossings: Vec<(Crossing, f64)> = current
                .iter()
                .filter(|obj| obj.frame_count > MIN_FRAMES_FOR_EVENTS)
                .filter_map(|obj| {
                    let (when, newest, previous) = obj.chain.lock().unreported_segment(key)?;
                    let direction = tripwire.crossing_direction(&newest, &previous);
                    (direction != 0).then(|| (Crossing { object: obj.clone(), direction }, when))
                })
                .collect();

            if crossings.is_empty() {
                tripwire.objects.remove(category);
                continue;
            }
            if now - tripwire.when > DEBOUNCE_DELAY {
                debug!(tripwire = %key, crossings = crossings.len(), "Tripwire event");
                let crossings = crossings
                    .into_iter()
                    .map(|(crossing, when)| {
                        crossing.object.chain.lock().reported_crossings.insert(key.clone(), when);
                        crossing
                    })
                    .collect();
                tripwire.objects.insert(category.to_string(), crossings);
                tripwire.when = now;
                self.events.push(SceneEvent {
                    kind: EventKind::Tripwire,
                    event_type: EventType::Objects,
                    source_id: key.clone(),
                    from_sensor: false,
                });
            }
        }
    }

    /// 生成事件报文；没有穿越的绊线事件返回 None
    pub fn build_event(&self, event: &SceneEvent, timestamp: &str, opts: BuildOptions<'_>) -> Option<EventMessage> {
        match event.kind {
            EventKind::Region => {
                let map = if event.from_sensor { &self.sensors } else { &self.regions };
                let region = map.get(&event.source_id)?;
                let mut msg = EventMessage::new(
                    timestamp.to_string(),
                    &self.uid,
                    &self.name,
                    "region",
                    &region.uid,
                    &region.name,
                );
                for (category, objects) in &region.objects {
                    msg.counts.insert(category.clone(), objects.len());
                    msg.objects.extend(build_objects(objects, opts));
                }
                msg.entered = region.entered.values().flatten().map(|o| build_object(o, opts)).collect();
                msg.exited = region
                    .exited
                    .values()
                    .flatten()
                    .map(|(o, dwell)| ExitRecord { object: build_object(o, opts), dwell: *dwell })
                    .collect();
                if event.from_sensor {
                    msg.value = region.reading.value.clone();
                }
                msg.metadata = region.serialize();
                Some(msg)
            }
            EventKind::Tripwire => {
                let tripwire = self.tripwires.get(&event.source_id)?;
                let mut msg = EventMessage::new(
                    timestamp.to_string(),
                    &self.uid,
                    &self.name,
                    "tripwire",
                    &tripwire.uid,
                    &tripwire.name,
                );
                let mut total = 0;
                for (category, crossings) in &tripwire.objects {
                    msg.counts.insert(category.clone(), crossings.len());
                    total += crossings.len();
                    msg.objects.extend(crossings.iter().map(|c| build_crossing(c, opts)));
                }
                if total == 0 {
                    return None;
                }
                msg.metadata = tripwire.serialize();
                Some(msg)
            }
        }
    }

    /// 事件发布后清理：离开环境传感器区域的物体丢弃该传感器的累计值，进入/离开集合重置
    pub fn clear_event_transients(&mut self, events: &[SceneEvent]) {
        let touched: HashSet<(bool, &str)> = events
            .iter()
            .filter(|e| e.kind == EventKind::Region)
            .map(|e| (e.from_sensor, e.source_id.as_str()))
            .collect();
        for (from_sensor, key) in touched {
            let map = if from_sensor { &mut self.sensors } else { &mut self.regions };
            let Some(region) = map.get_mut(key) else { continue };
            if region.is_environmental() {
                for (obj, _) in region.exited.values().flatten() {
                    obj.chain.lock().sensors.remove(key);
                }
            }
            region.clear_transients();
        }
    }
}

fn push_region_events(events: &mut Vec<SceneEvent>, key: &str, from_sensor: bool, change: RegionChange) {
    if !change.emitted {
        return;
    }
    let mut push = |event_type| {
        events.push(SceneEvent {
            kind: EventKind::Region,
            event_type,
            source_id: key.to_string(),
            from_sensor,
        })
    };
    push(EventType::Objects);
    if change.count_changed {
        push(EventType::Count);
    }
}

/// 更新一个区域在该类别上的成员关系，并判断是否发出事件
fn evaluate_region(key: &str, region: &mut Region, category: &str, current: &[MovingObject], now: f64) -> RegionChange {
    // 进入/离开只保留本轮的变化
    region.entered.remove(category);
    if let Some(stale) = region.exited.remove(category) {
        if region.is_environmental() {
            for (obj, _) in &stale {
                obj.chain.lock().sensors.remove(key);
            }
        }
    }

    let inside: Vec<MovingObject> = current
        .iter()
        .filter(|obj| obj.frame_count > MIN_FRAMES_FOR_EVENTS && region.contains(&obj.point2()))
        .cloned()
        .collect();

    let previous = region.objects.remove(category).unwrap_or_default();
    let prev_ids: HashSet<&str> = previous.iter().map(MovingObject::gid).collect();
    let cur_ids: HashSet<&str> = inside.iter().map(MovingObject::gid).collect();

    let entered: Vec<MovingObject> = inside.iter().filter(|o| !prev_ids.contains(o.gid())).cloned().collect();
    for obj in &entered {
        obj.chain.lock().regions.entry(key.to_string()).or_insert(now);
    }
    if region.is_environmental() && region.reading.value.is_some() {
        for obj in &entered {
            obj.chain.lock().sensors.insert(key.to_string(), Vec::new());
        }
        record_sensor_value(key, region, &entered);
    }

    let exited: Vec<(MovingObject, f64)> = previous
        .iter()
        .filter(|o| !cur_ids.contains(o.gid()))
        .map(|o| {
            let since = o.chain.lock().regions.remove(key).unwrap_or(now);
            (o.clone(), (now - since).max(0.0))
        })
        .collect();

    let changed = !entered.is_empty() || !exited.is_empty();
    if !entered.is_empty() {
        region.entered.insert(category.to_string(), entered);
    }
    if !exited.is_empty() {
        region.exited.insert(category.to_string(), exited);
    }
    let count = inside.len();
    region.objects.insert(category.to_string(), inside);

    if !changed || now - region.when <= DEBOUNCE_DELAY {
        return RegionChange { emitted: false, count_changed: false };
    }
    region.when = now;
    let count_changed = region.last_counts.get(category).copied().unwrap_or(0) != count;
    region.last_counts.insert(category.to_string(), count);
    debug!(region = %key, category = %category, count = count, "Region event");
    RegionChange { emitted: true, count_changed }
}

/// 把传感器当前读数记入物体的身份链，同一时刻只记一次
pub(crate) fn record_sensor_value(key: &str, sensor: &Region, objects: &[MovingObject]) {
    let (Some(value), Some(when)) = (&sensor.reading.value, sensor.reading.last_when) else {
        return;
    };
    let stamp = format_iso(when);
    for obj in objects {
        let mut chain = obj.chain.lock();
        let values = chain.sensors.entry(key.to_string()).or_default();
        if !values.iter().any(|(t, _)| *t == stamp) {
            values.push((stamp.clone(), value.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::ObjectClassRegistry;
    use crate::geometry::Pose;
    use crate::object::MovingObject;
    use crate::tracker::TrackerParams;
    use crate::tracking::TrackingContext;
    use flux_scene_types::{Detection, RegionRecord, SceneDataMessage, SceneRecord, TripwireRecord};
    use serde_json::json;

    fn member(gid: &str, x: f64, frame_count: u32) -> MovingObject {
        let det = Detection { translation: Some(vec![x, 1.0, 0.0]), ..Default::default() };
        let mut obj =
            MovingObject::from_detection(&det, "person", ObjectClassRegistry::new().lookup("person"), 0.0, None, None)
                .unwrap();
        obj.set_gid(gid);
        obj.frame_count = frame_count;
        obj
    }

    fn region() -> Region {
        Region::from_record(
            &RegionRecord::polygon("r1", "door", vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]]),
            false,
        )
    }

    #[test]
    fn test_young_track_not_counted() {
        let mut r = region();
        let change = evaluate_region("r1", &mut r, "person", &[member("a", 1.0, 3)], 10.0);
        assert!(!change.emitted);
        assert_eq!(r.count("person"), 0);

        let change = evaluate_region("r1", &mut r, "person", &[member("a", 1.0, 4)], 11.0);
        assert!(change.emitted);
        assert!(change.count_changed);
        assert_eq!(r.entered["person"].len(), 1);
    }

    #[test]
    fn test_debounce_gates_emission_not_membership() {
        let mut r = region();
        let a = member("a", 1.0, 5);
        assert!(evaluate_region("r1", &mut r, "person", &[a.clone()], 10.0).emitted);
        r.clear_transients();

        // 0.2 秒后离开：成员关系立即更新，事件被防抖
        let change = evaluate_region("r1", &mut r, "person", &[], 10.2);
        assert!(!change.emitted);
        assert_eq!(r.count("person"), 0);
        assert_eq!(r.exited["person"].len(), 1);
        assert!(!a.chain.lock().regions.contains_key("r1"));

        let (_, dwell) = &r.exited["person"][0];
        assert!((dwell - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_exit_dwell_non_negative() {
        let mut r = region();
        let a = member("a", 1.0, 5);
        evaluate_region("r1", &mut r, "person", &[a.clone()], 10.0);
        a.chain.lock().regions.insert("r1".into(), 20.0);
        evaluate_region("r1", &mut r, "person", &[], 11.0);
        assert!(r.exited["person"].iter().all(|(_, d)| *d >= 0.0));
        assert_eq!(r.count("person"), 0);
    }

    #[test]
    fn test_debounced_exit_not_carried_into_later_event() {
        let mut r = region();
        let a = member("a", 1.0, 5);
        assert!(evaluate_region("r1", &mut r, "person", &[a.clone()], 10.0).emitted);
        assert!(!evaluate_region("r1", &mut r, "person", &[], 10.2).emitted);
        for i in 0..100 {
            evaluate_region("r1", &mut r, "person", &[], 11.0 + i as f64);
        }

        let change = evaluate_region("r1", &mut r, "person", &[member("b", 1.0, 5)], 3600.0);
        assert!(change.emitted);
        assert_eq!(r.entered["person"].len(), 1);
        assert_eq!(r.entered["person"][0].gid(), "b");
        assert!(r.exited.get("person").is_none());
    }

    fn context() -> TrackingContext {
        TrackingContext {
            params: TrackerParams { reliable_frames: 1, ..Default::default() },
            ..Default::default()
        }
    }

    fn gate_scene() -> Scene {
        let mut record = SceneRecord::new("s1", "lobby");
        record.tripwires = vec![TripwireRecord { uid: "t1".into(), name: "gate".into(), points: vec![[5.0, -1.0], [5.0, 1.0]] }];
        Scene::from_record(&record, context())
    }

    /// 子场景直通物体 c-1 依次出现在给定 x 上，每帧间隔 0.1 秒
    async fn walk(scene: &mut Scene, xs: &[f64], start: f64) -> f64 {
        let identity = Pose::from_components(&[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0], None).unwrap();
        let mut when = start;
        for (i, x) in xs.iter().enumerate() {
            when = start + 0.1 * i as f64;
            let msg = SceneDataMessage::from_value(&json!({
                "id": "child",
                "timestamp": "2024-01-01T00:00:00.000Z",
                "objects": [{"id": "c-1", "type": "person", "translation": [x, 0.0, 0.0]}]
            }))
            .unwrap();
            scene.process_scene_data(&msg, &identity, false, "person", when, &ObjectClassRegistry::new()).unwrap();
            scene.tracking().wait_for_complete().await;
        }
        when
    }

    fn tripwire_events(scene: &mut Scene) -> Vec<SceneEvent> {
        scene.take_events().into_iter().filter(|e| e.kind == EventKind::Tripwire).collect()
    }

    fn opts(scene: &Scene) -> BuildOptions<'_> {
        BuildOptions { cameras: &scene.cameras, output_lla: false, camera_bounds: false }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tripwire_crossing_reported_once() {
        let mut scene = gate_scene();
        let last = walk(&mut scene, &[4.2, 4.4, 4.6, 4.8, 5.2], 1.0).await;
        tripwire_events(&mut scene);

        scene.update_events("person", last + 0.05);
        let events = tripwire_events(&mut scene);
        assert_eq!(events.len(), 1);
        let msg = scene.build_event(&events[0], "2024-01-01T00:00:01.450Z", opts(&scene)).unwrap();
        assert_eq!(msg.counts["person"], 1);
        assert_eq!(msg.objects.len(), 1);

        // 同一快照再次评估，防抖已过也不重复上报
        scene.update_events("person", last + 0.65);
        assert!(tripwire_events(&mut scene).is_empty());
        assert_eq!(scene.tripwires["t1"].count("person"), 0);
        assert!(scene.build_event(&events[0], "2024-01-01T00:00:02.050Z", opts(&scene)).is_none());
        scene.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_young_track_crossing_ignored() {
        let mut scene = gate_scene();
        let last = walk(&mut scene, &[4.6, 4.8, 5.2], 1.0).await;
        scene.update_events("person", last + 0.05);
        assert!(tripwire_events(&mut scene).is_empty());
        scene.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tripwire_debounce() {
        let mut scene = gate_scene();
        let last = walk(&mut scene, &[4.2, 4.4, 4.6, 4.8, 5.2], 1.0).await;
        scene.update_events("person", last + 0.05);
        assert_eq!(tripwire_events(&mut scene).len(), 1);

        // 0.1 秒后折返：穿越被防抖
        let back = walk(&mut scene, &[4.9], last + 0.1).await;
        tripwire_events(&mut scene);
        scene.update_events("person", back + 0.01);
        assert!(tripwire_events(&mut scene).is_empty());
        scene.shutdown().await;
    }
}

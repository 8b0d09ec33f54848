use flux_scene::tracker::TrackerParams;
use flux_scene::{ControllerConfig, InMemorySceneStore, ManualClock, SceneController, TrackingContext};
use flux_scene_core::{EventBus, FusionError, Route, Topics};
use flux_scene_types::time::format_iso;
use flux_scene_types::{EventMessage, Message, PoseRecord, RegionRecord, SceneRecord};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

const T0: f64 = 1_700_000_000.0;

struct Harness {
    controller: SceneController,
    bus: EventBus,
    rx: broadcast::Receiver<Message>,
    clock: Arc<ManualClock>,
    store: Arc<InMemorySceneStore>,
    topics: Topics,
}

impl Harness {
    fn new(config: ControllerConfig, scenes: Vec<SceneRecord>) -> Self {
        let bus = EventBus::new(4096);
        let rx = bus.subscribe_all();
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(InMemorySceneStore::new());
        store.set_scenes(scenes);
        let ctx = TrackingContext {
            params: TrackerParams { reliable_frames: 1, ..Default::default() },
            ..Default::default()
        };
        let topics = Topics::new(config.topic_base.clone());
        let controller = SceneController::new(config, Arc::new(bus.clone()), store.clone(), ctx, clock.clone());
        Self { controller, bus, rx, clock, store, topics }
    }

    fn detection(&self, camera_id: &str, t: f64, x: f64, y: f64) -> Message {
        Message::new(
            self.topics.camera(camera_id),
            json!({
                "id": camera_id,
                "timestamp": format_iso(t),
                "objects": {"person": [{"id": "1", "translation": [x, y, 0.0]}]}
            }),
        )
    }

    /// 按时间推进发送一帧并等待追踪完成
    async fn frame(&mut self, t: f64, x: f64, y: f64) {
        self.clock.set(t);
        let msg = self.detection("cam1", t, x, y);
        self.controller.handle_message(msg).await.unwrap();
        self.controller.cache().get("s1").unwrap().tracking().wait_for_complete().await;
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

fn camera(uid: &str) -> Value {
    json!({"uid": uid, "translation": [0.0, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0], "fov": 70.0})
}

fn lobby() -> SceneRecord {
    let mut record = SceneRecord::new("s1", "lobby");
    record.cameras = vec![serde_json::from_value(camera("cam1")).unwrap()];
    record.regions = vec![RegionRecord::polygon("r1", "door", vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]])];
    record
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_region_entry_emitted_once() {
    let mut h = Harness::new(ControllerConfig::default(), vec![lobby()]);
    h.controller.on_connect().await.unwrap();

    for i in 0..10 {
        h.frame(T0 + i as f64 * 0.1, 2.0, 2.0).await;
    }

    let topics = h.topics.clone();
    let events: Vec<(String, Value)> = h
        .drain()
        .into_iter()
        .filter_map(|m| match topics.parse(&m.topic) {
            Some(Route::Event { region_id, event_type, .. }) if region_id == "r1" => Some((event_type, m.payload)),
            _ => None,
        })
        .collect();

    let objects: Vec<&Value> = events.iter().filter(|(t, _)| t == "objects").map(|(_, p)| p).collect();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["entered"].as_array().unwrap().len(), 1);
    assert_eq!(objects[0]["counts"]["person"], 1);
    assert_eq!(objects[0]["region_id"], "r1");
    assert_eq!(events.iter().filter(|(t, _)| t == "count").count(), 1);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distinct_object_counted_once() {
    let mut h = Harness::new(ControllerConfig::default(), vec![lobby()]);
    for i in 0..10 {
        h.frame(T0 + i as f64 * 0.1, 2.0 + i as f64 * 0.05, 2.0).await;
    }
    assert_eq!(h.controller.cache().get("s1").unwrap().unique_id_count("person"), 1);

    let last = h
        .drain()
        .into_iter()
        .filter(|m| m.topic == h.topics.scene_data("s1", "person"))
        .last()
        .unwrap();
    assert_eq!(last.payload["unique_detection_count"], 1);
    assert_eq!(last.payload["objects"].as_array().unwrap().len(), 1);
    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regulated_output_is_rate_limited() {
    let config = ControllerConfig { regulated_rate: 2.0, ..Default::default() };
    let mut h = Harness::new(config, vec![lobby()]);

    // 30 Hz 输入持续 5 秒
    for i in 0..150 {
        let t = T0 + i as f64 / 30.0;
        h.clock.set(t);
        let msg = h.detection("cam1", t, 2.0, 2.0);
        h.controller.handle_message(msg).await.unwrap();
    }

    let regulated = h.topics.regulated("s1");
    let published: Vec<Message> = h.drain().into_iter().filter(|m| m.topic == regulated).collect();
    assert!((9..=12).contains(&published.len()), "published {}", published.len());
    assert!(published[0].payload["scene_rate"].as_f64().unwrap() > 0.0);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_subscriptions_follow_store() {
    let mut h = Harness::new(ControllerConfig::default(), vec![lobby()]);
    h.controller.on_connect().await.unwrap();

    assert!(h.bus.filters().contains(&h.topics.camera("cam1")));
    assert!(h.bus.filters().contains(&h.topics.database()));
    let status: Vec<Message> = h.drain().into_iter().filter(|m| m.topic == h.topics.controller_status()).collect();
    assert!(status[0].is_text("running"));

    let mut moved = lobby();
    moved.cameras = vec![serde_json::from_value(camera("cam2")).unwrap()];
    h.store.set_scenes(vec![moved]);
    h.controller.handle_message(Message::text(h.topics.database(), "update")).await.unwrap();

    let filters = h.bus.filters();
    assert!(filters.contains(&h.topics.camera("cam2")));
    assert!(!filters.contains(&h.topics.camera("cam1")));
    assert_eq!(h.controller.subscriptions().len(), 2);
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_unknown_camera_invalidates_cache() {
    let mut h = Harness::new(ControllerConfig::default(), vec![lobby()]);
    h.controller.on_connect().await.unwrap();
    assert!(!h.controller.cache().is_stale());

    let msg = h.detection("ghost", T0, 1.0, 1.0);
    let err = h.controller.handle_message(msg).await.unwrap_err();
    assert!(matches!(err, FusionError::UnknownSender(ref id) if id == "ghost"));
    assert!(h.controller.cache().is_stale());

    let mut with_ghost = lobby();
    with_ghost.cameras.push(serde_json::from_value(camera("ghost")).unwrap());
    h.store.set_scenes(vec![with_ghost]);
    let msg = h.detection("ghost", T0, 1.0, 1.0);
    h.controller.handle_message(msg).await.unwrap();
    assert!(h.controller.cache().get("s1").unwrap().camera("ghost").is_some());
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_stale_message_dropped_or_rewritten() {
    let mut h = Harness::new(ControllerConfig::default(), vec![lobby()]);
    let msg = h.detection("cam1", T0 - 5.0, 1.0, 1.0);
    let err = h.controller.handle_message(msg).await.unwrap_err();
    assert!(matches!(err, FusionError::StaleTimestamp { .. }));
    assert!(err.is_message_scoped());
    h.controller.shutdown().await;

    let config = ControllerConfig { rewrite_bad_time: true, ..Default::default() };
    let mut h = Harness::new(config, vec![lobby()]);
    let msg = h.detection("cam1", T0 - 5.0, 1.0, 1.0);
    h.controller.handle_message(msg).await.unwrap();
    let scene_topic = h.topics.scene_data("s1", "person");
    let published = h.drain().into_iter().find(|m| m.topic == scene_topic).unwrap();
    assert_eq!(published.payload["timestamp"], format_iso(T0));
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_child_event_republished_in_parent_frame() {
    let mut parent = SceneRecord::new("p1", "campus");
    parent.children = vec!["c1".into()];
    let mut child = SceneRecord::new("c1", "annex");
    child.parent = Some("p1".into());
    child.transform = Some(PoseRecord::Components {
        translation: vec![10.0, 0.0, 0.0],
        rotation: vec![0.0, 0.0, 0.0],
        scale: None,
    });
    let mut h = Harness::new(ControllerConfig::default(), vec![parent, child]);
    h.store.set_child_scenes(
        "p1",
        vec![serde_json::from_value(json!({
            "name": "annex", "parent": "p1", "child_type": "local", "child": "c1"
        }))
        .unwrap()],
    );
    h.controller.on_connect().await.unwrap();
    assert!(h.bus.filters().contains(&h.topics.external("c1", "+")));

    let mut event = EventMessage::new(format_iso(T0), "c1", "annex", "region", "r9", "desk");
    event.metadata = json!({"uuid": "r9", "area": "poly", "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]});
    let msg = Message::new(h.topics.event("region", "c1", "r9", "objects"), serde_json::to_value(&event).unwrap());
    h.drain();
    h.controller.handle_message(msg).await.unwrap();

    let target = h.topics.event("region", "p1", "r9", "objects");
    let republished = h.drain().into_iter().find(|m| m.topic == target).unwrap();
    assert_eq!(republished.payload["metadata"]["from_child_scene"], "annex");
    assert_eq!(republished.payload["metadata"]["points"][1], json!([11.0, 0.0]));
    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_remote_child_status_without_connector() {
    let mut h = Harness::new(ControllerConfig::default(), vec![{
        let mut parent = SceneRecord::new("p1", "campus");
        parent.children = vec!["far".into()];
        parent
    }]);
    h.store.set_child_scenes(
        "p1",
        vec![serde_json::from_value(json!({
            "name": "far", "parent": "p1", "child_type": "remote", "remote_child_id": "r-1",
            "host_name": "10.0.0.2"
        }))
        .unwrap()],
    );
    h.controller.on_connect().await.unwrap();
    assert_eq!(h.controller.remote_child_status("r-1"), Some("disconnected"));

    h.drain();
    h.controller
        .handle_message(Message::text(h.topics.child_status("far"), "isConnected"))
        .await
        .unwrap();
    let reply = h.drain().into_iter().find(|m| m.topic == h.topics.child_status("far")).unwrap();
    assert!(reply.is_text("disconnected"));
    h.controller.shutdown().await;
}

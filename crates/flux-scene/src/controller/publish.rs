//! 输出主题发布：场景/区域检测、限速视图、外部镜像与事件

use crate::builder::{build_objects, BuildOptions};
use crate::cache::CacheManager;
use crate::clock::SharedClock;
use crate::config::{ControllerConfig, VisibilityTopic};
use crate::scene::Scene;
use flux_scene_core::{Result, SharedPubSub, Topics};
use flux_scene_types::{DetectionOutput, Message, ObjectRecord, RegulatedOutput};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// 入站频率滑动平均的窗口
const AVG_FRAMES: f64 = 100.0;

/// 入站消息间隔的指数滑动平均
#[derive(Debug, Default)]
struct RateEstimator {
    state: Option<(f64, f64)>,
}

impl RateEstimator {
    /// 记录一次到达，返回平均间隔（秒）
    fn update(&mut self, now: f64) -> f64 {
        let (avg, last) = self.state.unwrap_or((1.0, now));
        let avg = (avg * AVG_FRAMES + (now - last)) / (AVG_FRAMES + 1.0);
        self.state = Some((avg, now));
        avg
    }
}

#[derive(Debug, Default)]
struct RegulatedCache {
    objects: BTreeMap<String, Vec<ObjectRecord>>,
    rate: BTreeMap<String, f64>,
    last: Option<f64>,
}

pub(crate) struct Publisher {
    bus: SharedPubSub,
    topics: Topics,
    clock: SharedClock,
    visibility: VisibilityTopic,
    regulated_rate: f64,
    external_rate: f64,
    /// 场景/区域/类别 → 上次发布的物体数
    last_counts: HashMap<String, usize>,
    /// 场景/类别 → 上次外部镜像时间
    last_external: HashMap<String, f64>,
    regulated: HashMap<String, RegulatedCache>,
    rate: RateEstimator,
}

fn should_publish(last: Option<f64>, now: f64, max_delay: f64) -> bool {
    last.map_or(true, |last| now - last >= max_delay)
}

impl Publisher {
    pub(crate) fn new(bus: SharedPubSub, topics: Topics, clock: SharedClock, config: &ControllerConfig) -> Self {
        Self {
            bus,
            topics,
            clock,
            visibility: config.visibility_topic,
            regulated_rate: config.regulated_rate,
            external_rate: config.external_update_rate,
            last_counts: HashMap::new(),
            last_external: HashMap::new(),
            regulated: HashMap::new(),
            rate: RateEstimator::default(),
        }
    }

    pub(crate) fn publish_json<T: Serialize>(&self, topic: String, value: &T) -> Result<()> {
        let payload = serde_json::to_value(value)?;
        self.bus.publish(Message::new(topic, payload))
    }

    pub(crate) fn publish_text(&self, topic: String, text: &str) -> Result<()> {
        self.bus.publish(Message::text(topic, text))
    }

    /// 非空、首次、或上次非空时才发布，保证下游收到一条清空消息
    fn changed_or_non_empty(&mut self, key: String, count: usize) -> bool {
        let publish = count > 0 || self.last_counts.get(&key).map_or(true, |last| *last > 0);
        if publish {
            self.last_counts.insert(key, count);
        }
        publish
    }

    /// 一个类别的场景、限速与区域输出
    pub(crate) fn publish_detections(
        &mut self,
        scene: &Scene,
        category: &str,
        timestamp: &str,
        camera_id: Option<&str>,
        rate: Option<f64>,
    ) -> Result<()> {
        let objects = scene.current_objects(category);
        let opts = BuildOptions {
            cameras: &scene.cameras,
            output_lla: scene.output_lla,
            camera_bounds: self.visibility == VisibilityTopic::Unregulated,
        };

        let output = DetectionOutput {
            id: scene.uid.clone(),
            name: scene.name.clone(),
            timestamp: timestamp.to_string(),
            objects: build_objects(objects.iter(), opts),
            unique_detection_count: Some(scene.unique_id_count(category)),
            region_id: None,
            region_name: None,
            rate,
        };

        if self.changed_or_non_empty(format!("{}/{}", scene.uid, category), output.objects.len()) {
            self.publish_json(self.topics.scene_data(&scene.uid, category), &output)?;
            self.publish_external(scene, category, &output)?;
        }

        let regulated_objects = if self.visibility == VisibilityTopic::Regulated {
            build_objects(objects.iter(), BuildOptions { camera_bounds: true, ..opts })
        } else {
            output.objects.clone()
        };
        self.publish_regulated(scene, category, &output, regulated_objects, camera_id)?;

        let mut regions: Vec<_> = scene.regions.values().collect();
        regions.sort_by(|a, b| a.uid.cmp(&b.uid));
        for region in regions {
            let members = objects.iter().filter(|o| o.chain.lock().regions.contains_key(&region.uid));
            let region_output = DetectionOutput {
                objects: build_objects(members, BuildOptions { camera_bounds: false, ..opts }),
                region_id: Some(region.uid.clone()),
                region_name: Some(region.name.clone()),
                ..output.clone()
            };
            let key = format!("{}/{}/{}", scene.uid, region.uid, category);
            if self.changed_or_non_empty(key, region_output.objects.len()) {
                self.publish_json(self.topics.region_data(&scene.uid, &region.uid, category), &region_output)?;
            }
        }
        Ok(())
    }

    fn publish_external(&mut self, scene: &Scene, category: &str, output: &DetectionOutput) -> Result<()> {
        let now = self.clock.now();
        let key = format!("{}/{}", scene.uid, category);
        let rate = scene.external_update_rate.unwrap_or(self.external_rate);
        if rate > 0.0 && should_publish(self.last_external.get(&key).copied(), now, 1.0 / rate) {
            self.last_external.insert(key, now);
            self.publish_json(self.topics.external(&scene.uid, category), output)?;
        }
        Ok(())
    }

    fn publish_regulated(
        &mut self,
        scene: &Scene,
        category: &str,
        output: &DetectionOutput,
        objects: Vec<ObjectRecord>,
        camera_id: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let interval = self.rate.update(now);
        let rate = scene.regulated_rate.unwrap_or(self.regulated_rate);

        let cache = self.regulated.entry(scene.uid.clone()).or_default();
        cache.objects.insert(category.to_string(), objects);
        if let (Some(camera_id), Some(r)) = (camera_id, output.rate) {
            cache.rate.insert(camera_id.to_string(), r);
        }

        if rate <= 0.0 || !should_publish(cache.last, now, 1.0 / rate) {
            return Ok(());
        }
        cache.last = Some(now);
        let regulated = RegulatedOutput {
            timestamp: output.timestamp.clone(),
            id: output.id.clone(),
            name: output.name.clone(),
            scene_rate: if interval > 0.0 { (10.0 / interval).round() / 10.0 } else { 0.0 },
            rate: cache.rate.clone(),
            objects: cache.objects.values().flatten().cloned().collect(),
        };
        self.publish_json(self.topics.regulated(&scene.uid), &regulated)
    }

    /// 发布场景积累的事件，然后清理已发布区域的进入/离开记录
    pub(crate) fn publish_events(&self, scene: &mut Scene, timestamp: &str) -> Result<()> {
        let mut events = scene.take_events();
        if events.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        events.retain(|e| seen.insert(e.clone()));

        let opts = BuildOptions {
            cameras: &scene.cameras,
            output_lla: scene.output_lla,
            camera_bounds: false,
        };
        for event in &events {
            let Some(msg) = scene.build_event(event, timestamp, opts) else {
                continue;
            };
            let topic = self.topics.event(
                event.kind.as_str(),
                &scene.uid,
                &event.source_id,
                event.event_type.as_str(),
            );
            debug!(topic = %topic, "Publishing event");
            self.publish_json(topic, &msg)?;
        }
        scene.clear_event_transients(&events);
        Ok(())
    }

    /// 丢弃已删除场景与相机的限速缓存
    pub(crate) fn prune(&mut self, cache: &CacheManager) {
        self.regulated.retain(|uid, entry| match cache.get(uid) {
            Some(scene) => {
                entry.rate.retain(|camera_id, _| scene.cameras.contains_key(camera_id));
                true
            }
            None => false,
        });
    }
}

//! 场景控制器：总线消息路由、时钟归一、发布与订阅对账
//!
//! 控制器由单个分发循环独占，场景与区域状态只有这一个写者。

mod publish;

use crate::cache::{CacheManager, SceneStore};
use crate::category::ObjectClassRegistry;
use crate::child::{transform_event, ChildConnector, ChildEvent, RemoteChild};
use crate::clock::SharedClock;
use crate::config::ControllerConfig;
use crate::tracking::TrackingContext;
use flux_scene_core::{FusionError, Result, Route, SharedPubSub, Topics};
use flux_scene_types::time::{format_iso, parse_iso};
use flux_scene_types::{ChildKind, ChildSceneRecord, DetectionMessage, EventMessage, Message, SceneDataMessage, SensorMessage};
use publish::Publisher;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 订阅的处理者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    Detection,
    Sensor,
    ChildEvents,
    ChildStatus,
    Database,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub topic: String,
    pub handler: Handler,
}

impl Subscription {
    fn new(topic: String, handler: Handler) -> Self {
        Self { topic, handler }
    }
}

/// 分发循环的输入
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(Message),
    /// 总线（重新）连接成功
    Connected,
}

pub struct SceneController {
    config: ControllerConfig,
    topics: Topics,
    bus: SharedPubSub,
    clock: SharedClock,
    cache: CacheManager,
    classes: ObjectClassRegistry,
    publisher: Publisher,
    connector: Option<Arc<dyn ChildConnector>>,
    child_tx: mpsc::Sender<ChildEvent>,
    child_rx: Option<mpsc::Receiver<ChildEvent>>,
    subscribed: HashSet<Subscription>,
    remote_children: HashMap<String, RemoteChild>,
    /// 相机最近一次上报的内参与畸变
    camera_parameters: HashMap<String, Value>,
}

impl SceneController {
    pub fn new(
        config: ControllerConfig,
        bus: SharedPubSub,
        store: Arc<dyn SceneStore>,
        ctx: TrackingContext,
        clock: SharedClock,
    ) -> Self {
        let topics = Topics::new(config.topic_base.clone());
        let publisher = Publisher::new(Arc::clone(&bus), topics.clone(), Arc::clone(&clock), &config);
        let (child_tx, child_rx) = mpsc::channel(256);
        Self {
            config,
            topics,
            bus,
            clock,
            cache: CacheManager::new(store, ctx),
            classes: ObjectClassRegistry::new(),
            publisher,
            connector: None,
            child_tx,
            child_rx: Some(child_rx),
            subscribed: HashSet::new(),
            remote_children: HashMap::new(),
            camera_parameters: HashMap::new(),
        }
    }

    pub fn with_child_connector(mut self, connector: Arc<dyn ChildConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CacheManager {
        &mut self.cache
    }

    pub fn classes(&self) -> &ObjectClassRegistry {
        &self.classes
    }

    pub fn subscriptions(&self) -> &HashSet<Subscription> {
        &self.subscribed
    }

    pub fn remote_child_status(&self, child_id: &str) -> Option<&'static str> {
        self.remote_children.get(child_id).map(RemoteChild::status)
    }

    /// 分发循环，直到输入关闭或收到关闭信号
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>, shutdown: impl Future<Output = ()>) {
        let Some(mut child_rx) = self.child_rx.take() else {
            error!("Controller loop already started");
            return;
        };
        tokio::pin!(shutdown);
        info!("Scene controller running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                item = inbound.recv() => match item {
                    Some(Inbound::Message(message)) => {
                        let topic = message.topic.clone();
                        if let Err(e) = self.handle_message(message).await {
                            log_failure(&topic, &e);
                        }
                    }
                    Some(Inbound::Connected) => {
                        if let Err(e) = self.on_connect().await {
                            error!(error = %e, "Connect handling failed");
                        }
                    }
                    None => break,
                },
                Some(event) = child_rx.recv() => {
                    if let Err(e) = self.handle_child_event(event).await {
                        error!(error = %e, "Child event handling failed");
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// 总线连接后重建全部订阅并报告运行状态
    pub async fn on_connect(&mut self) -> Result<()> {
        self.subscribed.clear();
        self.update_subscriptions().await?;
        self.update_object_classes().await;
        self.publisher.publish_text(self.topics.controller_status(), "running")
    }

    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        let Some(route) = self.topics.parse(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring message on unknown topic");
            return Ok(());
        };
        match route {
            Route::Camera { camera_id } => self.handle_detection(&camera_id, &message).await,
            Route::External { scene_id, thing_type } => {
                self.handle_child_scene_data(&scene_id, &thing_type, &message).await
            }
            Route::Sensor { .. } => self.handle_sensor(&message).await,
            Route::Event { region_type, scene_id, region_id, event_type } => {
                self.republish_event(&region_type, &scene_id, &region_id, &event_type, &message).await
            }
            Route::ChildStatus { name } => self.handle_child_status(&name, &message),
            Route::Database if message.is_text("update") => self.handle_database_update().await,
            _ => Ok(()),
        }
    }

    /// 消息时间：按配置改写，或按最大延迟判定过期
    fn message_time(&self, timestamp: &str, now: f64) -> Result<(f64, String)> {
        if self.config.rewrite_all_time {
            return Ok((now, format_iso(now)));
        }
        let when = parse_iso(timestamp).ok_or_else(|| FusionError::schema(format!("bad timestamp {timestamp}")))?;
        let lag = (now - when).abs();
        if lag > self.config.max_lag {
            if !self.config.rewrite_bad_time {
                return Err(FusionError::StaleTimestamp { lag, max_lag: self.config.max_lag });
            }
            return Ok((now, format_iso(now)));
        }
        Ok((when, timestamp.to_string()))
    }

    async fn handle_detection(&mut self, camera_id: &str, message: &Message) -> Result<()> {
        let msg = DetectionMessage::from_value(&message.payload).map_err(|e| FusionError::schema(e.to_string()))?;
        if msg.id != camera_id {
            return Err(FusionError::schema(format!("message id {} on topic of camera {camera_id}", msg.id)));
        }
        self.remember_camera_parameters(&msg)?;
        if msg.is_camera_update() {
            return Ok(());
        }
        let now = self.clock.now();
        let (when, timestamp) = self.message_time(&msg.timestamp, now)?;

        let found = self.cache.scene_with_camera(camera_id).await;
        let Some(scene) = found else {
            self.cache.invalidate();
            return Err(FusionError::UnknownSender(camera_id.to_string()));
        };
        if !scene.process_camera_data(&msg, when, &self.classes)? {
            self.cache.invalidate();
            return Err(FusionError::NotFound(format!("camera {camera_id}")));
        }

        let rate = msg.extra.get("rate").and_then(|v| v.as_f64()).or(msg.frame_rate);
        let mut categories: Vec<&String> = msg.objects.keys().collect();
        categories.sort();
        for category in categories {
            self.publisher.publish_detections(scene, category, &timestamp, Some(camera_id), rate)?;
            self.publisher.publish_events(scene, &timestamp)?;
        }
        Ok(())
    }

    async fn handle_child_scene_data(&mut self, sender: &str, category: &str, message: &Message) -> Result<()> {
        let msg = SceneDataMessage::from_value(&message.payload).map_err(|e| FusionError::schema(e.to_string()))?;
        let now = self.clock.now();
        let (when, timestamp) = self.message_time(&msg.timestamp, now)?;

        let link = self.cache.child_link(sender).await;
        let Some(link) = link else {
            self.cache.invalidate();
            return Err(FusionError::UnknownSender(sender.to_string()));
        };
        let found = self.cache.scene_with_id(&link.parent).await;
        let Some(scene) = found else {
            return Err(FusionError::NotFound(format!("parent scene {}", link.parent)));
        };
        scene.process_scene_data(&msg, &link.pose, link.retrack, category, when, &self.classes)?;
        self.publisher.publish_detections(scene, category, &timestamp, None, None)?;
        self.publisher.publish_events(scene, &timestamp)
    }

    async fn handle_sensor(&mut self, message: &Message) -> Result<()> {
        let msg = SensorMessage::from_value(&message.payload).map_err(|e| FusionError::schema(e.to_string()))?;
        let (when, timestamp) = if self.config.rewrite_all_time {
            let now = self.clock.now();
            (now, format_iso(now))
        } else {
            let when = parse_iso(&msg.timestamp)
                .ok_or_else(|| FusionError::schema(format!("bad timestamp {}", msg.timestamp)))?;
            (when, msg.timestamp.clone())
        };

        let found = self.cache.scene_with_sensor(&msg.id).await;
        let Some(scene) = found else {
            debug!(sensor_id = %msg.id, "Sensor not in any scene");
            return Ok(());
        };
        if !scene.process_sensor_data(&msg, when)? {
            self.cache.invalidate();
            return Err(FusionError::NotFound(format!("sensor {}", msg.id)));
        }
        self.publisher.publish_events(scene, &timestamp)
    }

    /// 子场景事件变换到父场景坐标后以父场景主题转发
    async fn republish_event(
        &mut self,
        region_type: &str,
        sender: &str,
        region_id: &str,
        event_type: &str,
        message: &Message,
    ) -> Result<()> {
        let link = self.cache.child_link(sender).await;
        let Some(link) = link else {
            self.cache.invalidate();
            return Err(FusionError::UnknownSender(sender.to_string()));
        };
        if !self.cache.contains(&link.parent) {
            return Err(FusionError::NotFound(format!("parent scene {}", link.parent)));
        }
        let mut event: EventMessage =
            serde_json::from_value(message.payload.clone()).map_err(|e| FusionError::schema(e.to_string()))?;
        transform_event(&mut event, &link);
        self.publisher
            .publish_json(self.topics.event(region_type, &link.parent, region_id, event_type), &event)
    }

    fn handle_child_status(&self, name: &str, message: &Message) -> Result<()> {
        if !message.is_text("isConnected") {
            return Ok(());
        }
        match self.remote_children.values().find(|c| c.record.name == name) {
            Some(child) => self.publisher.publish_text(self.topics.child_status(name), child.status()),
            None => Ok(()),
        }
    }

    pub async fn handle_child_event(&mut self, event: ChildEvent) -> Result<()> {
        match event {
            ChildEvent::Connected { child_id } => {
                let Some(child) = self.remote_children.get_mut(&child_id) else { return Ok(()) };
                child.connected = true;
                info!(child = %child.record.name, "Remote child connected");
                self.publisher.publish_text(self.topics.child_status(&child.record.name), "connected")
            }
            ChildEvent::Disconnected { child_id } => {
                let Some(child) = self.remote_children.get_mut(&child_id) else { return Ok(()) };
                child.connected = false;
                warn!(child = %child.record.name, "Remote child disconnected");
                self.publisher.publish_text(self.topics.child_status(&child.record.name), "disconnected")
            }
            ChildEvent::Message { child_id, message } => {
                debug!(child_id = %child_id, topic = %message.topic, "Message from remote child");
                self.handle_message(message).await
            }
        }
    }

    async fn handle_database_update(&mut self) -> Result<()> {
        info!("Database updated");
        self.update_subscriptions().await?;
        self.update_object_classes().await;
        self.update_cameras().await;
        self.publisher.prune(&self.cache);
        Ok(())
    }

    async fn update_object_classes(&mut self) {
        match self.cache.get_assets().await {
            Ok(assets) => self.classes.apply_assets(&assets),
            Err(e) => warn!(error = %e, "Failed to load assets"),
        }
    }

    fn remember_camera_parameters(&mut self, msg: &DetectionMessage) -> Result<()> {
        if msg.intrinsics.is_none() && msg.distortion.is_none() {
            return Ok(());
        }
        let entry = self.camera_parameters.entry(msg.id.clone()).or_insert_with(|| json!({}));
        if let Some(intrinsics) = &msg.intrinsics {
            entry["intrinsics"] = serde_json::to_value(intrinsics)?;
        }
        if let Some(distortion) = &msg.distortion {
            entry["distortion"] = serde_json::to_value(distortion)?;
        }
        Ok(())
    }

    /// 把已知的相机参数写回存储，供未标定相机计算位姿
    async fn update_cameras(&self) {
        let uncalibrated: Vec<&str> = self
            .cache
            .scenes()
            .flat_map(|s| s.cameras.values())
            .filter(|c| c.pose.is_none())
            .map(|c| c.uid.as_str())
            .collect();
        for camera_id in uncalibrated {
            let Some(parameters) = self.camera_parameters.get(camera_id) else {
                continue;
            };
            if let Err(e) = self.cache.store().update_camera(camera_id, parameters).await {
                warn!(camera_id = %camera_id, error = %e, "Camera update failed");
            }
        }
    }

    /// 由当前场景清单计算期望订阅，与已持有的订阅求差；远程子场景连接同步增删
    pub async fn update_subscriptions(&mut self) -> Result<()> {
        self.cache.invalidate();
        self.cache.check_refresh().await;

        let mut need = HashSet::new();
        need.insert(Subscription::new(self.topics.database(), Handler::Database));
        for scene in self.cache.scenes() {
            for camera_id in scene.cameras.keys() {
                need.insert(Subscription::new(self.topics.camera(camera_id), Handler::Detection));
            }
            for sensor_id in scene.sensors.keys() {
                need.insert(Subscription::new(self.topics.sensor(sensor_id), Handler::Sensor));
            }
            if scene.parent.is_some() {
                need.insert(Subscription::new(self.topics.external(&scene.uid, "+"), Handler::Detection));
                need.insert(Subscription::new(self.topics.event("+", &scene.uid, "+", "+"), Handler::ChildEvents));
            }
        }

        let mut need_children: HashMap<String, ChildSceneRecord> = HashMap::new();
        for record in self.cache.child_records() {
            match record.child_type {
                ChildKind::Local => {
                    let Some(child) = &record.child else { continue };
                    need.insert(Subscription::new(self.topics.external(child, "+"), Handler::Detection));
                    need.insert(Subscription::new(self.topics.event("+", child, "+", "+"), Handler::ChildEvents));
                }
                ChildKind::Remote => {
                    let Some(remote_id) = &record.remote_child_id else { continue };
                    need_children.insert(remote_id.clone(), record.clone());
                    need.insert(Subscription::new(self.topics.child_status(&record.name), Handler::ChildStatus));
                }
            }
        }

        self.sync_remote_children(need_children).await;

        let removed: Vec<Subscription> = self.subscribed.difference(&need).cloned().collect();
        let added: Vec<Subscription> = need.difference(&self.subscribed).cloned().collect();
        // 失败的变更不记入已订阅集合，下次对账时重试
        for sub in removed {
            match self.bus.unsubscribe(&sub.topic).await {
                Ok(()) => {
                    info!(topic = %sub.topic, "Unsubscribed");
                    self.subscribed.remove(&sub);
                }
                Err(e) => warn!(topic = %sub.topic, error = %e, "Unsubscribe failed"),
            }
        }
        for sub in added {
            match self.bus.subscribe(&sub.topic).await {
                Ok(()) => {
                    info!(topic = %sub.topic, "Subscribed");
                    self.subscribed.insert(sub);
                }
                Err(e) => warn!(topic = %sub.topic, error = %e, "Subscribe failed"),
            }
        }
        Ok(())
    }

    async fn sync_remote_children(&mut self, mut need: HashMap<String, ChildSceneRecord>) {
        let existing: Vec<String> = self.remote_children.keys().cloned().collect();
        for child_id in existing {
            let unchanged = need.get(&child_id).is_some_and(|r| {
                self.remote_children.get(&child_id).is_some_and(|c| c.record == *r)
            });
            if unchanged {
                need.remove(&child_id);
                continue;
            }
            if let Some(child) = self.remote_children.remove(&child_id) {
                child.close().await;
            }
        }

        for (child_id, record) in need {
            let filters = vec![
                self.topics.external(&child_id, "+"),
                self.topics.event("+", &child_id, "+", "+"),
            ];
            let session = match &self.connector {
                Some(connector) => match connector.connect(&record, filters, self.child_tx.clone()).await {
                    Ok(session) => Some(session),
                    Err(e) => {
                        error!(child = %record.name, error = %e, "Remote child connect failed");
                        None
                    }
                },
                None => {
                    warn!(child = %record.name, "No connector for remote children");
                    None
                }
            };
            info!(child = %record.name, child_id = %child_id, "Remote child registered");
            self.remote_children.insert(child_id, RemoteChild::new(record, session));
        }
    }

    pub async fn shutdown(self) {
        for (_, child) in self.remote_children {
            child.close().await;
        }
        self.cache.shutdown().await;
        info!("Scene controller stopped");
    }
}

fn log_failure(topic: &str, e: &FusionError) {
    match e {
        FusionError::StaleTimestamp { .. } => warn!(topic = %topic, error = %e, "Message fell behind, skipping"),
        FusionError::UnknownSender(sender) => warn!(topic = %topic, sender = %sender, "Unknown sender"),
        e if e.is_message_scoped() => warn!(topic = %topic, error = %e, "Dropping message"),
        e => error!(topic = %topic, error = %e, "Message handling failed"),
    }
}

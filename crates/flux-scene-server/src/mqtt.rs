//! rumqttc 总线适配：控制器的 `PubSub` 实现与远程子场景连接器

use crate::config::MqttConfig;
use async_trait::async_trait;
use flux_scene::{ChildConnector, ChildEvent, ChildSession, Inbound};
use flux_scene_core::{FusionError, PubSub, Result};
use flux_scene_types::{ChildSceneRecord, Message};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 发布不等待网络：报文写入客户端请求队列即返回
pub struct MqttPubSub {
    client: AsyncClient,
}

impl MqttPubSub {
    pub fn connect(config: &MqttConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(user, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 1024);
        info!(
            broker = %format!("{}:{}", config.host, config.port),
            client_id = %config.client_id,
            "MQTT client created"
        );
        (Self { client }, eventloop)
    }
}

#[async_trait]
impl PubSub for MqttPubSub {
    fn publish(&self, message: Message) -> Result<()> {
        self.client
            .try_publish(message.topic.clone(), QoS::AtMostOnce, false, message.to_bytes())
            .map_err(|e| FusionError::bus(format!("publish to {} failed: {e}", message.topic)))
    }

    // 请求队列只由 pump 消费，订阅变更同样不能等待队列空位
    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| FusionError::bus(format!("subscribe {filter} failed: {e}")))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client
            .try_unsubscribe(filter)
            .map_err(|e| FusionError::bus(format!("unsubscribe {filter} failed: {e}")))
    }
}

/// 驱动事件循环，把入站报文与连接事件转给控制器；控制器退出后返回
pub async fn pump(mut eventloop: EventLoop, inbound: mpsc::Sender<Inbound>) {
    let mut dropped = 0u64;
    loop {
        let item = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Inbound::Message(Message::from_bytes(publish.topic.clone(), &publish.payload))
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                Inbound::Connected
            }
            Ok(Event::Incoming(packet)) => {
                debug!(?packet, "Received MQTT packet");
                continue;
            }
            Ok(Event::Outgoing(_)) => continue,
            Err(e) => {
                // 下一次 poll 会自动重连
                error!(error = %e, "MQTT connection error");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        if !forward(&inbound, item, &mut dropped).await {
            info!("Controller stopped, MQTT pump exiting");
            break;
        }
    }
}

/// 控制器忙时丢弃入站报文，事件循环不停；连接事件必须送达。控制器已退出时返回 false
async fn forward(inbound: &mpsc::Sender<Inbound>, item: Inbound, dropped: &mut u64) -> bool {
    let message = match item {
        Inbound::Connected => return inbound.send(Inbound::Connected).await.is_ok(),
        message => message,
    };
    match inbound.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            *dropped += 1;
            if *dropped % 1000 == 1 {
                warn!(dropped = *dropped, "Controller busy, dropping inbound messages");
            }
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// 按子场景记录连接远程代理
pub struct MqttChildConnector {
    keep_alive: Duration,
    max_packet_size: usize,
}

impl MqttChildConnector {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            max_packet_size: config.max_packet_size,
        }
    }
}

#[async_trait]
impl ChildConnector for MqttChildConnector {
    async fn connect(
        &self,
        record: &ChildSceneRecord,
        filters: Vec<String>,
        events: mpsc::Sender<ChildEvent>,
    ) -> Result<Box<dyn ChildSession>> {
        let child_id = record
            .remote_child_id
            .clone()
            .ok_or_else(|| FusionError::Config(format!("child {} has no remote id", record.name)))?;
        let host = record
            .host_name
            .clone()
            .ok_or_else(|| FusionError::Config(format!("child {} has no host", record.name)))?;
        let port = record.host_port.unwrap_or(1883);

        let mut options = MqttOptions::new(format!("flux-scene-child-{child_id}"), host.as_str(), port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);
        if let (Some(user), Some(password)) = (&record.mqtt_username, &record.mqtt_password) {
            options.set_credentials(user, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 256);
        info!(child = %record.name, broker = %format!("{host}:{port}"), "Connecting remote child");
        let task = tokio::spawn(child_loop(eventloop, client.clone(), child_id, filters, events));
        Ok(Box::new(MqttChildSession { client, task }))
    }
}

/// 远程子场景事件循环；连接断开即结束，不重连
async fn child_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    child_id: String,
    filters: Vec<String>,
    events: mpsc::Sender<ChildEvent>,
) {
    let mut connected = false;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for filter in &filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(child_id = %child_id, filter = %filter, error = %e, "Child subscribe failed");
                    }
                }
                connected = true;
                ChildEvent::Connected { child_id: child_id.clone() }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => ChildEvent::Message {
                child_id: child_id.clone(),
                message: Message::from_bytes(publish.topic.clone(), &publish.payload),
            },
            Ok(_) => continue,
            Err(e) => {
                if !matches!(e, ConnectionError::RequestsDone) {
                    warn!(child_id = %child_id, error = %e, "Remote child connection lost");
                }
                if connected {
                    let _ = events.send(ChildEvent::Disconnected { child_id }).await;
                }
                return;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

struct MqttChildSession {
    client: AsyncClient,
    task: JoinHandle<()>,
}

#[async_trait]
impl ChildSession for MqttChildSession {
    async fn close(self: Box<Self>) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Child disconnect request failed");
        }
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;

    fn message(topic: &str) -> Inbound {
        Inbound::Message(Message::text(topic, "1"))
    }

    #[tokio::test]
    async fn test_forward_drops_when_controller_busy() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut dropped = 0;
        assert!(forward(&tx, message("a"), &mut dropped).await);
        assert!(forward(&tx, message("b"), &mut dropped).await);
        assert_eq!(dropped, 1);

        match rx.recv().await {
            Some(Inbound::Message(m)) => assert_eq!(m.topic, "a"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(forward(&tx, Inbound::Connected, &mut dropped).await);
        assert!(matches!(rx.recv().await, Some(Inbound::Connected)));

        drop(rx);
        assert!(!forward(&tx, message("c"), &mut dropped).await);
    }

    #[tokio::test]
    async fn test_subscribe_does_not_wait_for_full_queue() {
        let (bus, _eventloop) = MqttPubSub::connect(&MqttConfig::default());
        // 事件循环未被驱动，请求队列只会被填满
        let mut full = false;
        for i in 0..2048 {
            if bus.publish(Message::text(format!("t/{i}"), "x")).is_err() {
                full = true;
                break;
            }
        }
        assert!(full);

        let result = tokio::time::timeout(Duration::from_secs(1), bus.subscribe("scenescape/cmd/database")).await;
        assert!(matches!(result, Ok(Err(_))));
    }
}

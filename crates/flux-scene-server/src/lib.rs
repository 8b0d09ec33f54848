//! 场景控制器进程：MQTT 总线、REST 场景存储、NTP 时间源与信号驱动的关闭

pub mod config;
pub mod mqtt;
pub mod ntp;
pub mod rest;
pub mod shutdown;

use anyhow::Result;
use flux_scene::reid::{InMemoryVectorStore, VectorStore};
use flux_scene::tracker::TrackerRegistry;
use flux_scene::{ClockSync, SceneController, SystemClock, TimeSource, TrackingContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

pub use config::AppConfig;
use mqtt::{MqttChildConnector, MqttPubSub};
use ntp::SntpTimeSource;
use rest::RestSceneStore;
use shutdown::ShutdownSignal;

/// 组装控制器并运行到收到关闭信号
pub async fn run(config: AppConfig, shutdown: broadcast::Receiver<ShutdownSignal>) -> Result<()> {
    let mut registry = TrackerRegistry::new();
    if let Some(name) = &config.tracker.default {
        registry.set_default(name)?;
    }
    let vector_store = config
        .reid
        .enabled
        .then(|| Arc::new(InMemoryVectorStore::new()) as Arc<dyn VectorStore>);
    let ctx = TrackingContext {
        registry: Arc::new(registry),
        params: config.tracker.params.clone(),
        reid: config.reid.clone(),
        store: vector_store,
    };

    let source = config
        .controller
        .ntp_server
        .as_ref()
        .map(|server| Arc::new(SntpTimeSource::new(server.clone())) as Arc<dyn TimeSource>);
    let clock = Arc::new(ClockSync::new(
        Arc::new(SystemClock),
        source,
        Duration::from_secs(config.controller.ntp_interval_secs),
    ));
    clock.refresh().await;
    let sync_task = clock.start();

    let store = Arc::new(RestSceneStore::new(&config.rest)?);
    let (bus, eventloop) = MqttPubSub::connect(&config.mqtt);
    let controller = SceneController::new(config.controller.clone(), Arc::new(bus), store, ctx, clock)
        .with_child_connector(Arc::new(MqttChildConnector::new(&config.mqtt)));

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let pump = tokio::spawn(mqtt::pump(eventloop, inbound_tx));

    controller.run(inbound_rx, shutdown::recv_shutdown(shutdown)).await;

    pump.abort();
    if let Some(task) = sync_task {
        task.abort();
    }
    info!("Scene controller exited");
    Ok(())
}

use crate::error::Result;
use crate::topic::matches;
use async_trait::async_trait;
use dashmap::DashSet;
use flux_scene_types::Message;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// 发布/订阅总线
///
/// 发布是即发即弃的，不在消息处理路径上等待网络。
#[async_trait]
pub trait PubSub: Send + Sync {
    fn publish(&self, message: Message) -> Result<()>;

    async fn subscribe(&self, filter: &str) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;
}

pub type SharedPubSub = Arc<dyn PubSub>;

/// 进程内总线
///
/// 所有发布的消息都广播给 `subscribe_all` 的接收者；`deliverable` 判断消息
/// 是否命中当前订阅的过滤器，用于向控制器回送。
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Message>,
    filters: Arc<DashSet<String>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            filters: Arc::new(DashSet::new()),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    /// 消息主题是否命中任一订阅过滤器
    pub fn deliverable(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| matches(f.key(), topic))
    }

    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.filters.iter().map(|f| f.key().clone()).collect();
        filters.sort();
        filters
    }
}

#[async_trait]
impl PubSub for EventBus {
    fn publish(&self, message: Message) -> Result<()> {
        // 没有接收者时 broadcast 返回错误，发布本身仍视为成功
        if self.sender.send(message).is_err() {
            debug!("EventBus publish without receivers");
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.filters.insert(filter.to_string());
        debug!(filter = %filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.filters.remove(filter);
        debug!(filter = %filter, "Unsubscribed");
        Ok(())
    }
}

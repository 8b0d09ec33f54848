use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 总线消息
///
/// `payload` 为 JSON；纯文本负载（如 `update`、`isConnected`）以 `Value::String` 表示。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 从原始字节构造：可解析为 JSON 则按 JSON，否则按 UTF-8 文本
    pub fn from_bytes(topic: impl Into<String>, bytes: &[u8]) -> Self {
        let payload = serde_json::from_slice(bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        });
        Self::new(topic, payload)
    }

    /// 文本负载
    pub fn text(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(topic, serde_json::Value::String(text.into()))
    }

    /// 负载是否为给定文本
    pub fn is_text(&self, text: &str) -> bool {
        self.payload.as_str() == Some(text)
    }

    /// 序列化为线上字节
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.payload {
            serde_json::Value::String(s) => s.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        }
    }
}

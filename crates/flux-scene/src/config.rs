//! 控制器运行参数

use serde::{Deserialize, Serialize};

/// 相机像素框计算在哪个输出主题上进行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityTopic {
    #[default]
    Unregulated,
    Regulated,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// 消息时间与当前时间的最大允许偏差（秒）
    #[serde(default = "default_max_lag")]
    pub max_lag: f64,
    /// 超时消息改用当前时间而不丢弃
    #[serde(default)]
    pub rewrite_bad_time: bool,
    /// 所有消息都改用当前时间
    #[serde(default)]
    pub rewrite_all_time: bool,
    #[serde(default)]
    pub visibility_topic: VisibilityTopic,
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
    #[serde(default)]
    pub ntp_server: Option<String>,
    #[serde(default = "default_ntp_interval")]
    pub ntp_interval_secs: u64,
    /// 场景未配置时的限速频率（Hz）
    #[serde(default = "default_rate")]
    pub regulated_rate: f64,
    #[serde(default = "default_rate")]
    pub external_update_rate: f64,
}

fn default_max_lag() -> f64 {
    1.0
}

fn default_topic_base() -> String {
    "scenescape".to_string()
}

fn default_ntp_interval() -> u64 {
    300
}

fn default_rate() -> f64 {
    1.0
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_lag: default_max_lag(),
            rewrite_bad_time: false,
            rewrite_all_time: false,
            visibility_topic: VisibilityTopic::default(),
            topic_base: default_topic_base(),
            ntp_server: None,
            ntp_interval_secs: default_ntp_interval(),
            regulated_rate: default_rate(),
            external_update_rate: default_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: ControllerConfig =
            serde_json::from_str(r#"{"rewrite_bad_time": true, "visibility_topic": "regulated"}"#).unwrap();
        assert!(cfg.rewrite_bad_time);
        assert_eq!(cfg.visibility_topic, VisibilityTopic::Regulated);
        assert_eq!(cfg.max_lag, 1.0);
        assert_eq!(cfg.ntp_interval_secs, 300);
        assert_eq!(cfg.topic_base, "scenescape");
    }
}

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use flux_scene::reid::ReidConfig;
use flux_scene::tracker::{TrackerFrameConfig, TrackerParams};
use flux_scene::ControllerConfig;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub reid: ReidConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// 单个报文上限（字节）
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestConfig {
    #[serde(default = "default_rest_url")]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_rest_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrackerConfig {
    /// 场景未指定时使用的追踪器
    #[serde(default)]
    pub default: Option<String>,
    #[serde(flatten)]
    pub params: TrackerParams,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "flux-scene-controller".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_max_packet_size() -> usize {
    4 * 1024 * 1024
}

fn default_rest_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

fn default_rest_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url: default_rest_url(),
            token: None,
            timeout_secs: default_rest_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 读取 TOML 配置（文件可不存在），再叠加 `FLUX_SCENE__` 前缀的环境变量
    pub fn load(path: &Path) -> Result<Self> {
        let path = path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?;
        let settings = Config::builder()
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("FLUX_SCENE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {path}"))?;
        Ok(settings.try_deserialize()?)
    }

    /// 以帧数描述的追踪器参数文件；越界时保留当前值
    pub fn apply_tracker_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tracker config {}", path.display()))?;
        let frames: TrackerFrameConfig = serde_json::from_str(&text)?;
        if let Err(e) = self.tracker.params.apply_frame_config(&frames) {
            warn!(error = %e, "Ignoring tracker config file");
        }
        Ok(())
    }
}

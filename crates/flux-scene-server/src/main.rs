use anyhow::Result;
use clap::Parser;
use flux_scene::VisibilityTopic;
use flux_scene_server::shutdown::SignalHandler;
use flux_scene_server::AppConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// MQTT broker, host or host:port
    #[arg(long)]
    broker: Option<String>,

    /// Scene store REST base url
    #[arg(long)]
    rest_url: Option<String>,

    /// Maximum allowed message lag in seconds
    #[arg(long)]
    max_lag: Option<f64>,

    /// Replace out-of-range timestamps with the current time
    #[arg(long)]
    rewrite_bad_time: bool,

    /// Stamp every message with the current time
    #[arg(long)]
    rewrite_all_time: bool,

    /// NTP server used to correct the local clock
    #[arg(long)]
    ntp_server: Option<String>,

    /// Topic that carries camera pixel bounds: unregulated, regulated or none
    #[arg(long, value_parser = parse_visibility)]
    visibility_topic: Option<VisibilityTopic>,

    /// Tracker parameters in frames (JSON)
    #[arg(long)]
    tracker_config: Option<PathBuf>,
}

fn parse_visibility(s: &str) -> Result<VisibilityTopic, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown visibility topic: {s}"))
}

impl Args {
    /// 命令行参数覆盖配置文件
    fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(broker) = &self.broker {
            match broker.rsplit_once(':') {
                Some((host, port)) => {
                    config.mqtt.host = host.to_string();
                    config.mqtt.port = port.parse()?;
                }
                None => config.mqtt.host = broker.clone(),
            }
        }
        if let Some(url) = &self.rest_url {
            config.rest.url = url.clone();
        }
        if let Some(max_lag) = self.max_lag {
            config.controller.max_lag = max_lag;
        }
        config.controller.rewrite_bad_time |= self.rewrite_bad_time;
        config.controller.rewrite_all_time |= self.rewrite_all_time;
        if let Some(server) = &self.ntp_server {
            config.controller.ntp_server = Some(server.clone());
        }
        if let Some(topic) = self.visibility_topic {
            config.controller.visibility_topic = topic;
        }
        if let Some(path) = &self.tracker_config {
            config.apply_tracker_file(path)?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load(&args.config)?;
    args.apply(&mut config)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(config = %args.config.display(), "Starting scene controller");

    let (signals, shutdown_rx) = SignalHandler::new();
    tokio::spawn(async move {
        signals.wait_for_system_signal().await;
    });

    flux_scene_server::run(config, shutdown_rx).await
}

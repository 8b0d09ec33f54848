//! 多目标追踪器的黑盒契约与注册表

pub mod adapter;
pub mod nearest;

pub use adapter::{Batch, CategoryTracker, MAX_UNRELIABLE_TIME};
pub use nearest::{NearestNeighborFactory, NearestNeighborTracker};

use flux_scene_core::{FusionError, Result};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// 关联距离度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceType {
    /// 三维欧氏距离
    Euclidean,
    /// 仅平面 (x, y)
    Planar,
}

impl DistanceType {
    pub fn distance(&self, a: &Point3<f64>, b: &Point3<f64>) -> f64 {
        match self {
            DistanceType::Euclidean => (a - b).norm(),
            DistanceType::Planar => (a.xy() - b.xy()).norm(),
        }
    }
}

/// 提交给追踪器的一条测量
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerInput {
    /// 提交序号，回查原始物体用
    pub submission_id: usize,
    pub position: Point3<f64>,
    pub size: [f64; 3],
    pub yaw: f64,
    pub confidence: f64,
}

/// 追踪器输出的一条轨迹
#[derive(Debug, Clone, PartialEq)]
pub struct TrackState {
    /// 追踪器内部 id
    pub id: u64,
    /// 最近一次关联测量的提交序号
    pub submission_id: usize,
    /// 最近一次关联测量的时间
    pub last_measured: f64,
    pub position: Point3<f64>,
    pub velocity: Vector3<f64>,
}

/// 外部运动模型追踪器
pub trait Tracker: Send {
    fn update_params(&mut self, frame_rate: f64);

    fn track(
        &mut self,
        inputs: Vec<TrackerInput>,
        timestamp: f64,
        distance: DistanceType,
        threshold: f64,
    ) -> Result<()>;

    /// 追踪器自身判定为稳定的轨迹
    fn reliable_tracks(&self) -> Vec<TrackState>;
}

/// 追踪器时间参数（秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerParams {
    #[serde(default = "default_max_unreliable_time")]
    pub max_unreliable_time: f64,
    #[serde(default = "default_non_measurement_time_dynamic")]
    pub non_measurement_time_dynamic: f64,
    #[serde(default = "default_non_measurement_time_static")]
    pub non_measurement_time_static: f64,
    /// 轨迹判定为稳定所需的关联次数
    #[serde(default = "default_reliable_frames")]
    pub reliable_frames: u32,
    #[serde(default = "default_distance_type")]
    pub distance_type: DistanceType,
}

fn default_max_unreliable_time() -> f64 {
    0.3333
}

fn default_non_measurement_time_dynamic() -> f64 {
    0.2666
}

fn default_non_measurement_time_static() -> f64 {
    0.5333
}

fn default_reliable_frames() -> u32 {
    3
}

fn default_distance_type() -> DistanceType {
    DistanceType::Euclidean
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_unreliable_time: default_max_unreliable_time(),
            non_measurement_time_dynamic: default_non_measurement_time_dynamic(),
            non_measurement_time_static: default_non_measurement_time_static(),
            reliable_frames: default_reliable_frames(),
            distance_type: default_distance_type(),
        }
    }
}

/// 以帧数描述的追踪器配置文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerFrameConfig {
    pub max_unreliable_frames: f64,
    pub non_measurement_frames_dynamic: f64,
    pub non_measurement_frames_static: f64,
    pub baseline_frame_rate: f64,
}

impl TrackerParams {
    /// 帧数 / 基准帧率换算为时间；任一结果不在 (0, 10) 秒内则保留当前值
    pub fn apply_frame_config(&mut self, cfg: &TrackerFrameConfig) -> Result<()> {
        if cfg.baseline_frame_rate <= 0.0 {
            return Err(FusionError::Config("baseline_frame_rate must be positive".into()));
        }
        let times = [
            cfg.max_unreliable_frames / cfg.baseline_frame_rate,
            cfg.non_measurement_frames_dynamic / cfg.baseline_frame_rate,
            cfg.non_measurement_frames_static / cfg.baseline_frame_rate,
        ];
        if times.iter().any(|t| *t <= 0.0 || *t >= 10.0) {
            warn!(?times, "Tracker time parameters out of range, keeping defaults");
            return Err(FusionError::Config(format!("tracker times out of range: {times:?}")));
        }
        self.max_unreliable_time = times[0];
        self.non_measurement_time_dynamic = times[1];
        self.non_measurement_time_static = times[2];
        Ok(())
    }
}

/// 追踪器工厂
pub trait TrackerFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, params: &TrackerParams) -> Box<dyn Tracker>;
}

/// 可用追踪器注册表
#[derive(Clone)]
pub struct TrackerRegistry {
    factories: HashMap<String, Arc<dyn TrackerFactory>>,
    default: String,
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        let factory = NearestNeighborFactory;
        let mut registry = Self {
            factories: HashMap::new(),
            default: factory.name().to_string(),
        };
        registry.register(Arc::new(factory));
        registry
    }
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn TrackerFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(FusionError::NotFound(format!("tracker {name}")));
        }
        self.default = name.to_string();
        Ok(())
    }

    /// 按名称取工厂，未知名称回退到默认追踪器
    pub fn get(&self, name: Option<&str>) -> Option<Arc<dyn TrackerFactory>> {
        if let Some(name) = name {
            if let Some(f) = self.factories.get(name) {
                return Some(Arc::clone(f));
            }
            warn!(tracker = %name, default = %self.default, "Unknown tracker, using default");
        }
        self.factories.get(&self.default).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

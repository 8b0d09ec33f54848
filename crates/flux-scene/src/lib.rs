//! 多相机检测融合引擎
//!
//! 相机检测经标定映射到场景坐标，按类别交给后台追踪器关联成轨迹，
//! 再评估区域与绊线事件并发布到总线。子场景的输出可汇入父场景。

pub mod builder;
pub mod cache;
pub mod category;
pub mod child;
pub mod clock;
pub mod config;
pub mod controller;
pub mod geometry;
pub mod object;
pub mod region;
pub mod reid;
pub mod scene;
pub mod tracker;
pub mod tracking;

pub use cache::{CacheManager, InMemorySceneStore, SceneStore};
pub use child::{ChildConnector, ChildEvent, ChildLink, ChildSession};
pub use clock::{Clock, ClockSync, ManualClock, SharedClock, SystemClock, TimeSource};
pub use config::{ControllerConfig, VisibilityTopic};
pub use controller::{Handler, Inbound, SceneController, Subscription};
pub use scene::Scene;
pub use tracking::{Tracking, TrackingContext};

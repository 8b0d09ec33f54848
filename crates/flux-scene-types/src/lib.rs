//! 场景融合引擎共享的数据类型：总线消息、检测输入、场景存储记录和输出报文。

pub mod detection;
pub mod message;
pub mod output;
pub mod record;
pub mod time;

pub use detection::{BoundingBox, Detection, DetectionMessage, Intrinsics, ReidVector, SceneDataMessage, SensorMessage};
pub use message::Message;
pub use output::{DetectionOutput, EventMessage, ExitRecord, ObjectRecord, RegionEntry, RegulatedOutput};
pub use record::{
    AreaRecord, AssetRecord, CameraRecord, ChildKind, ChildSceneRecord, PoseRecord, RegionRecord,
    SceneRecord, SensorRecord, TripwireRecord,
};

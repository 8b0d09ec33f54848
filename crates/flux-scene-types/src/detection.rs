use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// 检测框，`bounding_box` 为归一化/米制坐标，`bounding_box_px` 为像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// 底边中点
    pub fn bottom_center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height)
    }
}

/// ReID 特征向量的几种线上表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReidVector {
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
    Embedded { embedding_vector: Vec<f32> },
}

impl ReidVector {
    /// 展平为单个特征向量
    pub fn values(&self) -> Vec<f32> {
        match self {
            ReidVector::Flat(v) => v.clone(),
            ReidVector::Nested(rows) => rows.iter().flatten().copied().collect(),
            ReidVector::Embedded { embedding_vector } => embedding_vector.clone(),
        }
    }
}

/// 相机内参，矩阵形式或参数形式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Intrinsics {
    Matrix([[f64; 3]; 3]),
    Params { fx: f64, fy: f64, cx: f64, cy: f64 },
}

impl Intrinsics {
    /// (fx, fy, cx, cy)
    pub fn params(&self) -> (f64, f64, f64, f64) {
        match self {
            Intrinsics::Matrix(m) => (m[0][0], m[1][1], m[0][2], m[1][2]),
            Intrinsics::Params { fx, fy, cx, cy } => (*fx, *fy, *cx, *cy),
        }
    }
}

/// 单个检测
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default, deserialize_with = "id_as_string")]
    pub id: Option<String>,
    #[serde(default, alias = "type")]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub bounding_box_px: Option<BoundingBox>,
    #[serde(default)]
    pub translation: Option<Vec<f64>>,
    #[serde(default)]
    pub rotation: Option<Vec<f64>>,
    #[serde(default)]
    pub size: Option<Vec<f64>>,
    #[serde(default)]
    pub velocity: Option<Vec<f64>>,
    #[serde(default)]
    pub lat_long_alt: Option<Vec<f64>>,
    #[serde(default)]
    pub reid: Option<ReidVector>,
    /// 其余字段原样透传到输出
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 相机检测消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionMessage {
    #[serde(deserialize_with = "string_id")]
    pub id: String,
    pub timestamp: String,
    #[serde(default)]
    pub objects: HashMap<String, Vec<Detection>>,
    #[serde(default)]
    pub intrinsics: Option<Intrinsics>,
    #[serde(default)]
    pub distortion: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub frame_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DetectionMessage {
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }

    /// 相机参数更新确认消息，不参与融合
    pub fn is_camera_update(&self) -> bool {
        self.extra.contains_key("updatecamera")
    }
}

/// 子场景发布的外部检测消息（`external/{scene}/{type}`）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDataMessage {
    #[serde(deserialize_with = "string_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub objects: Vec<Detection>,
    #[serde(default)]
    pub unique_detection_count: Option<u64>,
    #[serde(default)]
    pub frame_rate: Option<f64>,
}

impl SceneDataMessage {
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}

/// 传感器数值消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorMessage {
    #[serde(deserialize_with = "string_id")]
    pub id: String,
    pub timestamp: String,
    pub value: Value,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl SensorMessage {
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}

fn value_to_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_id(Value::deserialize(deserializer)?))
}

fn string_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    value_to_id(Value::deserialize(deserializer)?)
        .ok_or_else(|| serde::de::Error::custom("id must be a string or number"))
}

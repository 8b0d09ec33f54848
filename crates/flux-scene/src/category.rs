//! 物体类别注册表
//!
//! 每个类别是带参数的静态变体，按名称查找；资产记录可以覆盖默认参数。

use flux_scene_types::AssetRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_TRACKING_RADIUS: f64 = 2.0;

/// 检测框底点到地面位置的偏移策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftType {
    /// 直接使用检测位置
    None,
    /// 底边中点，沿视线方向后移半个占地尺寸
    Type1,
    /// 按俯视角把底点向框中心抬升后再后移
    Type2,
}

impl ShiftType {
    fn from_code(code: u8) -> Self {
        match code {
            0 => ShiftType::None,
            2 => ShiftType::Type2,
            _ => ShiftType::Type1,
        }
    }
}

/// 内置类别变体
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    Person,
    Vehicle,
    AprilTag,
    Other(String),
}

impl Category {
    pub fn from_name(name: &str) -> Self {
        match name {
            "person" => Category::Person,
            "vehicle" | "car" | "truck" => Category::Vehicle,
            "apriltag" => Category::AprilTag,
            other => Category::Other(other.to_string()),
        }
    }

    fn default_class(&self, name: &str) -> ObjectClass {
        let (size, tracking_radius, shift, rotation_from_velocity) = match self {
            Category::Person => (Some([0.5, 0.5, 1.85]), DEFAULT_TRACKING_RADIUS, ShiftType::Type1, false),
            Category::Vehicle => (Some([4.5, 1.8, 1.5]), 3.5, ShiftType::Type2, true),
            Category::AprilTag => (Some([0.15, 0.15, 0.01]), 1.0, ShiftType::None, false),
            Category::Other(_) => (None, DEFAULT_TRACKING_RADIUS, ShiftType::Type1, false),
        };
        ObjectClass {
            name: name.to_string(),
            category: self.clone(),
            size,
            tracking_radius,
            shift,
            rotation_from_velocity,
        }
    }
}

/// 类别参数
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectClass {
    pub name: String,
    pub category: Category,
    pub size: Option<[f64; 3]>,
    pub tracking_radius: f64,
    pub shift: ShiftType,
    pub rotation_from_velocity: bool,
}

/// 类别注册表，启动时构造并按引用传递
#[derive(Debug, Clone, Default)]
pub struct ObjectClassRegistry {
    overrides: HashMap<String, ObjectClass>,
}

impl ObjectClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按名称查找；未覆盖的类别使用变体默认值
    pub fn lookup(&self, name: &str) -> ObjectClass {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| Category::from_name(name).default_class(name))
    }

    /// 用资产记录覆盖类别参数，缺省字段保留变体默认值
    pub fn apply_assets(&mut self, assets: &[AssetRecord]) {
        self.overrides.clear();
        for asset in assets {
            let mut class = Category::from_name(&asset.name).default_class(&asset.name);
            if let (Some(x), Some(y), Some(z)) = (asset.x_size, asset.y_size, asset.z_size) {
                class.size = Some([x, y, z]);
            }
            if let Some(radius) = asset.tracking_radius {
                class.tracking_radius = radius;
            }
            if let Some(code) = asset.shift_type {
                class.shift = ShiftType::from_code(code);
            }
            if let Some(flag) = asset.rotation_from_velocity {
                class.rotation_from_velocity = flag;
            }
            debug!(class = %asset.name, "Object class updated from asset");
            self.overrides.insert(asset.name.clone(), class);
        }
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

//! 主题模板、解析与 MQTT 通配符匹配

/// 主题路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Camera { camera_id: String },
    Sensor { sensor_id: String },
    SceneData { scene_id: String, thing_type: String },
    RegionData { scene_id: String, region_id: String, thing_type: String },
    Regulated { scene_id: String },
    External { scene_id: String, thing_type: String },
    Event { region_type: String, scene_id: String, region_id: String, event_type: String },
    ChildStatus { name: String },
    ControllerStatus,
    Database,
}

/// 主题模板，所有主题共享同一个前缀
#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("scenescape")
    }
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn camera(&self, camera_id: &str) -> String {
        format!("{}/data/camera/{}", self.base, camera_id)
    }

    pub fn sensor(&self, sensor_id: &str) -> String {
        format!("{}/data/sensor/{}", self.base, sensor_id)
    }

    pub fn scene_data(&self, scene_id: &str, thing_type: &str) -> String {
        format!("{}/data/scene/{}/{}", self.base, scene_id, thing_type)
    }

    pub fn region_data(&self, scene_id: &str, region_id: &str, thing_type: &str) -> String {
        format!("{}/data/region/{}/{}/{}", self.base, scene_id, region_id, thing_type)
    }

    pub fn regulated(&self, scene_id: &str) -> String {
        format!("{}/regulated/scene/{}", self.base, scene_id)
    }

    pub fn external(&self, scene_id: &str, thing_type: &str) -> String {
        format!("{}/external/{}/{}", self.base, scene_id, thing_type)
    }

    pub fn event(&self, region_type: &str, scene_id: &str, region_id: &str, event_type: &str) -> String {
        format!(
            "{}/event/{}/{}/{}/{}",
            self.base, region_type, scene_id, region_id, event_type
        )
    }

    pub fn child_status(&self, name: &str) -> String {
        format!("{}/sys/child/status/{}", self.base, name)
    }

    pub fn controller_status(&self) -> String {
        format!("{}/sys/controller/status", self.base)
    }

    pub fn database(&self) -> String {
        format!("{}/cmd/database", self.base)
    }

    /// 解析具体主题（不含通配符）
    pub fn parse(&self, topic: &str) -> Option<Route> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        let s = |i: usize| parts[i].to_string();

        let route = match parts.as_slice() {
            ["data", "camera", _] => Route::Camera { camera_id: s(2) },
            ["data", "sensor", _] => Route::Sensor { sensor_id: s(2) },
            ["data", "scene", _, _] => Route::SceneData { scene_id: s(2), thing_type: s(3) },
            ["data", "region", _, _, _] => Route::RegionData {
                scene_id: s(2),
                region_id: s(3),
                thing_type: s(4),
            },
            ["regulated", "scene", _] => Route::Regulated { scene_id: s(2) },
            ["external", _, _] => Route::External { scene_id: s(1), thing_type: s(2) },
            ["event", _, _, _, _] => Route::Event {
                region_type: s(1),
                scene_id: s(2),
                region_id: s(3),
                event_type: s(4),
            },
            ["sys", "child", "status", _] => Route::ChildStatus { name: s(3) },
            ["sys", "controller", "status"] => Route::ControllerStatus,
            ["cmd", "database"] => Route::Database,
            _ => return None,
        };
        Some(route)
    }
}

/// 主题匹配算法
///
/// MQTT 通配符规则：
/// - `+` 匹配单个层级
/// - `#` 匹配多个层级（只能在末尾）
pub fn matches(filter: &str, topic: &str) -> bool {
    // 快速路径：无通配符
    if !filter.contains('+') && !filter.contains('#') {
        return filter == topic;
    }

    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    matches_parts(&filter_parts, &topic_parts)
}

fn matches_parts(filter: &[&str], topic: &[&str]) -> bool {
    match (filter.first(), topic.first()) {
        (None, None) => true,
        (Some(&"#"), _) => true,
        (Some(&"+"), Some(_)) => matches_parts(&filter[1..], &topic[1..]),
        (Some(f), Some(t)) if f == t => matches_parts(&filter[1..], &topic[1..]),
        _ => false,
    }
}

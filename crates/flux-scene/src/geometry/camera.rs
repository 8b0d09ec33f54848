use super::{Polygon, Pose};
use flux_scene_core::{FusionError, Result};
use flux_scene_types::{BoundingBox, CameraRecord, Intrinsics};
use nalgebra::{Point2, Point3, Vector3};
use std::collections::HashMap;

/// 上方角点射线不落地时，视野多边形沿地面延伸的距离（米）
const MAX_VIEW_DISTANCE: f64 = 100.0;
const UNDISTORT_ITERATIONS: usize = 10;

/// 针孔内参 + Brown-Conrady 畸变（k1 k2 p1 p2 k3）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: [f64; 5],
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy, distortion: [0.0; 5] }
    }

    /// 由水平视场角和分辨率推算
    pub fn from_fov(fov_deg: f64, width: f64, height: f64) -> Self {
        let f = (width / 2.0) / (fov_deg.to_radians() / 2.0).tan();
        Self::new(f, f, width / 2.0, height / 2.0)
    }

    pub fn with_distortion(mut self, coeffs: &HashMap<String, f64>) -> Self {
        for (i, key) in ["k1", "k2", "p1", "p2", "k3"].iter().enumerate() {
            self.distortion[i] = coeffs.get(*key).copied().unwrap_or(0.0);
        }
        self
    }

    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// 像素 → 去畸变的归一化像平面坐标
    pub fn normalize(&self, px: f64, py: f64) -> (f64, f64) {
        let xd = (px - self.cx) / self.fx;
        let yd = (py - self.cy) / self.fy;
        if self.distortion.iter().all(|c| *c == 0.0) {
            return (xd, yd);
        }
        // 不动点迭代求逆畸变
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let (dx, dy) = self.distort(x, y);
            x += xd - dx;
            y += yd - dy;
        }
        (x, y)
    }

    /// 归一化像平面坐标 → 像素（加畸变）
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let (xd, yd) = self.distort(x, y);
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    /// 像素框 → 归一化框：对左上、右下两个角点去畸变
    pub fn undistort_bbox(&self, bbox: &BoundingBox) -> BoundingBox {
        let (x0, y0) = self.normalize(bbox.x, bbox.y);
        let (x1, y1) = self.normalize(bbox.x + bbox.width, bbox.y + bbox.height);
        BoundingBox::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// 已标定相机：外参位姿（相机坐标 → 世界）+ 内参 + 地面视野
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    pose: Pose,
    intrinsics: CameraIntrinsics,
    resolution: (f64, f64),
    region_of_view: Option<Polygon>,
}

impl CameraPose {
    pub fn new(pose: Pose, intrinsics: CameraIntrinsics, resolution: (f64, f64)) -> Self {
        let mut camera = Self { pose, intrinsics, resolution, region_of_view: None };
        camera.region_of_view = camera.compute_region_of_view();
        camera
    }

    /// 从存储记录构造；缺少平移或旋转视为未标定，返回 `Ok(None)`
    pub fn from_record(record: &CameraRecord) -> Result<Option<Self>> {
        let (Some(translation), Some(rotation)) = (&record.translation, &record.rotation) else {
            return Ok(None);
        };
        let pose = Pose::from_components(translation, rotation, record.scale.as_deref())?;
        let [width, height] = record.resolution.unwrap_or([640.0, 480.0]);
        let intrinsics = match (&record.intrinsics, record.fov) {
            (Some(intr), _) => {
                let (fx, fy, cx, cy) = intr.params();
                CameraIntrinsics::new(fx, fy, cx, cy)
            }
            (None, Some(fov)) => CameraIntrinsics::from_fov(fov, width, height),
            (None, None) => {
                return Err(FusionError::geometry(format!(
                    "camera {} has neither intrinsics nor fov",
                    record.uid
                )))
            }
        };
        let intrinsics = match &record.distortion {
            Some(d) => intrinsics.with_distortion(d),
            None => intrinsics,
        };
        Ok(Some(Self::new(pose, intrinsics, (width, height))))
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// 替换内参（消息携带新内参时）
    pub fn set_intrinsics(&mut self, intrinsics: &Intrinsics, distortion: Option<&HashMap<String, f64>>) {
        let (fx, fy, cx, cy) = intrinsics.params();
        let mut next = CameraIntrinsics::new(fx, fy, cx, cy);
        next.distortion = self.intrinsics.distortion;
        if let Some(d) = distortion {
            next = next.with_distortion(d);
        }
        self.intrinsics = next;
        self.region_of_view = self.compute_region_of_view();
    }

    pub fn region_of_view(&self) -> Option<&Polygon> {
        self.region_of_view.as_ref()
    }

    /// 相机光心在世界坐标中的位置
    pub fn origin(&self) -> Point3<f64> {
        self.pose.transform_point(&Point3::origin())
    }

    /// 归一化像平面点投射到 z=0 地面；射线不朝下时返回 None
    pub fn ground_point(&self, x: f64, y: f64) -> Option<Point3<f64>> {
        let origin = self.origin();
        let target = self.pose.transform_point(&Point3::new(x, y, 1.0));
        let ray: Vector3<f64> = target - origin;
        if ray.z >= -f64::EPSILON {
            return None;
        }
        let t = -origin.z / ray.z;
        let hit = origin + ray * t;
        Some(Point3::new(hit.x, hit.y, 0.0))
    }

    /// 相机坐标点 → 世界坐标点
    pub fn camera_point_to_world(&self, p: &Point3<f64>) -> Point3<f64> {
        self.pose.transform_point(p)
    }

    /// 世界坐标点 → 像素；在相机背后时返回 None
    pub fn world_to_pixel(&self, p: &Point3<f64>) -> Option<(f64, f64)> {
        let inv = self.pose.inverse()?;
        let local = inv.transform_point(p);
        if local.z <= 0.0 {
            return None;
        }
        Some(self.intrinsics.to_pixel(local.x / local.z, local.y / local.z))
    }

    /// 图像四角投射到地面得到的视野多边形
    fn compute_region_of_view(&self) -> Option<Polygon> {
        let (w, h) = self.resolution;
        let corner = |px: f64, py: f64| {
            let (x, y) = self.intrinsics.normalize(px, py);
            self.ground_point(x, y)
        };
        let bottom_left = corner(0.0, h)?;
        let bottom_right = corner(w, h)?;
        let origin = self.origin();
        let origin2 = Point2::new(origin.x, origin.y);

        // 上方角点射线可能越过地平线，此时沿对应下角点方向延伸
        let extend = |bottom: &Point3<f64>| {
            let dir = Point2::new(bottom.x, bottom.y) - origin2;
            let n = dir.norm();
            if n <= f64::EPSILON {
                return Point2::new(bottom.x, bottom.y);
            }
            origin2 + dir / n * MAX_VIEW_DISTANCE
        };
        let upper = |px: f64, bottom: &Point3<f64>| match corner(px, 0.0) {
            Some(p) if Point2::new(p.x, p.y).coords.metric_distance(&origin2.coords) <= MAX_VIEW_DISTANCE => {
                Point2::new(p.x, p.y)
            }
            _ => extend(bottom),
        };

        let upper_left = upper(0.0, &bottom_left);
        let upper_right = upper(w, &bottom_right);
        Some(Polygon::new(vec![
            upper_left,
            upper_right,
            Point2::new(bottom_right.x, bottom_right.y),
            Point2::new(bottom_left.x, bottom_left.y),
        ]))
    }

    /// 世界点是否在相机视野内
    pub fn can_see(&self, p: &Point3<f64>) -> bool {
        self.region_of_view
            .as_ref()
            .map(|rov| rov.contains(&Point2::new(p.x, p.y)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 3 米高、朝下俯视 45 度、沿 +y 方向看的相机
    fn tilted_camera() -> CameraPose {
        let pose = Pose::from_components(&[0.0, 0.0, 3.0], &[-135.0, 0.0, 0.0], None).unwrap();
        CameraPose::new(pose, CameraIntrinsics::from_fov(70.0, 640.0, 480.0), (640.0, 480.0))
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let mut intr = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        intr.distortion = [-0.2, 0.05, 0.001, -0.001, 0.0];
        let (px, py) = intr.to_pixel(0.3, -0.2);
        let (x, y) = intr.normalize(px, py);
        assert!((x - 0.3).abs() < 1e-6);
        assert!((y + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_principal_ray_hits_ground() {
        let cam = tilted_camera();
        let p = cam.ground_point(0.0, 0.0).unwrap();
        assert!((p.x).abs() < 1e-9);
        assert!((p.y - 3.0).abs() < 1e-9);
        assert_eq!(p.z, 0.0);
    }

    #[test]
    fn test_project_back_to_pixel() {
        let cam = tilted_camera();
        let (px, py) = cam.world_to_pixel(&Point3::new(0.0, 3.0, 0.0)).unwrap();
        assert!((px - 320.0).abs() < 1e-6);
        assert!((py - 240.0).abs() < 1e-6);
        assert!(cam.world_to_pixel(&Point3::new(0.0, -3.0, 0.0)).is_none());
    }

    #[test]
    fn test_region_of_view() {
        let cam = tilted_camera();
        assert!(cam.can_see(&Point3::new(0.0, 3.0, 0.0)));
        assert!(!cam.can_see(&Point3::new(0.0, -2.0, 0.0)));
    }

    #[test]
    fn test_uncalibrated_record() {
        let record = CameraRecord {
            uid: "cam1".into(),
            name: None,
            translation: None,
            rotation: None,
            scale: None,
            intrinsics: None,
            fov: Some(70.0),
            distortion: None,
            resolution: None,
        };
        assert!(CameraPose::from_record(&record).unwrap().is_none());
    }
}

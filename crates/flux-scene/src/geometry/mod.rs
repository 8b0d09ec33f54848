//! 平面几何：多边形/圆判定、线段相交与方向

pub mod camera;
pub mod earth;
pub mod pose;

pub use camera::{CameraIntrinsics, CameraPose};
pub use pose::Pose;

use nalgebra::Point2;

/// 带包围盒预过滤的多边形
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    points: Vec<Point2<f64>>,
    min: Point2<f64>,
    max: Point2<f64>,
}

impl Polygon {
    pub fn new(points: Vec<Point2<f64>>) -> Self {
        let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in &points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Self { points, min, max }
    }

    pub fn from_pairs(pairs: &[[f64; 2]]) -> Self {
        Self::new(pairs.iter().map(|p| Point2::new(p[0], p[1])).collect())
    }

    pub fn points(&self) -> &[Point2<f64>] {
        &self.points
    }

    pub fn to_pairs(&self) -> Vec<[f64; 2]> {
        self.points.iter().map(|p| [p.x, p.y]).collect()
    }

    /// 射线法；少于 3 个点的多边形不包含任何点
    pub fn contains(&self, p: &Point2<f64>) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        if p.x < self.min.x || p.x > self.max.x || p.y < self.min.y || p.y > self.max.y {
            return false;
        }

        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (&self.points[i], &self.points[j]);
            if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// 圆内判定，先用曼哈顿距离快速接受
pub fn circle_contains(center: &Point2<f64>, radius: f64, p: &Point2<f64>) -> bool {
    let dx = (p.x - center.x).abs();
    let dy = (p.y - center.y).abs();
    if dx + dy <= radius {
        return true;
    }
    dx * dx + dy * dy <= radius * radius
}

/// (b - a) × (p - a) 的符号
pub fn cross_sign(a: &Point2<f64>, b: &Point2<f64>, p: &Point2<f64>) -> i8 {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross > 0.0 {
        1
    } else if cross < 0.0 {
        -1
    } else {
        0
    }
}

/// 线段 p1p2 与 q1q2 是否严格相交
pub fn segments_intersect(p1: &Point2<f64>, p2: &Point2<f64>, q1: &Point2<f64>, q2: &Point2<f64>) -> bool {
    let d1 = cross_sign(q1, q2, p1);
    let d2 = cross_sign(q1, q2, p2);
    let d3 = cross_sign(p1, p2, q1);
    let d4 = cross_sign(p1, p2, q2);
    d1 != 0 && d2 != 0 && d3 != 0 && d4 != 0 && d1 != d2 && d3 != d4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::from_pairs(&[[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]])
    }

    #[test]
    fn test_polygon_contains() {
        let poly = square();
        assert!(poly.contains(&Point2::new(2.0, 2.0)));
        assert!(!poly.contains(&Point2::new(5.0, 2.0)));
        assert!(!poly.contains(&Point2::new(2.0, -0.1)));
    }

    #[test]
    fn test_degenerate_polygon() {
        let line = Polygon::from_pairs(&[[0.0, 0.0], [4.0, 4.0]]);
        assert!(!line.contains(&Point2::new(2.0, 2.0)));
    }

    #[test]
    fn test_concave_polygon() {
        let l = Polygon::from_pairs(&[[0.0, 0.0], [4.0, 0.0], [4.0, 1.0], [1.0, 1.0], [1.0, 4.0], [0.0, 4.0]]);
        assert!(l.contains(&Point2::new(0.5, 3.0)));
        assert!(!l.contains(&Point2::new(3.0, 3.0)));
    }

    #[test]
    fn test_circle_contains() {
        let c = Point2::new(0.0, 0.0);
        assert!(circle_contains(&c, 2.0, &Point2::new(1.0, 1.0)));
        assert!(circle_contains(&c, 2.0, &Point2::new(1.4, 1.4)));
        assert!(!circle_contains(&c, 2.0, &Point2::new(1.5, 1.5)));
    }

    #[test]
    fn test_segments_intersect() {
        let (a, b) = (Point2::new(0.0, 0.0), Point2::new(2.0, 2.0));
        let (c, d) = (Point2::new(0.0, 2.0), Point2::new(2.0, 0.0));
        assert!(segments_intersect(&a, &b, &c, &d));
        assert!(!segments_intersect(&a, &c, &b, &d));
    }

    #[test]
    fn test_cross_sign_flips() {
        let (a, b, p) = (Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(0.5, 1.0));
        assert_eq!(cross_sign(&a, &b, &p), 1);
        assert_eq!(cross_sign(&b, &a, &p), -1);
    }
}

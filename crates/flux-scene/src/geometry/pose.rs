use flux_scene_core::{FusionError, Result};
use flux_scene_types::PoseRecord;
use nalgebra::{Matrix3, Matrix4, Point2, Point3, Quaternion, Rotation3, UnitQuaternion, Vector3};

/// 刚体（含缩放）变换，4x4 齐次矩阵
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    matrix: Matrix4<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Self { matrix: Matrix4::identity() }
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    /// 平移 + 旋转（四元数 `[x, y, z, w]` 或 XYZ 欧拉角，单位度）+ 缩放
    pub fn from_components(translation: &[f64], rotation: &[f64], scale: Option<&[f64]>) -> Result<Self> {
        if translation.len() != 3 {
            return Err(FusionError::geometry(format!(
                "translation needs 3 values, got {}",
                translation.len()
            )));
        }
        let rot = rotation_from_values(rotation)?;
        let scale = match scale {
            None => Vector3::new(1.0, 1.0, 1.0),
            Some([s]) => Vector3::new(*s, *s, *s),
            Some([x, y, z]) => Vector3::new(*x, *y, *z),
            Some(other) => {
                return Err(FusionError::geometry(format!(
                    "scale needs 1 or 3 values, got {}",
                    other.len()
                )))
            }
        };

        let mut matrix = Matrix4::identity();
        let linear: Matrix3<f64> = rot.to_rotation_matrix().into_inner() * Matrix3::from_diagonal(&scale);
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&linear);
        matrix[(0, 3)] = translation[0];
        matrix[(1, 3)] = translation[1];
        matrix[(2, 3)] = translation[2];
        Ok(Self { matrix })
    }

    pub fn from_record(record: &PoseRecord) -> Result<Self> {
        match record {
            PoseRecord::Matrix(rows) => {
                if rows.len() != 4 || rows.iter().any(|r| r.len() != 4) {
                    return Err(FusionError::geometry("pose matrix must be 4x4"));
                }
                Ok(Self::from_matrix(Matrix4::from_fn(|r, c| rows[r][c])))
            }
            PoseRecord::Components { translation, rotation, scale } => {
                Self::from_components(translation, rotation, scale.as_deref())
            }
        }
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)])
    }

    /// 去除缩放后的旋转
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        let linear: Matrix3<f64> = self.matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let mut cols = linear;
        for mut col in cols.column_iter_mut() {
            let n = col.norm();
            if n > 0.0 {
                col /= n;
            }
        }
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&cols))
    }

    /// self ∘ inner：先应用 inner，再应用 self
    pub fn compose(&self, inner: &Pose) -> Pose {
        Pose::from_matrix(self.matrix * inner.matrix)
    }

    pub fn inverse(&self) -> Option<Pose> {
        self.matrix.try_inverse().map(Pose::from_matrix)
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.matrix.transform_point(p)
    }

    /// 平面点按 z=0 变换
    pub fn transform_point_2d(&self, p: &Point2<f64>) -> Point2<f64> {
        let out = self.transform_point(&Point3::new(p.x, p.y, 0.0));
        Point2::new(out.x, out.y)
    }

    /// 变换一个四元数朝向 `[x, y, z, w]`
    pub fn transform_rotation(&self, q: &[f64; 4]) -> [f64; 4] {
        let inner = UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]));
        let out = self.rotation() * inner;
        [out.i, out.j, out.k, out.w]
    }
}

fn rotation_from_values(rotation: &[f64]) -> Result<UnitQuaternion<f64>> {
    match rotation {
        [x, y, z, w] => Ok(UnitQuaternion::from_quaternion(Quaternion::new(*w, *x, *y, *z))),
        [a, b, c] => {
            // 内旋 XYZ：R = Rx * Ry * Rz
            let rx = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), a.to_radians());
            let ry = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), b.to_radians());
            let rz = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), c.to_radians());
            Ok(rx * ry * rz)
        }
        other => Err(FusionError::geometry(format!(
            "rotation needs a quaternion or 3 euler angles, got {} values",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: &Matrix4<f64>, b: &Matrix4<f64>) -> bool {
        (a - b).abs().max() < 1e-9
    }

    #[test]
    fn test_translation_and_yaw() {
        let pose = Pose::from_components(&[1.0, 2.0, 0.0], &[0.0, 0.0, 90.0], None).unwrap();
        let p = pose.transform_point(&Point3::new(1.0, 0.0, 0.0));
        assert!((p.x - 1.0).abs() < 1e-9);
        assert!((p.y - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_quaternion_matches_euler() {
        let h = (0.5f64).sqrt();
        let q = Pose::from_components(&[0.0; 3], &[0.0, 0.0, h, h], None).unwrap();
        let e = Pose::from_components(&[0.0; 3], &[0.0, 0.0, 90.0], None).unwrap();
        assert!(close(q.matrix(), e.matrix()));
    }

    #[test]
    fn test_scale_removed_from_rotation() {
        let pose = Pose::from_components(&[0.0; 3], &[0.0, 0.0, 45.0], Some(&[2.0])).unwrap();
        let angle = pose.rotation().angle();
        assert!((angle - 45f64.to_radians()).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_components() {
        assert!(Pose::from_components(&[0.0, 0.0], &[0.0, 0.0, 0.0], None).is_err());
        assert!(Pose::from_components(&[0.0; 3], &[0.0, 0.0], None).is_err());
        assert!(Pose::from_record(&PoseRecord::Matrix(vec![vec![1.0; 3]; 3])).is_err());
    }

    fn pose_strategy() -> impl Strategy<Value = Pose> {
        (
            prop::array::uniform3(-50.0f64..50.0),
            prop::array::uniform3(-180.0f64..180.0),
            0.1f64..10.0,
        )
            .prop_map(|(t, r, s)| Pose::from_components(&t, &r, Some(&[s])).unwrap_or_default())
    }

    proptest! {
        #[test]
        fn prop_child_parent_grandparent_composition(
            child_to_parent in pose_strategy(),
            parent_to_grand in pose_strategy(),
            x in -20.0f64..20.0,
            y in -20.0f64..20.0,
        ) {
            let direct = parent_to_grand.compose(&child_to_parent);
            let p = Point3::new(x, y, 0.0);
            let hop = parent_to_grand.transform_point(&child_to_parent.transform_point(&p));
            let once = direct.transform_point(&p);
            prop_assert!((hop - once).norm() < 1e-6 * (1.0 + hop.coords.norm()));
        }
    }
}

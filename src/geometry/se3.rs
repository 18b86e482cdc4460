//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses follow the `T_target_source` naming convention used throughout the
//! crate: `T_w_a` maps points from frame `a` into the world frame.
//!
//! The tangent space uses the decoupled parameterization
//! `[rotation_vec (3), translation (3)]`, which is what the optimizer
//! retracts with (`x ⊕ δ = x ∘ exp(δ)`).

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

/// Rigid body transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation =
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(x, y, z),
        }
    }

    /// Rotation about the Z axis (yaw) followed by a translation.
    pub fn from_yaw_translation(yaw: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix [R | t; 0 | 1].
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r, translation)
    }

    /// Convert to homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation.to_rotation_matrix().into_inner());
        mat[(0, 3)] = self.translation.x;
        mat[(1, 3)] = self.translation.y;
        mat[(2, 3)] = self.translation.z;
        mat
    }

    /// Inverse transformation: [R^T | -R^T * t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Relative transform `self^{-1} ∘ other`, i.e. `T_a_b` from `T_w_a` and `T_w_b`.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    /// Transform a single point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Get the rotation matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Log map: `[rotation_vec, translation]`.
    pub fn log(&self) -> Vector6<f64> {
        let rot_vec = self.rotation.scaled_axis();
        Vector6::new(
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    /// Exponential map from a 6-element tangent vector.
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let rot_vec = Vector3::new(tangent[0], tangent[1], tangent[2]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rot_vec),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
        }
    }

    /// Apply a tangent-space update on the right: `self ∘ exp(delta)`.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        self.compose(&Self::exp(delta))
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity() {
        let se3 = SE3::identity();
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(se3.transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };

        let composed = se3.compose(&se3.inverse());
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);
        assert_relative_eq!(composed.angle(), 0.0, epsilon = 1e-10);

        let p = Vector3::new(-4.0, 0.5, 2.0);
        let p_back = se3.inverse().transform_point(&se3.transform_point(&p));
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose_rotates_translation() {
        let yaw90 = SE3::from_yaw_translation(std::f64::consts::FRAC_PI_2, Vector3::zeros());
        let forward = SE3::from_translation(1.0, 0.0, 0.0);

        let composed = yaw90.compose(&forward);

        assert_relative_eq!(composed.translation, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-10);
    }

    #[test]
    fn test_between() {
        let t_w_a = SE3::from_yaw_translation(0.3, Vector3::new(1.0, 0.0, 0.0));
        let t_w_b = SE3::from_yaw_translation(-0.2, Vector3::new(4.0, 2.0, 0.5));

        let t_a_b = t_w_a.between(&t_w_b);
        let recovered = t_w_a.compose(&t_a_b);

        assert_relative_eq!(recovered.translation, t_w_b.translation, epsilon = 1e-10);
        assert_relative_eq!(recovered.rotation.coords, t_w_b.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_to_from_matrix() {
        let se3 = SE3::from_yaw_translation(0.7, Vector3::new(1.0, -2.0, 3.0));
        let back = SE3::from_matrix(se3.to_matrix());

        assert_relative_eq!(back.translation, se3.translation, epsilon = 1e-10);
        assert_relative_eq!(back.rotation.coords, se3.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_retract_zero_is_noop() {
        let se3 = SE3::from_yaw_translation(1.1, Vector3::new(0.1, 0.2, 0.3));
        let same = se3.retract(&Vector6::zeros());
        assert_eq!(same, se3);
    }
}

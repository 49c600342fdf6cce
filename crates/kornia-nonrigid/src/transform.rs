use glam::{DMat3, DQuat, DVec3};
use rayon::prelude::*;

use crate::parallel;

/// A 3D rigid transformation made of a linear (rotation) part and a translation.
///
/// Points are mapped as `p' = linear * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    /// Rotation matrix.
    pub linear: DMat3,
    /// Translation vector.
    pub translation: DVec3,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl RigidTransform {
    /// The identity transformation.
    pub const IDENTITY: Self = Self {
        linear: DMat3::IDENTITY,
        translation: DVec3::ZERO,
    };

    /// Create a transformation from a rotation matrix and a translation vector.
    pub fn new(linear: DMat3, translation: DVec3) -> Self {
        Self {
            linear,
            translation,
        }
    }

    /// Create a transformation from an axis, an angle in radians and a translation.
    ///
    /// The axis does not need to be normalized. A zero axis yields no rotation.
    pub fn from_axis_angle(axis: &[f64; 3], angle: f64, translation: &[f64; 3]) -> Self {
        let axis = DVec3::from_array(*axis).normalize_or_zero();
        let linear = if axis == DVec3::ZERO {
            DMat3::IDENTITY
        } else {
            DMat3::from_axis_angle(axis, angle)
        };
        Self::new(linear, DVec3::from_array(*translation))
    }

    /// Create a transformation from a rotation vector (axis scaled by angle) and a translation.
    pub fn from_twist(omega: DVec3, translation: DVec3) -> Self {
        Self::new(
            DMat3::from_quat(DQuat::from_scaled_axis(omega)),
            translation,
        )
    }

    /// Return `self ∘ other`, i.e. `other` is applied first.
    pub fn compose(&self, other: &RigidTransform) -> Self {
        Self {
            linear: self.linear * other.linear,
            translation: self.linear * other.translation + self.translation,
        }
    }

    /// Return the inverse transformation.
    pub fn inverse(&self) -> Self {
        let linear = self.linear.transpose();
        Self {
            linear,
            translation: -(linear * self.translation),
        }
    }

    /// Apply the transformation to a point.
    #[inline]
    pub fn transform_vec3(&self, point: DVec3) -> DVec3 {
        self.linear * point + self.translation
    }

    /// Apply the transformation to a point given as an array.
    #[inline]
    pub fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        self.transform_vec3(DVec3::from_array(*point)).to_array()
    }

    /// Rotation angle in radians of the linear part.
    pub fn rotation_angle(&self) -> f64 {
        let trace = self.linear.x_axis.x + self.linear.y_axis.y + self.linear.z_axis.z;
        ((trace - 1.0) * 0.5).clamp(-1.0, 1.0).acos()
    }

    /// Squared distance to the identity: `‖linear − I‖²_F + ‖translation‖²`.
    pub fn delta_norm_squared(&self) -> f64 {
        frobenius_norm_squared(&(self.linear - DMat3::IDENTITY))
            + self.translation.length_squared()
    }
}

/// Squared Frobenius norm of a 3x3 matrix.
pub(crate) fn frobenius_norm_squared(m: &DMat3) -> f64 {
    m.to_cols_array().iter().map(|v| v * v).sum()
}

/// An ordered set of rigid transformations, one per point or per control node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RigidTransformSet(Vec<RigidTransform>);

impl RigidTransformSet {
    /// Create a set of `len` identity transformations.
    pub fn identity(len: usize) -> Self {
        Self(vec![RigidTransform::IDENTITY; len])
    }

    /// Resize the set, new entries are set to the identity.
    pub fn resize(&mut self, len: usize) {
        self.0.resize(len, RigidTransform::IDENTITY);
    }

    /// Left-compose every transformation with the matching increment: `self[i] = increments[i] ∘ self[i]`.
    ///
    /// PRECONDITION: both sets have the same length.
    pub fn pre_apply(&mut self, increments: &RigidTransformSet) {
        assert_eq!(
            self.len(),
            increments.len(),
            "Transformation sets must have the same length"
        );
        self.0
            .par_iter_mut()
            .zip(increments.0.par_iter())
            .for_each(|(tf, inc)| *tf = inc.compose(tf));
    }

    /// Transform each point with its own transformation.
    ///
    /// PRECONDITION: `src_points`, `dst_points` and the set have the same length.
    pub fn transform_points(&self, src_points: &[[f64; 3]], dst_points: &mut [[f64; 3]]) {
        assert_eq!(self.len(), src_points.len());
        assert_eq!(src_points.len(), dst_points.len());
        dst_points
            .par_iter_mut()
            .zip(src_points.par_iter().zip(self.0.par_iter()))
            .for_each(|(dst, (src, tf))| *dst = tf.transform_point(src));
    }

    /// Largest per-transformation distance to the identity, `max_i sqrt(‖R_i − I‖²_F + ‖t_i‖²)`.
    pub fn max_delta_norm(&self) -> f64 {
        parallel::par_max(&self.0, RigidTransform::delta_norm_squared).sqrt()
    }
}

impl From<Vec<RigidTransform>> for RigidTransformSet {
    fn from(transforms: Vec<RigidTransform>) -> Self {
        Self(transforms)
    }
}

impl std::ops::Deref for RigidTransformSet {
    type Target = [RigidTransform];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for RigidTransformSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_and_inverse() {
        let a = RigidTransform::from_axis_angle(&[0.0, 0.0, 1.0], 0.3, &[1.0, -2.0, 0.5]);
        let b = RigidTransform::from_axis_angle(&[1.0, 1.0, 0.0], -0.7, &[0.0, 0.4, 2.0]);

        let p = [0.3, -1.2, 2.5];
        let ab = a.compose(&b).transform_point(&p);
        let a_b = a.transform_point(&b.transform_point(&p));
        for i in 0..3 {
            assert_relative_eq!(ab[i], a_b[i], epsilon = 1e-12);
        }

        let identity = a.compose(&a.inverse());
        assert!(identity.delta_norm_squared() < 1e-24);
    }

    #[test]
    fn test_rotation_angle() {
        let tf = RigidTransform::from_axis_angle(&[0.0, 1.0, 0.0], 0.25, &[0.0; 3]);
        assert_relative_eq!(tf.rotation_angle(), 0.25, epsilon = 1e-12);
        assert_eq!(RigidTransform::IDENTITY.rotation_angle(), 0.0);
    }

    #[test]
    fn test_from_twist_zero() {
        let tf = RigidTransform::from_twist(DVec3::ZERO, DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(tf.linear, DMat3::IDENTITY);
        assert_eq!(tf.translation, DVec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_delta_norm() {
        let tf = RigidTransform::new(DMat3::IDENTITY, DVec3::new(3.0, 0.0, 4.0));
        assert_relative_eq!(tf.delta_norm_squared(), 25.0);

        let mut set = RigidTransformSet::identity(4);
        assert_eq!(set.max_delta_norm(), 0.0);
        set[2] = tf;
        assert_relative_eq!(set.max_delta_norm(), 5.0);
    }

    #[test]
    fn test_pre_apply() {
        let old = RigidTransform::from_axis_angle(&[1.0, 0.0, 0.0], 0.1, &[0.0, 1.0, 0.0]);
        let inc = RigidTransform::from_axis_angle(&[0.0, 0.0, 1.0], 0.2, &[0.5, 0.0, 0.0]);

        let mut set = RigidTransformSet::from(vec![old; 3]);
        set.pre_apply(&RigidTransformSet::from(vec![inc; 3]));

        let expected = inc.compose(&old);
        for tf in set.iter() {
            assert_eq!(*tf, expected);
        }
    }

    #[test]
    fn test_transform_points() {
        let mut set = RigidTransformSet::identity(2);
        set[1] = RigidTransform::new(DMat3::IDENTITY, DVec3::new(1.0, 0.0, 0.0));

        let src = vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let mut dst = vec![[0.0; 3]; 2];
        set.transform_points(&src, &mut dst);

        assert_eq!(dst, vec![[1.0, 2.0, 3.0], [5.0, 5.0, 6.0]]);
    }

    #[test]
    #[should_panic(expected = "Transformation sets must have the same length")]
    fn test_pre_apply_mismatch() {
        let mut set = RigidTransformSet::identity(2);
        set.pre_apply(&RigidTransformSet::identity(3));
    }
}

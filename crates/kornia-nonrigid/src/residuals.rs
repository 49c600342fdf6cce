use glam::DVec3;
use kiddo::{immutable::float::kdtree::ImmutableKdTree, SquaredEuclidean};
use rayon::prelude::*;

use crate::transform::RigidTransformSet;

/// Per-point residuals of the combined metric against the closest destination point.
///
/// For every source point warped by its own transformation, the closest destination
/// point `d` with normal `n` is looked up and the residual is
/// `w_pt2pt * ‖d − p‖² + w_pt2pl * (n · (d − p))²`.
///
/// Returns NaN for every point when the destination set is empty.
///
/// PRECONDITION: `dst_points` and `dst_normals` have the same length, `transforms` has
/// one entry per source point.
pub fn combined_residuals(
    dst_points: &[[f64; 3]],
    dst_normals: &[[f64; 3]],
    src_points: &[[f64; 3]],
    transforms: &RigidTransformSet,
    point_to_point_weight: f64,
    point_to_plane_weight: f64,
) -> Vec<f64> {
    assert_eq!(dst_points.len(), dst_normals.len());
    assert_eq!(src_points.len(), transforms.len());

    if dst_points.is_empty() {
        return vec![f64::NAN; src_points.len()];
    }

    let kdtree: ImmutableKdTree<f64, u32, 3, 32> = ImmutableKdTree::new_from_slice(dst_points);

    src_points
        .par_iter()
        .zip(transforms.par_iter())
        .map(|(src, tf)| {
            let p = tf.transform_point(src);
            let nn = kdtree.nearest_one::<SquaredEuclidean>(&p);
            let index = nn.item as usize;
            let delta = DVec3::from_array(dst_points[index]) - DVec3::from_array(p);
            let plane_distance = DVec3::from_array(dst_normals[index]).dot(delta);
            point_to_point_weight * delta.length_squared()
                + point_to_plane_weight * plane_distance * plane_distance
        })
        .collect()
}

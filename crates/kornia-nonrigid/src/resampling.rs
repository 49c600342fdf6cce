use glam::{DMat3, DVec3};
use rayon::prelude::*;

use crate::neighbors::NeighborSet;
use crate::transform::{RigidTransform, RigidTransformSet};

// weights within this distance of the total count as the whole weight
const DOMINANT_WEIGHT_TOLERANCE: f64 = 1e-12;

/// Interpolate a sparse transformation set at the points of a dense set.
///
/// Every dense transformation blends the transformations of its neighbors: rotations and
/// translations are averaged with the neighbor weights (divided by their total), and the
/// averaged linear part is projected back to the closest rotation matrix. A point with a
/// single neighbor, or with a neighbor carrying the whole weight, copies that
/// transformation exactly. A point without neighbors gets the identity.
///
/// PRECONDITION: every neighbor index is below `sparse.len()`.
///
/// # Arguments
///
/// * `sparse` - The transformations of the control nodes.
/// * `neighborhoods` - The control nodes of every dense point.
/// * `dense` - The output transformations, resized to `neighborhoods.len()`.
pub fn resample_transformations(
    sparse: &RigidTransformSet,
    neighborhoods: &[NeighborSet],
    dense: &mut RigidTransformSet,
) {
    assert!(
        neighborhoods
            .iter()
            .flatten()
            .all(|neighbor| neighbor.index < sparse.len()),
        "Neighbor index out of bounds for the sparse transformation set"
    );

    dense.resize(neighborhoods.len());
    dense
        .par_iter_mut()
        .zip(neighborhoods.par_iter())
        .for_each(|(tf, neighbors)| *tf = blend(sparse, neighbors));
}

fn blend(sparse: &RigidTransformSet, neighbors: &NeighborSet) -> RigidTransform {
    match neighbors.as_slice() {
        [] => return RigidTransform::IDENTITY,
        [single] => return sparse[single.index],
        _ => {}
    }

    let total = neighbors.iter().map(|n| n.weight).sum::<f64>();
    if !(total.abs() > f64::EPSILON && total.is_finite()) {
        return RigidTransform::IDENTITY;
    }

    if let Some(dominant) = neighbors
        .iter()
        .find(|n| (n.weight - total).abs() <= DOMINANT_WEIGHT_TOLERANCE * total.abs())
    {
        return sparse[dominant.index];
    }

    let mut linear = DMat3::ZERO;
    let mut translation = DVec3::ZERO;
    for neighbor in neighbors {
        let w = neighbor.weight / total;
        linear += sparse[neighbor.index].linear * w;
        translation += sparse[neighbor.index].translation * w;
    }

    RigidTransform::new(nearest_rotation(&linear), translation)
}

/// Closest rotation matrix in the Frobenius sense, `U Vᵀ` with a reflection fix.
pub(crate) fn nearest_rotation(m: &DMat3) -> DMat3 {
    let a = faer::Mat::<f64>::from_fn(3, 3, |i, j| m.col(j)[i]);
    let svd = a.svd();
    let (u, v) = (svd.u(), svd.v());

    let mut u_cols = [DVec3::ZERO; 3];
    let mut v_cols = [DVec3::ZERO; 3];
    for j in 0..3 {
        u_cols[j] = DVec3::new(u[(0, j)], u[(1, j)], u[(2, j)]);
        v_cols[j] = DVec3::new(v[(0, j)], v[(1, j)], v[(2, j)]);
    }

    let mut u = DMat3::from_cols(u_cols[0], u_cols[1], u_cols[2]);
    let v = DMat3::from_cols(v_cols[0], v_cols[1], v_cols[2]);
    // flip the direction of the smallest singular value to avoid a reflection
    if (u * v.transpose()).determinant() < 0.0 {
        u.z_axis = -u.z_axis;
    }
    u * v.transpose()
}

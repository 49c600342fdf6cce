use std::num::NonZeroUsize;

use kiddo::{immutable::float::kdtree::ImmutableKdTree, SquaredEuclidean};
use rayon::prelude::*;

use crate::error::NonRigidIcpError;

/// A weighted reference to a neighboring point or control node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index of the neighbor.
    pub index: usize,
    /// Weight of the neighbor.
    pub weight: f64,
}

impl Neighbor {
    /// Create a new neighbor entry.
    pub fn new(index: usize, weight: f64) -> Self {
        Self { index, weight }
    }
}

/// The neighbors of a single query element.
pub type NeighborSet = Vec<Neighbor>;

/// Compute, for every query point, its `k` nearest reference points.
///
/// Weights follow a Gaussian kernel `exp(-d² / (2σ²))` on the distance and are
/// normalized to sum to one. If all kernel values underflow, the weights fall back to
/// uniform.
///
/// # Arguments
///
/// * `query_points` - Points to compute neighborhoods for, e.g. the source points.
/// * `reference_points` - Candidate neighbors, e.g. the control nodes.
/// * `k` - Maximum number of neighbors per query point.
/// * `sigma` - Standard deviation of the Gaussian weighting kernel.
///
/// # Returns
///
/// One neighbor set per query point, sorted by increasing distance.
pub fn knn_neighborhoods(
    query_points: &[[f64; 3]],
    reference_points: &[[f64; 3]],
    k: usize,
    sigma: f64,
) -> Vec<NeighborSet> {
    search_neighborhoods(query_points, reference_points, k, sigma, false)
}

/// Compute regularization neighborhoods between the elements of a single point set.
///
/// Same as [`knn_neighborhoods`] with `points` as both query and reference set, except
/// that each point is excluded from its own neighborhood.
pub fn regularization_neighborhoods(points: &[[f64; 3]], k: usize, sigma: f64) -> Vec<NeighborSet> {
    search_neighborhoods(points, points, k, sigma, true)
}

fn search_neighborhoods(
    query_points: &[[f64; 3]],
    reference_points: &[[f64; 3]],
    k: usize,
    sigma: f64,
    exclude_self: bool,
) -> Vec<NeighborSet> {
    if reference_points.is_empty() {
        return vec![NeighborSet::new(); query_points.len()];
    }
    let Some(num_results) = NonZeroUsize::new(if exclude_self { k + 1 } else { k }) else {
        return vec![NeighborSet::new(); query_points.len()];
    };

    let kdtree: ImmutableKdTree<f64, u32, 3, 32> =
        ImmutableKdTree::new_from_slice(reference_points);
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);

    query_points
        .par_iter()
        .enumerate()
        .map(|(i, query)| {
            let mut neighbors = kdtree
                .nearest_n::<SquaredEuclidean>(query, num_results)
                .into_iter()
                .filter(|nn| !exclude_self || nn.item as usize != i)
                .take(k)
                .map(|nn| Neighbor::new(nn.item as usize, (-nn.distance * inv_two_sigma_sq).exp()))
                .collect::<NeighborSet>();
            normalize_weights(&mut neighbors);
            neighbors
        })
        .collect()
}

/// Scale the weights so that they sum to one.
pub(crate) fn normalize_weights(neighbors: &mut [Neighbor]) {
    let total = neighbors.iter().map(|n| n.weight).sum::<f64>();
    if total > 0.0 && total.is_finite() {
        neighbors.iter_mut().for_each(|n| n.weight /= total);
    } else if !neighbors.is_empty() {
        let uniform = 1.0 / neighbors.len() as f64;
        neighbors.iter_mut().for_each(|n| n.weight = uniform);
    }
}

/// Check the shape of a list of neighborhoods.
///
/// There must be exactly `expected_len` neighborhoods and every neighbor index must be
/// below `bound`.
pub(crate) fn validate_neighborhoods(
    name: &'static str,
    neighborhoods: &[NeighborSet],
    expected_name: &'static str,
    expected_len: usize,
    bound: usize,
) -> Result<(), NonRigidIcpError> {
    crate::error::check_lengths(name, neighborhoods.len(), expected_name, expected_len)?;
    if let Some(neighbor) = neighborhoods
        .iter()
        .flatten()
        .find(|neighbor| neighbor.index >= bound)
    {
        return Err(NonRigidIcpError::NeighborIndexOutOfBounds {
            name,
            index: neighbor.index,
            bound,
        });
    }
    Ok(())
}

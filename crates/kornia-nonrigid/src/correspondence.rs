use kiddo::{immutable::float::kdtree::ImmutableKdTree, SquaredEuclidean};
use rayon::prelude::*;

use crate::transform::RigidTransformSet;

/// A match between a source point and a destination point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index of the source point.
    pub src_index: usize,
    /// Index of the destination point.
    pub dst_index: usize,
    /// Squared distance between the warped source point and the destination point.
    pub value: f64,
}

impl Correspondence {
    /// Create a new correspondence.
    pub fn new(src_index: usize, dst_index: usize, value: f64) -> Self {
        Self {
            src_index,
            dst_index,
            value,
        }
    }
}

/// Search for correspondences between a warped source set and a destination set.
///
/// Implementations must be deterministic for a fixed transform field.
pub trait CorrespondenceSearch {
    /// Find the correspondences for the source points warped by `transforms`.
    ///
    /// `transforms` holds one transformation per source point. The previous content of
    /// `correspondences` is discarded.
    fn find_correspondences(
        &mut self,
        transforms: &RigidTransformSet,
        correspondences: &mut Vec<Correspondence>,
    );
}

/// Nearest neighbor correspondence search backed by a kd-tree over the destination points.
///
/// Each warped source point is matched with its closest destination point. Pairs further
/// apart than the maximum distance are rejected.
pub struct KdTreeCorrespondenceSearch<'a> {
    src_points: &'a [[f64; 3]],
    // None when the destination set is empty
    kdtree: Option<ImmutableKdTree<f64, u32, 3, 32>>,
    max_distance_squared: f64,
    src_points_trans: Vec<[f64; 3]>,
}

impl<'a> KdTreeCorrespondenceSearch<'a> {
    /// Build the search structure over the destination points.
    ///
    /// # Arguments
    ///
    /// * `dst_points` - Destination point set.
    /// * `src_points` - Source point set, warped on every query.
    pub fn new(dst_points: &[[f64; 3]], src_points: &'a [[f64; 3]]) -> Self {
        let kdtree = (!dst_points.is_empty()).then(|| ImmutableKdTree::new_from_slice(dst_points));
        Self {
            src_points,
            kdtree,
            max_distance_squared: f64::INFINITY,
            src_points_trans: vec![[0.0; 3]; src_points.len()],
        }
    }

    /// Reject correspondences further apart than `max_distance`.
    pub fn with_max_distance(mut self, max_distance: f64) -> Self {
        self.max_distance_squared = max_distance * max_distance;
        self
    }

    /// Maximum accepted distance between corresponding points.
    pub fn max_distance(&self) -> f64 {
        self.max_distance_squared.sqrt()
    }
}

impl CorrespondenceSearch for KdTreeCorrespondenceSearch<'_> {
    fn find_correspondences(
        &mut self,
        transforms: &RigidTransformSet,
        correspondences: &mut Vec<Correspondence>,
    ) {
        correspondences.clear();

        let Some(kdtree) = &self.kdtree else {
            return;
        };

        transforms.transform_points(self.src_points, &mut self.src_points_trans);

        let max_distance_squared = self.max_distance_squared;
        let matches = self
            .src_points_trans
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                let nn = kdtree.nearest_one::<SquaredEuclidean>(p);
                (nn.distance <= max_distance_squared)
                    .then(|| Correspondence::new(i, nn.item as usize, nn.distance))
            })
            .collect::<Vec<_>>();

        correspondences.extend(matches.into_iter().flatten());
    }
}

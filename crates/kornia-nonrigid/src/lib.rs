#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Matrix-free Conjugate Gradient solver.
pub mod cg;

/// Correspondences and correspondence search engines.
pub mod correspondence;

/// Dense non-rigid ICP, one transformation per source point.
pub mod dense;

/// Error types.
pub mod error;

/// The generic non-rigid ICP driver.
pub mod icp;

/// Robust losses.
pub mod losses;

/// Weighted neighborhoods and their construction.
pub mod neighbors;

/// Interpolation of sparse transformation sets.
pub mod resampling;

/// Per-point registration residuals.
pub mod residuals;

/// Sparse non-rigid ICP, one transformation per control node.
pub mod sparse;

/// Rigid transformations and transformation sets.
pub mod transform;

/// Warp field estimation.
pub mod warp_field;

mod linear_system;
mod parallel;

pub use correspondence::{Correspondence, CorrespondenceSearch, KdTreeCorrespondenceSearch};
pub use dense::DenseCombinedMetric;
pub use error::NonRigidIcpError;
pub use icp::{ICPConvergenceCriteria, NonRigidIcp, NonRigidIcpMetric, NonRigidIcpResult};
pub use neighbors::{knn_neighborhoods, regularization_neighborhoods, Neighbor, NeighborSet};
pub use resampling::resample_transformations;
pub use sparse::SparseCombinedMetric;
pub use transform::{RigidTransform, RigidTransformSet};
pub use warp_field::{
    estimate_dense_warp_field, estimate_sparse_warp_field, CombinedMetricParams,
    WarpFieldEstimate,
};

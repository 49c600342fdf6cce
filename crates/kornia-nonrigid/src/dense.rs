use crate::correspondence::{Correspondence, CorrespondenceSearch};
use crate::error::{check_lengths, NonRigidIcpError};
use crate::icp::{NonRigidIcp, NonRigidIcpMetric};
use crate::neighbors::{validate_neighborhoods, NeighborSet};
use crate::residuals::combined_residuals;
use crate::transform::RigidTransformSet;
use crate::warp_field::{estimate_dense_warp_field, CombinedMetricParams};

/// Combined point-to-point and point-to-plane metric with one transformation per
/// source point.
pub struct DenseCombinedMetric<'a, C: CorrespondenceSearch> {
    dst_points: &'a [[f64; 3]],
    dst_normals: &'a [[f64; 3]],
    src_points: &'a [[f64; 3]],
    regularization_neighborhoods: &'a [NeighborSet],
    correspondence_search: &'a mut C,
    params: CombinedMetricParams,
    src_points_trans: Vec<[f64; 3]>,
}

impl<'a, C: CorrespondenceSearch> DenseCombinedMetric<'a, C> {
    /// Create the metric.
    ///
    /// # Arguments
    ///
    /// * `dst_points` - Destination points.
    /// * `dst_normals` - Unit normals of the destination points.
    /// * `src_points` - Source points.
    /// * `regularization_neighborhoods` - Stiffness neighbors of every source point.
    /// * `correspondence_search` - Engine matching warped source points to destination points.
    ///
    /// # Errors
    ///
    /// Fails on mismatched array lengths or out of bounds neighbor indices.
    pub fn new(
        dst_points: &'a [[f64; 3]],
        dst_normals: &'a [[f64; 3]],
        src_points: &'a [[f64; 3]],
        regularization_neighborhoods: &'a [NeighborSet],
        correspondence_search: &'a mut C,
    ) -> Result<Self, NonRigidIcpError> {
        check_lengths(
            "dst_points",
            dst_points.len(),
            "dst_normals",
            dst_normals.len(),
        )?;
        validate_neighborhoods(
            "regularization_neighborhoods",
            regularization_neighborhoods,
            "src_points",
            src_points.len(),
            src_points.len(),
        )?;

        Ok(Self {
            dst_points,
            dst_normals,
            src_points,
            regularization_neighborhoods,
            correspondence_search,
            params: CombinedMetricParams::default(),
            src_points_trans: vec![[0.0; 3]; src_points.len()],
        })
    }

    /// Metric and solver parameters.
    pub fn params(&self) -> &CombinedMetricParams {
        &self.params
    }

    /// Mutable access to the parameters.
    pub fn params_mut(&mut self) -> &mut CombinedMetricParams {
        &mut self.params
    }
}

impl<C: CorrespondenceSearch> NonRigidIcpMetric for DenseCombinedMetric<'_, C> {
    fn num_unknowns(&self) -> usize {
        self.src_points.len()
    }

    fn initialize_computation(&mut self, _transform: &RigidTransformSet) {}

    fn update_correspondences(
        &mut self,
        transform: &RigidTransformSet,
        correspondences: &mut Vec<Correspondence>,
    ) {
        self.correspondence_search
            .find_correspondences(transform, correspondences);
    }

    fn update_estimate(
        &mut self,
        transform: &mut RigidTransformSet,
        correspondences: &[Correspondence],
    ) -> f64 {
        transform.transform_points(self.src_points, &mut self.src_points_trans);

        let estimate = estimate_dense_warp_field(
            self.dst_points,
            self.dst_normals,
            &self.src_points_trans,
            correspondences,
            self.regularization_neighborhoods,
            &self.params,
        );
        log::debug!(
            "warp field: {} gauss-newton iterations, {} cg iterations",
            estimate.num_gauss_newton_iterations,
            estimate.num_conjugate_gradient_iterations
        );

        transform.pre_apply(&estimate.transforms);
        estimate.transforms.max_delta_norm()
    }

    fn compute_residuals(&self, transform: &RigidTransformSet) -> Vec<f64> {
        combined_residuals(
            self.dst_points,
            self.dst_normals,
            self.src_points,
            transform,
            self.params.point_to_point_weight,
            self.params.point_to_plane_weight,
        )
    }
}

impl<'a, C: CorrespondenceSearch> NonRigidIcp<DenseCombinedMetric<'a, C>> {
    /// Dense non-rigid ICP, estimating one transformation per source point.
    ///
    /// See [`DenseCombinedMetric::new`] for the arguments.
    pub fn dense(
        dst_points: &'a [[f64; 3]],
        dst_normals: &'a [[f64; 3]],
        src_points: &'a [[f64; 3]],
        regularization_neighborhoods: &'a [NeighborSet],
        correspondence_search: &'a mut C,
    ) -> Result<Self, NonRigidIcpError> {
        Ok(Self::new(DenseCombinedMetric::new(
            dst_points,
            dst_normals,
            src_points,
            regularization_neighborhoods,
            correspondence_search,
        )?))
    }

    /// Set the metric and solver parameters.
    pub fn with_params(mut self, params: CombinedMetricParams) -> Self {
        *self.metric_mut().params_mut() = params;
        self
    }

    /// Metric and solver parameters.
    pub fn params(&self) -> &CombinedMetricParams {
        self.metric().params()
    }

    /// Mutable access to the parameters.
    pub fn params_mut(&mut self) -> &mut CombinedMetricParams {
        self.metric_mut().params_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::KdTreeCorrespondenceSearch;
    use crate::neighbors::{regularization_neighborhoods, Neighbor};

    fn plane(n: usize) -> Vec<[f64; 3]> {
        (0..n * n)
            .map(|i| [(i / n) as f64 * 0.1, (i % n) as f64 * 0.1, 0.0])
            .collect()
    }

    #[test]
    fn test_dense_constructor_errors() {
        let points = plane(3);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let neighborhoods = regularization_neighborhoods(&points, 2, 0.1);
        let mut search = KdTreeCorrespondenceSearch::new(&points, &points);

        let result = NonRigidIcp::dense(&points, &normals[..2], &points, &neighborhoods, &mut search);
        assert!(matches!(
            result.err(),
            Some(NonRigidIcpError::MismatchedArrayLengths { .. })
        ));

        let bad = vec![vec![Neighbor::new(points.len(), 1.0)]; points.len()];
        let result = NonRigidIcp::dense(&points, &normals, &points, &bad, &mut search);
        assert!(matches!(
            result.err(),
            Some(NonRigidIcpError::NeighborIndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_dense_identity() -> Result<(), Box<dyn std::error::Error>> {
        let points = plane(4);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let neighborhoods = regularization_neighborhoods(&points, 4, 0.1);
        let mut search = KdTreeCorrespondenceSearch::new(&points, &points);

        let mut icp = NonRigidIcp::dense(&points, &normals, &points, &neighborhoods, &mut search)?
            .with_params(CombinedMetricParams::default().with_stiffness_weight(0.5));
        assert_eq!(icp.params().stiffness_weight, 0.5);

        let result = icp.estimate();
        assert_eq!(result.num_iterations, 1);
        assert!(result.converged);
        assert_eq!(icp.last_delta_norm(), 0.0);
        assert_eq!(icp.transformation(), &RigidTransformSet::identity(points.len()));
        assert!(icp.residuals().iter().all(|r| *r == 0.0));
        Ok(())
    }
}

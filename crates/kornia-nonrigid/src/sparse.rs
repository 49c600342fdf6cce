use crate::correspondence::{Correspondence, CorrespondenceSearch};
use crate::error::{check_lengths, NonRigidIcpError};
use crate::icp::{NonRigidIcp, NonRigidIcpMetric};
use crate::neighbors::{validate_neighborhoods, NeighborSet};
use crate::resampling::resample_transformations;
use crate::residuals::combined_residuals;
use crate::transform::RigidTransformSet;
use crate::warp_field::{estimate_sparse_warp_field, CombinedMetricParams};

/// Combined point-to-point and point-to-plane metric with transformations attached to
/// control nodes.
///
/// Source points follow the interpolation of their control nodes' transformations, so
/// the correspondence search always sees a dense per-point field.
pub struct SparseCombinedMetric<'a, C: CorrespondenceSearch> {
    dst_points: &'a [[f64; 3]],
    dst_normals: &'a [[f64; 3]],
    src_points: &'a [[f64; 3]],
    num_ctrl_nodes: usize,
    src_to_ctrl_neighborhoods: &'a [NeighborSet],
    ctrl_regularization_neighborhoods: &'a [NeighborSet],
    correspondence_search: &'a mut C,
    params: CombinedMetricParams,
    src_points_trans: Vec<[f64; 3]>,
    transform_dense: RigidTransformSet,
}

impl<'a, C: CorrespondenceSearch> SparseCombinedMetric<'a, C> {
    /// Create the metric.
    ///
    /// # Arguments
    ///
    /// * `dst_points` - Destination points.
    /// * `dst_normals` - Unit normals of the destination points.
    /// * `src_points` - Source points.
    /// * `num_ctrl_nodes` - Number of control nodes.
    /// * `src_to_ctrl_neighborhoods` - Control nodes of every source point.
    /// * `ctrl_regularization_neighborhoods` - Stiffness neighbors of every control node.
    /// * `correspondence_search` - Engine matching warped source points to destination points.
    ///
    /// # Errors
    ///
    /// Fails on mismatched array lengths or out of bounds neighbor indices.
    pub fn new(
        dst_points: &'a [[f64; 3]],
        dst_normals: &'a [[f64; 3]],
        src_points: &'a [[f64; 3]],
        num_ctrl_nodes: usize,
        src_to_ctrl_neighborhoods: &'a [NeighborSet],
        ctrl_regularization_neighborhoods: &'a [NeighborSet],
        correspondence_search: &'a mut C,
    ) -> Result<Self, NonRigidIcpError> {
        check_lengths(
            "dst_points",
            dst_points.len(),
            "dst_normals",
            dst_normals.len(),
        )?;
        validate_neighborhoods(
            "src_to_ctrl_neighborhoods",
            src_to_ctrl_neighborhoods,
            "src_points",
            src_points.len(),
            num_ctrl_nodes,
        )?;
        validate_neighborhoods(
            "ctrl_regularization_neighborhoods",
            ctrl_regularization_neighborhoods,
            "num_ctrl_nodes",
            num_ctrl_nodes,
            num_ctrl_nodes,
        )?;

        Ok(Self {
            dst_points,
            dst_normals,
            src_points,
            num_ctrl_nodes,
            src_to_ctrl_neighborhoods,
            ctrl_regularization_neighborhoods,
            correspondence_search,
            params: CombinedMetricParams::default(),
            src_points_trans: vec![[0.0; 3]; src_points.len()],
            transform_dense: RigidTransformSet::identity(src_points.len()),
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

    /// The per source point transformations interpolated from the control nodes.
    pub fn point_transformations(&self) -> &RigidTransformSet {
        &self.transform_dense
    }
}

impl<C: CorrespondenceSearch> NonRigidIcpMetric for SparseCombinedMetric<'_, C> {
    fn num_unknowns(&self) -> usize {
        self.num_ctrl_nodes
    }

    fn initialize_computation(&mut self, transform: &RigidTransformSet) {
        resample_transformations(
            transform,
            self.src_to_ctrl_neighborhoods,
            &mut self.transform_dense,
        );
    }

    fn update_correspondences(
        &mut self,
        _transform: &RigidTransformSet,
        correspondences: &mut Vec<Correspondence>,
    ) {
        self.correspondence_search
            .find_correspondences(&self.transform_dense, correspondences);
    }

    fn update_estimate(
        &mut self,
        transform: &mut RigidTransformSet,
        correspondences: &[Correspondence],
    ) -> f64 {
        self.transform_dense
            .transform_points(self.src_points, &mut self.src_points_trans);

        let estimate = estimate_sparse_warp_field(
            self.dst_points,
            self.dst_normals,
            &self.src_points_trans,
            correspondences,
            self.num_ctrl_nodes,
            self.src_to_ctrl_neighborhoods,
            self.ctrl_regularization_neighborhoods,
            &self.params,
        );
        log::debug!(
            "warp field: {} gauss-newton iterations, {} cg iterations",
            estimate.num_gauss_newton_iterations,
            estimate.num_conjugate_gradient_iterations
        );

        transform.pre_apply(&estimate.transforms);
        resample_transformations(
            transform,
            self.src_to_ctrl_neighborhoods,
            &mut self.transform_dense,
        );

        estimate.transforms.max_delta_norm()
    }

    fn compute_residuals(&self, transform: &RigidTransformSet) -> Vec<f64> {
        let mut transform_dense = RigidTransformSet::default();
        resample_transformations(
            transform,
            self.src_to_ctrl_neighborhoods,
            &mut transform_dense,
        );
        combined_residuals(
            self.dst_points,
            self.dst_normals,
            self.src_points,
            &transform_dense,
            self.params.point_to_point_weight,
            self.params.point_to_plane_weight,
        )
    }
}

impl<'a, C: CorrespondenceSearch> NonRigidIcp<SparseCombinedMetric<'a, C>> {
    /// Sparse non-rigid ICP, estimating one transformation per control node.
    ///
    /// See [`SparseCombinedMetric::new`] for the arguments.
    #[allow(clippy::too_many_arguments)]
    pub fn sparse(
        dst_points: &'a [[f64; 3]],
        dst_normals: &'a [[f64; 3]],
        src_points: &'a [[f64; 3]],
        num_ctrl_nodes: usize,
        src_to_ctrl_neighborhoods: &'a [NeighborSet],
        ctrl_regularization_neighborhoods: &'a [NeighborSet],
        correspondence_search: &'a mut C,
    ) -> Result<Self, NonRigidIcpError> {
        Ok(Self::new(SparseCombinedMetric::new(
            dst_points,
            dst_normals,
            src_points,
            num_ctrl_nodes,
            src_to_ctrl_neighborhoods,
            ctrl_regularization_neighborhoods,
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

    /// The per source point transformations interpolated from the control nodes.
    pub fn point_transformations(&self) -> &RigidTransformSet {
        self.metric().point_transformations()
    }
}

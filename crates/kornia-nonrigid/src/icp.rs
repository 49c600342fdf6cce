use serde::{Deserialize, Serialize};

use crate::correspondence::Correspondence;
use crate::error::NonRigidIcpError;
use crate::transform::RigidTransformSet;

/// Structure to define the ICP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ICPConvergenceCriteria {
    /// Maximum number of iterations to perform.
    pub max_iterations: usize,
    /// Convergence tolerance on the largest per-unknown update of an iteration.
    pub tolerance: f64,
}

impl Default for ICPConvergenceCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            tolerance: 1e-5,
        }
    }
}

impl ICPConvergenceCriteria {
    /// Create new convergence criteria.
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }
}

/// Summary of a registration run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonRigidIcpResult {
    /// The total number of iterations performed.
    pub num_iterations: usize,
    /// Largest per-unknown update norm of the last iteration.
    pub last_delta_norm: f64,
    /// Whether the update norm fell below the tolerance.
    pub converged: bool,
}

/// The hooks a non-rigid metric plugs into the ICP loop.
///
/// The running estimate holds one transformation per unknown and is owned by the
/// driver; everything else (input data, correspondence engine, temporaries) is owned
/// by the metric.
pub trait NonRigidIcpMetric {
    /// Number of transformations being estimated.
    fn num_unknowns(&self) -> usize;

    /// Called once at the start of every run with the initial estimate.
    fn initialize_computation(&mut self, transform: &RigidTransformSet);

    /// Rebuild the correspondences for the current estimate.
    fn update_correspondences(
        &mut self,
        transform: &RigidTransformSet,
        correspondences: &mut Vec<Correspondence>,
    );

    /// Refine the estimate in place and return the largest per-unknown update norm.
    fn update_estimate(
        &mut self,
        transform: &mut RigidTransformSet,
        correspondences: &[Correspondence],
    ) -> f64;

    /// Per source point residuals of the given estimate.
    fn compute_residuals(&self, transform: &RigidTransformSet) -> Vec<f64>;
}

/// Generic non-rigid Iterative Closest Point driver.
///
/// Alternates correspondence updates and estimate refinements until the largest update
/// of an iteration falls below the tolerance or the iteration budget is spent.
pub struct NonRigidIcp<M: NonRigidIcpMetric> {
    metric: M,
    criteria: ICPConvergenceCriteria,
    transform_init: RigidTransformSet,
    transform: RigidTransformSet,
    correspondences: Vec<Correspondence>,
    num_iterations: usize,
    last_delta_norm: f64,
}

impl<M: NonRigidIcpMetric> NonRigidIcp<M> {
    /// Create a driver around a metric, starting from identity transformations.
    pub fn new(metric: M) -> Self {
        let num_unknowns = metric.num_unknowns();
        Self {
            metric,
            criteria: ICPConvergenceCriteria::default(),
            transform_init: RigidTransformSet::identity(num_unknowns),
            transform: RigidTransformSet::identity(num_unknowns),
            correspondences: Vec::new(),
            num_iterations: 0,
            last_delta_norm: f64::INFINITY,
        }
    }

    /// Set the convergence criteria.
    pub fn with_convergence_criteria(mut self, criteria: ICPConvergenceCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Current convergence criteria.
    pub fn convergence_criteria(&self) -> &ICPConvergenceCriteria {
        &self.criteria
    }

    /// Mutable access to the convergence criteria.
    pub fn convergence_criteria_mut(&mut self) -> &mut ICPConvergenceCriteria {
        &mut self.criteria
    }

    /// Set the transformation every run starts from.
    ///
    /// # Errors
    ///
    /// Fails if `transform` does not hold one transformation per unknown.
    pub fn set_initial_transformation(
        &mut self,
        transform: RigidTransformSet,
    ) -> Result<&mut Self, NonRigidIcpError> {
        let expected = self.metric.num_unknowns();
        if transform.len() != expected {
            return Err(NonRigidIcpError::InvalidTransformationCount {
                expected,
                actual: transform.len(),
            });
        }
        self.transform_init = transform;
        Ok(self)
    }

    /// Initial transformation of every run.
    pub fn initial_transformation(&self) -> &RigidTransformSet {
        &self.transform_init
    }

    /// Run the registration from the initial transformation.
    pub fn estimate(&mut self) -> NonRigidIcpResult {
        self.transform.clone_from(&self.transform_init);
        self.num_iterations = 0;
        self.last_delta_norm = f64::INFINITY;

        self.metric.initialize_computation(&self.transform);

        while self.num_iterations < self.criteria.max_iterations {
            // NOTE: for debugging purposes, we measure the time taken for each iteration
            log::debug!("Iteration: {}", self.num_iterations);
            let now = std::time::Instant::now();

            self.metric
                .update_correspondences(&self.transform, &mut self.correspondences);
            log::debug!("Num correspondences: {}", self.correspondences.len());

            self.last_delta_norm = self
                .metric
                .update_estimate(&mut self.transform, &self.correspondences);
            self.num_iterations += 1;

            log::debug!(
                "delta norm: {:e}, elapsed: {:?}",
                self.last_delta_norm,
                now.elapsed()
            );

            if self.last_delta_norm < self.criteria.tolerance {
                log::debug!(
                    "Non-rigid ICP converged in {} iterations",
                    self.num_iterations
                );
                break;
            }
        }

        self.result()
    }

    /// Summary of the last run.
    pub fn result(&self) -> NonRigidIcpResult {
        NonRigidIcpResult {
            num_iterations: self.num_iterations,
            last_delta_norm: self.last_delta_norm,
            converged: self.has_converged(),
        }
    }

    /// The current estimate, one transformation per unknown.
    pub fn transformation(&self) -> &RigidTransformSet {
        &self.transform
    }

    /// Correspondences of the last iteration.
    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    /// Whether the last run stopped on the tolerance.
    pub fn has_converged(&self) -> bool {
        self.num_iterations > 0 && self.last_delta_norm < self.criteria.tolerance
    }

    /// Number of iterations of the last run.
    pub fn num_performed_iterations(&self) -> usize {
        self.num_iterations
    }

    /// Largest per-unknown update norm of the last iteration.
    pub fn last_delta_norm(&self) -> f64 {
        self.last_delta_norm
    }

    /// Per source point residuals of the current estimate.
    pub fn residuals(&self) -> Vec<f64> {
        self.metric.compute_residuals(&self.transform)
    }

    /// The metric driven by this instance.
    pub fn metric(&self) -> &M {
        &self.metric
    }

    /// Mutable access to the metric.
    pub fn metric_mut(&mut self) -> &mut M {
        &mut self.metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RigidTransform;
    use glam::{DMat3, DVec3};

    /// Moves every unknown by a shrinking translation along x.
    struct HalvingMetric {
        num_unknowns: usize,
        step: f64,
        initialized: usize,
    }

    impl NonRigidIcpMetric for HalvingMetric {
        fn num_unknowns(&self) -> usize {
            self.num_unknowns
        }

        fn initialize_computation(&mut self, _transform: &RigidTransformSet) {
            self.initialized += 1;
            self.step = 1.0;
        }

        fn update_correspondences(
            &mut self,
            transform: &RigidTransformSet,
            correspondences: &mut Vec<Correspondence>,
        ) {
            correspondences.clear();
            correspondences.extend((0..transform.len()).map(|i| Correspondence::new(i, i, 0.0)));
        }

        fn update_estimate(
            &mut self,
            transform: &mut RigidTransformSet,
            _correspondences: &[Correspondence],
        ) -> f64 {
            let increment = RigidTransform::new(DMat3::IDENTITY, DVec3::new(self.step, 0.0, 0.0));
            transform.pre_apply(&RigidTransformSet::from(vec![increment; transform.len()]));
            let delta = increment.delta_norm_squared().sqrt();
            self.step *= 0.5;
            delta
        }

        fn compute_residuals(&self, transform: &RigidTransformSet) -> Vec<f64> {
            transform.iter().map(|tf| tf.translation.x).collect()
        }
    }

    fn halving(num_unknowns: usize) -> NonRigidIcp<HalvingMetric> {
        NonRigidIcp::new(HalvingMetric {
            num_unknowns,
            step: 1.0,
            initialized: 0,
        })
    }

    #[test]
    fn test_driver_converges() {
        let mut icp = halving(3).with_convergence_criteria(ICPConvergenceCriteria::new(100, 0.1));
        let result = icp.estimate();

        // steps 1, 0.5, 0.25, 0.125, 0.0625
        assert_eq!(result.num_iterations, 5);
        assert!(result.converged);
        assert_eq!(result.last_delta_norm, 0.0625);
        assert_eq!(icp.correspondences().len(), 3);
        assert_eq!(icp.residuals(), vec![1.9375; 3]);
        assert_eq!(icp.metric().initialized, 1);
    }

    #[test]
    fn test_driver_iteration_cap() {
        let mut icp = halving(2).with_convergence_criteria(ICPConvergenceCriteria::new(2, 1e-9));
        let result = icp.estimate();
        assert_eq!(result.num_iterations, 2);
        assert!(!result.converged);
        assert!(!icp.has_converged());
        assert_eq!(icp.transformation()[0].translation.x, 1.5);
    }

    #[test]
    fn test_estimate_restarts_from_initial() -> Result<(), Box<dyn std::error::Error>> {
        let mut icp = halving(2).with_convergence_criteria(ICPConvergenceCriteria::new(1, 1e-9));
        let start = RigidTransform::new(DMat3::IDENTITY, DVec3::new(-1.0, 0.0, 0.0));
        icp.set_initial_transformation(RigidTransformSet::from(vec![start; 2]))?;

        icp.estimate();
        icp.estimate();

        assert_eq!(icp.num_performed_iterations(), 1);
        assert_eq!(icp.transformation()[1].translation.x, 0.0);
        assert_eq!(icp.metric().initialized, 2);
        Ok(())
    }

    #[test]
    fn test_invalid_initial_transformation() {
        let mut icp = halving(2);
        let err = icp
            .set_initial_transformation(RigidTransformSet::identity(3))
            .err();
        assert_eq!(
            err,
            Some(NonRigidIcpError::InvalidTransformationCount {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_zero_iterations() {
        let mut icp = halving(1).with_convergence_criteria(ICPConvergenceCriteria::new(0, 1e-5));
        let result = icp.estimate();
        assert_eq!(result.num_iterations, 0);
        assert!(!result.converged);
        assert_eq!(icp.transformation(), &RigidTransformSet::identity(1));
    }

    #[test]
    fn test_default_criteria() {
        let criteria = ICPConvergenceCriteria::default();
        assert_eq!(criteria.max_iterations, 15);
        assert_eq!(criteria.tolerance, 1e-5);
    }
}

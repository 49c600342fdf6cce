//! Gauss-Newton estimation of a warp field under the combined point-to-point and
//! point-to-plane metric with stiffness regularization.

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cg::ConjugateGradient;
use crate::correspondence::Correspondence;
use crate::linear_system::{JacobianBlock, NormalEquations, TermSet, DOF};
use crate::losses::HuberLoss;
use crate::neighbors::NeighborSet;
use crate::parallel::par_sum;
use crate::transform::{frobenius_norm_squared, RigidTransform, RigidTransformSet};

/// Parameters of the combined metric warp field estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedMetricParams {
    /// Weight of the point-to-point data term.
    pub point_to_point_weight: f64,
    /// Weight of the point-to-plane data term.
    pub point_to_plane_weight: f64,
    /// Weight of the stiffness regularization term.
    pub stiffness_weight: f64,
    /// Boundary of the Huber loss applied to the data residuals.
    pub huber_boundary: f64,
    /// Maximum number of Gauss-Newton iterations per estimation.
    pub max_gauss_newton_iterations: usize,
    /// Gauss-Newton stops once the largest per-unknown step norm falls below this value.
    pub gauss_newton_convergence_tol: f64,
    /// Maximum number of Conjugate Gradient iterations per Gauss-Newton step.
    pub max_conjugate_gradient_iterations: usize,
    /// Relative residual tolerance of the Conjugate Gradient solver.
    pub conjugate_gradient_convergence_tol: f64,
}

impl Default for CombinedMetricParams {
    fn default() -> Self {
        Self {
            point_to_point_weight: 0.1,
            point_to_plane_weight: 1.0,
            stiffness_weight: 1.0,
            huber_boundary: 1e-6,
            max_gauss_newton_iterations: 10,
            gauss_newton_convergence_tol: 1e-5,
            max_conjugate_gradient_iterations: 1000,
            conjugate_gradient_convergence_tol: 1e-5,
        }
    }
}

impl CombinedMetricParams {
    /// Create the default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the point-to-point weight.
    pub fn with_point_to_point_weight(mut self, weight: f64) -> Self {
        self.point_to_point_weight = weight;
        self
    }

    /// Set the point-to-plane weight.
    pub fn with_point_to_plane_weight(mut self, weight: f64) -> Self {
        self.point_to_plane_weight = weight;
        self
    }

    /// Set the stiffness regularization weight.
    pub fn with_stiffness_weight(mut self, weight: f64) -> Self {
        self.stiffness_weight = weight;
        self
    }

    /// Set the Huber loss boundary.
    pub fn with_huber_boundary(mut self, boundary: f64) -> Self {
        self.huber_boundary = boundary;
        self
    }

    /// Set the maximum number of Gauss-Newton iterations.
    pub fn with_max_gauss_newton_iterations(mut self, max_iterations: usize) -> Self {
        self.max_gauss_newton_iterations = max_iterations;
        self
    }

    /// Set the Gauss-Newton convergence tolerance.
    pub fn with_gauss_newton_convergence_tol(mut self, tol: f64) -> Self {
        self.gauss_newton_convergence_tol = tol;
        self
    }

    /// Set the maximum number of Conjugate Gradient iterations.
    pub fn with_max_conjugate_gradient_iterations(mut self, max_iterations: usize) -> Self {
        self.max_conjugate_gradient_iterations = max_iterations;
        self
    }

    /// Set the Conjugate Gradient convergence tolerance.
    pub fn with_conjugate_gradient_convergence_tol(mut self, tol: f64) -> Self {
        self.conjugate_gradient_convergence_tol = tol;
        self
    }
}

/// Result of a warp field estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpFieldEstimate {
    /// Incremental transformation of every unknown.
    pub transforms: RigidTransformSet,
    /// Number of Gauss-Newton iterations performed.
    pub num_gauss_newton_iterations: usize,
    /// Total number of Conjugate Gradient iterations over all Gauss-Newton steps.
    pub num_conjugate_gradient_iterations: usize,
    /// Objective value before the first step and after every step.
    pub cost_history: Vec<f64>,
}

/// Estimate one incremental rigid transformation per source point.
///
/// The source points are expected to be already warped by the current estimate; the
/// returned increments are meant to be left-composed with it.
///
/// PRECONDITION: `dst_points` and `dst_normals` have the same length, correspondence
/// and neighbor indices are in bounds, `regularization_neighborhoods` has one entry per
/// source point.
///
/// # Arguments
///
/// * `dst_points` - Destination points.
/// * `dst_normals` - Unit normals of the destination points.
/// * `src_points_trans` - Warped source points.
/// * `correspondences` - Correspondences between source and destination points.
/// * `regularization_neighborhoods` - Stiffness neighbors of every source point.
/// * `params` - Metric weights and solver parameters.
pub fn estimate_dense_warp_field(
    dst_points: &[[f64; 3]],
    dst_normals: &[[f64; 3]],
    src_points_trans: &[[f64; 3]],
    correspondences: &[Correspondence],
    regularization_neighborhoods: &[NeighborSet],
    params: &CombinedMetricParams,
) -> WarpFieldEstimate {
    assert_eq!(
        regularization_neighborhoods.len(),
        src_points_trans.len(),
        "One regularization neighborhood per source point is required"
    );
    let problem = WarpFieldProblem::new(
        dst_points,
        dst_normals,
        src_points_trans,
        correspondences,
        PointCoupling::identity(src_points_trans.len()),
        regularization_neighborhoods,
        src_points_trans.len(),
    );
    problem.solve(params)
}

/// Estimate one incremental rigid transformation per control node.
///
/// Every source point moves with the normalized blend of the transformations of its
/// control nodes, as listed in `src_to_ctrl_neighborhoods`. Stiffness acts between the
/// control nodes through `ctrl_regularization_neighborhoods`.
///
/// PRECONDITION: `dst_points` and `dst_normals` have the same length, correspondence
/// and neighbor indices are in bounds, there is one source-to-control neighborhood per
/// source point and one regularization neighborhood per control node.
#[allow(clippy::too_many_arguments)]
pub fn estimate_sparse_warp_field(
    dst_points: &[[f64; 3]],
    dst_normals: &[[f64; 3]],
    src_points_trans: &[[f64; 3]],
    correspondences: &[Correspondence],
    num_ctrl_nodes: usize,
    src_to_ctrl_neighborhoods: &[NeighborSet],
    ctrl_regularization_neighborhoods: &[NeighborSet],
    params: &CombinedMetricParams,
) -> WarpFieldEstimate {
    assert_eq!(
        src_to_ctrl_neighborhoods.len(),
        src_points_trans.len(),
        "One control node neighborhood per source point is required"
    );
    assert_eq!(
        ctrl_regularization_neighborhoods.len(),
        num_ctrl_nodes,
        "One regularization neighborhood per control node is required"
    );
    let problem = WarpFieldProblem::new(
        dst_points,
        dst_normals,
        src_points_trans,
        correspondences,
        PointCoupling::from_neighborhoods(src_to_ctrl_neighborhoods, num_ctrl_nodes),
        ctrl_regularization_neighborhoods,
        num_ctrl_nodes,
    );
    problem.solve(params)
}

/// Unknowns driving each source point, with normalized blending weights.
struct PointCoupling {
    offsets: Vec<usize>,
    entries: Vec<(usize, f64)>,
}

impl PointCoupling {
    fn identity(num_points: usize) -> Self {
        Self {
            offsets: (0..=num_points).collect(),
            entries: (0..num_points).map(|i| (i, 1.0)).collect(),
        }
    }

    fn from_neighborhoods(neighborhoods: &[NeighborSet], num_unknowns: usize) -> Self {
        let mut offsets = Vec::with_capacity(neighborhoods.len() + 1);
        let mut entries = Vec::new();
        offsets.push(0);
        for neighbors in neighborhoods {
            let total = neighbors.iter().map(|n| n.weight).sum::<f64>();
            // points with a degenerate neighborhood do not contribute any data term
            if total > 0.0 && total.is_finite() {
                for neighbor in neighbors {
                    assert!(
                        neighbor.index < num_unknowns,
                        "Control node index out of bounds"
                    );
                    entries.push((neighbor.index, neighbor.weight / total));
                }
            }
            offsets.push(entries.len());
        }
        Self { offsets, entries }
    }

    #[inline]
    fn of(&self, point: usize) -> &[(usize, f64)] {
        &self.entries[self.offsets[point]..self.offsets[point + 1]]
    }
}

struct WarpFieldProblem<'a> {
    dst_points: &'a [[f64; 3]],
    dst_normals: &'a [[f64; 3]],
    src_points_trans: &'a [[f64; 3]],
    correspondences: &'a [Correspondence],
    coupling: PointCoupling,
    regularization: &'a [NeighborSet],
    num_unknowns: usize,
}

impl<'a> WarpFieldProblem<'a> {
    fn new(
        dst_points: &'a [[f64; 3]],
        dst_normals: &'a [[f64; 3]],
        src_points_trans: &'a [[f64; 3]],
        correspondences: &'a [Correspondence],
        coupling: PointCoupling,
        regularization: &'a [NeighborSet],
        num_unknowns: usize,
    ) -> Self {
        assert_eq!(
            dst_points.len(),
            dst_normals.len(),
            "Destination points and normals must have the same length"
        );
        for c in correspondences {
            assert!(
                c.src_index < src_points_trans.len() && c.dst_index < dst_points.len(),
                "Correspondence index out of bounds"
            );
        }
        for neighbor in regularization.iter().flatten() {
            assert!(
                neighbor.index < num_unknowns,
                "Regularization neighbor index out of bounds"
            );
        }
        Self {
            dst_points,
            dst_normals,
            src_points_trans,
            correspondences,
            coupling,
            regularization,
            num_unknowns,
        }
    }

    fn solve(&self, params: &CombinedMetricParams) -> WarpFieldEstimate {
        let huber = HuberLoss::new(params.huber_boundary);
        let solver = ConjugateGradient::new(
            params.max_conjugate_gradient_iterations,
            params.conjugate_gradient_convergence_tol,
        );

        let mut transforms = RigidTransformSet::identity(self.num_unknowns);
        let mut cost_history = vec![self.cost(&transforms, &huber, params)];
        let mut num_gauss_newton_iterations = 0;
        let mut num_conjugate_gradient_iterations = 0;
        let mut step = vec![0.0; self.num_unknowns * DOF];

        while num_gauss_newton_iterations < params.max_gauss_newton_iterations {
            let system = self.linearize(&transforms, &huber, params);

            step.fill(0.0);
            let summary = solver.solve(&system, &system.rhs(), &mut step);
            num_conjugate_gradient_iterations += summary.num_iterations;

            transforms
                .par_iter_mut()
                .zip(step.par_chunks(DOF))
                .for_each(|(tf, x)| {
                    let increment = RigidTransform::from_twist(
                        DVec3::new(x[0], x[1], x[2]),
                        DVec3::new(x[3], x[4], x[5]),
                    );
                    *tf = increment.compose(tf);
                });
            num_gauss_newton_iterations += 1;

            let cost = self.cost(&transforms, &huber, params);
            cost_history.push(cost);

            let max_step_norm = step
                .par_chunks(DOF)
                .map(|x| x.iter().map(|v| v * v).sum::<f64>())
                .reduce(|| 0.0, f64::max)
                .sqrt();

            log::debug!(
                "gauss-newton iteration {}: cost {:.6e}, max step {:.3e}, cg iterations {}",
                num_gauss_newton_iterations,
                cost,
                max_step_norm,
                summary.num_iterations
            );

            if max_step_norm < params.gauss_newton_convergence_tol {
                break;
            }
        }

        WarpFieldEstimate {
            transforms,
            num_gauss_newton_iterations,
            num_conjugate_gradient_iterations,
            cost_history,
        }
    }

    /// Warped source point for the current increments.
    fn warped_point(&self, transforms: &RigidTransformSet, src_index: usize) -> Option<DVec3> {
        let coupling = self.coupling.of(src_index);
        if coupling.is_empty() {
            return None;
        }
        let q = DVec3::from_array(self.src_points_trans[src_index]);
        Some(
            coupling
                .iter()
                .map(|&(k, w)| w * transforms[k].transform_vec3(q))
                .sum(),
        )
    }

    fn linearize(
        &self,
        transforms: &RigidTransformSet,
        huber: &HuberLoss,
        params: &CombinedMetricParams,
    ) -> NormalEquations {
        let data_terms = self
            .correspondences
            .par_iter()
            .filter_map(|c| self.data_term(transforms, c, huber, params))
            .collect::<Vec<_>>();
        let mut data = TermSet::<4>::with_capacity(data_terms.len());
        for (residual, blocks) in data_terms {
            data.push(residual, blocks);
        }

        let mut stiffness = TermSet::<12>::default();
        if params.stiffness_weight > 0.0 {
            let frames = transforms
                .par_iter()
                .map(|tf| (frame_vector(tf), frame_jacobian(tf)))
                .collect::<Vec<_>>();
            let edges = self
                .regularization
                .par_iter()
                .enumerate()
                .flat_map_iter(|(i, neighbors)| {
                    let frames = &frames;
                    neighbors
                        .iter()
                        .filter(move |n| n.index != i && n.weight > 0.0)
                        .map(move |n| {
                            let k = n.index;
                            let scale = (params.stiffness_weight * n.weight).sqrt();
                            let (vi, ji) = &frames[i];
                            let (vk, jk) = &frames[k];
                            let mut residual = [0.0; 12];
                            for (r, (a, b)) in residual.iter_mut().zip(vi.iter().zip(vk)) {
                                *r = -scale * (a - b);
                            }
                            (
                                residual,
                                [(i, scale_block(ji, scale)), (k, scale_block(jk, -scale))],
                            )
                        })
                })
                .collect::<Vec<_>>();
            stiffness = TermSet::with_capacity(edges.len());
            for (residual, blocks) in edges {
                stiffness.push(residual, blocks);
            }
        }

        NormalEquations::new(self.num_unknowns, data, stiffness)
    }

    /// Residual `d − p` (3 rows) and `n·(d − p)` (1 row), IRLS weighted.
    fn data_term(
        &self,
        transforms: &RigidTransformSet,
        c: &Correspondence,
        huber: &HuberLoss,
        params: &CombinedMetricParams,
    ) -> Option<([f64; 4], Vec<(usize, JacobianBlock<4>)>)> {
        let p = self.warped_point(transforms, c.src_index)?;
        let d = DVec3::from_array(self.dst_points[c.dst_index]);
        let n = DVec3::from_array(self.dst_normals[c.dst_index]);
        let e = d - p;
        let e_plane = n.dot(e);

        let point_scale = (params.point_to_point_weight * huber.weight(e.length())).sqrt();
        let plane_scale = (params.point_to_plane_weight * huber.weight(e_plane)).sqrt();
        let residual = [
            point_scale * e.x,
            point_scale * e.y,
            point_scale * e.z,
            plane_scale * e_plane,
        ];

        let q = DVec3::from_array(self.src_points_trans[c.src_index]);
        let blocks = self
            .coupling
            .of(c.src_index)
            .iter()
            .map(|&(k, w)| {
                let point = transforms[k].transform_vec3(q);
                let rows = point_jacobian(point);
                let mut block = [[0.0; DOF]; 4];
                for (out, row) in block.iter_mut().zip(rows.iter()) {
                    for (o, j) in out.iter_mut().zip(row) {
                        *o = point_scale * w * j;
                    }
                }
                for j in 0..DOF {
                    block[3][j] =
                        plane_scale * w * (n.x * rows[0][j] + n.y * rows[1][j] + n.z * rows[2][j]);
                }
                (k, block)
            })
            .collect();

        Some((residual, blocks))
    }

    /// Objective value for the given increments.
    fn cost(
        &self,
        transforms: &RigidTransformSet,
        huber: &HuberLoss,
        params: &CombinedMetricParams,
    ) -> f64 {
        let data = par_sum(self.correspondences, |_, c| {
            let Some(p) = self.warped_point(transforms, c.src_index) else {
                return 0.0;
            };
            let d = DVec3::from_array(self.dst_points[c.dst_index]);
            let n = DVec3::from_array(self.dst_normals[c.dst_index]);
            let e = d - p;
            params.point_to_point_weight * huber.loss(e.length())
                + params.point_to_plane_weight * huber.loss(n.dot(e))
        });

        let stiffness = if params.stiffness_weight > 0.0 {
            par_sum(self.regularization, |i, neighbors| {
                neighbors
                    .iter()
                    .filter(|n| n.index != i && n.weight > 0.0)
                    .map(|n| {
                        let a = &transforms[i];
                        let b = &transforms[n.index];
                        n.weight
                            * (frobenius_norm_squared(&(a.linear - b.linear))
                                + (a.translation - b.translation).length_squared())
                    })
                    .sum::<f64>()
            })
        } else {
            0.0
        };

        data + params.stiffness_weight * stiffness
    }
}

/// Derivative of a warped point under a left-multiplicative increment `(ω, v)`:
/// `[-[q]× | I]`.
fn point_jacobian(q: DVec3) -> [[f64; DOF]; 3] {
    [
        [0.0, q.z, -q.y, 1.0, 0.0, 0.0],
        [-q.z, 0.0, q.x, 0.0, 1.0, 0.0],
        [q.y, -q.x, 0.0, 0.0, 0.0, 1.0],
    ]
}

/// The rotation columns followed by the translation.
fn frame_vector(tf: &RigidTransform) -> [f64; 12] {
    let mut v = [0.0; 12];
    v[..9].copy_from_slice(&tf.linear.to_cols_array());
    v[9..].copy_from_slice(&tf.translation.to_array());
    v
}

/// Derivative of [`frame_vector`] under a left-multiplicative increment.
fn frame_jacobian(tf: &RigidTransform) -> JacobianBlock<12> {
    let mut block = [[0.0; DOF]; 12];
    let columns = [tf.linear.x_axis, tf.linear.y_axis, tf.linear.z_axis];
    for (c, column) in columns.iter().enumerate() {
        let rows = point_jacobian(*column);
        for r in 0..3 {
            block[3 * c + r][..3].copy_from_slice(&rows[r][..3]);
        }
    }
    let rows = point_jacobian(tf.translation);
    block[9..].copy_from_slice(&rows);
    block
}

fn scale_block<const R: usize>(block: &JacobianBlock<R>, scale: f64) -> JacobianBlock<R> {
    let mut out = *block;
    out.iter_mut().flatten().for_each(|v| *v *= scale);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbors::{regularization_neighborhoods, Neighbor};
    use approx::assert_relative_eq;

    fn grid(n: usize) -> Vec<[f64; 3]> {
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let (x, y) = (i as f64 * 0.1, j as f64 * 0.1);
                points.push([x, y, 0.05 * (x * 3.0).sin() + 0.03 * (y * 2.0).cos()]);
            }
        }
        points
    }

    fn identity_correspondences(n: usize) -> Vec<Correspondence> {
        (0..n).map(|i| Correspondence::new(i, i, 0.0)).collect()
    }

    #[test]
    fn test_params_builder() {
        let params = CombinedMetricParams::new()
            .with_point_to_point_weight(0.5)
            .with_point_to_plane_weight(2.0)
            .with_stiffness_weight(0.0)
            .with_huber_boundary(1.0)
            .with_max_gauss_newton_iterations(3)
            .with_gauss_newton_convergence_tol(1e-3)
            .with_max_conjugate_gradient_iterations(50)
            .with_conjugate_gradient_convergence_tol(1e-8);
        assert_eq!(params.point_to_point_weight, 0.5);
        assert_eq!(params.point_to_plane_weight, 2.0);
        assert_eq!(params.stiffness_weight, 0.0);
        assert_eq!(params.huber_boundary, 1.0);
        assert_eq!(params.max_gauss_newton_iterations, 3);
        assert_eq!(params.gauss_newton_convergence_tol, 1e-3);
        assert_eq!(params.max_conjugate_gradient_iterations, 50);
        assert_eq!(params.conjugate_gradient_convergence_tol, 1e-8);

        let default = CombinedMetricParams::default();
        assert_eq!(default.max_gauss_newton_iterations, 10);
        assert_eq!(default.huber_boundary, 1e-6);
    }

    #[test]
    fn test_point_jacobian_matches_finite_differences() {
        let q = DVec3::new(0.3, -1.2, 0.7);
        let rows = point_jacobian(q);
        let h = 1e-7;
        for j in 0..DOF {
            let mut x = [0.0; DOF];
            x[j] = h;
            let inc = RigidTransform::from_twist(
                DVec3::new(x[0], x[1], x[2]),
                DVec3::new(x[3], x[4], x[5]),
            );
            let diff = (inc.transform_vec3(q) - q) / h;
            for r in 0..3 {
                assert_relative_eq!(rows[r][j], diff[r], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_frame_jacobian_matches_finite_differences() {
        let tf = RigidTransform::from_axis_angle(&[0.2, 1.0, -0.4], 0.6, &[1.0, -0.5, 2.0]);
        let block = frame_jacobian(&tf);
        let base = frame_vector(&tf);
        let h = 1e-7;
        for j in 0..DOF {
            let mut x = [0.0; DOF];
            x[j] = h;
            let inc = RigidTransform::from_twist(
                DVec3::new(x[0], x[1], x[2]),
                DVec3::new(x[3], x[4], x[5]),
            );
            let moved = frame_vector(&inc.compose(&tf));
            for r in 0..12 {
                assert_relative_eq!(block[r][j], (moved[r] - base[r]) / h, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_dense_identity_is_stable() {
        let points = grid(5);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let neighborhoods = regularization_neighborhoods(&points, 4, 0.1);
        let estimate = estimate_dense_warp_field(
            &points,
            &normals,
            &points,
            &identity_correspondences(points.len()),
            &neighborhoods,
            &CombinedMetricParams::default(),
        );

        assert_eq!(estimate.transforms.len(), points.len());
        assert_eq!(estimate.num_gauss_newton_iterations, 1);
        assert_eq!(estimate.num_conjugate_gradient_iterations, 0);
        assert_eq!(estimate.transforms.max_delta_norm(), 0.0);
        assert_eq!(estimate.cost_history, vec![0.0, 0.0]);
    }

    #[test]
    fn test_dense_translation_without_stiffness() {
        let points = grid(4);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let shifted = points
            .iter()
            .map(|p| [p[0] + 0.01, p[1] - 0.02, p[2] + 0.03])
            .collect::<Vec<_>>();
        let neighborhoods = vec![NeighborSet::new(); points.len()];
        let params = CombinedMetricParams::default()
            .with_stiffness_weight(0.0)
            .with_huber_boundary(10.0)
            .with_gauss_newton_convergence_tol(1e-10)
            .with_conjugate_gradient_convergence_tol(1e-12);

        let estimate = estimate_dense_warp_field(
            &shifted,
            &normals,
            &points,
            &identity_correspondences(points.len()),
            &neighborhoods,
            &params,
        );

        for (tf, (src, dst)) in estimate.transforms.iter().zip(points.iter().zip(&shifted)) {
            let warped = tf.transform_point(src);
            for i in 0..3 {
                assert_relative_eq!(warped[i], dst[i], epsilon = 1e-8);
            }
        }
        let last = estimate.cost_history.last().copied().unwrap_or(f64::NAN);
        assert!(last < 1e-12);
    }

    #[test]
    fn test_regularization_only() {
        // without data terms the stiffness residuals of identity increments vanish
        let points = grid(3);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let neighborhoods = regularization_neighborhoods(&points, 3, 0.1);
        let estimate = estimate_dense_warp_field(
            &points,
            &normals,
            &points,
            &[],
            &neighborhoods,
            &CombinedMetricParams::default(),
        );
        assert_eq!(estimate.transforms, RigidTransformSet::identity(points.len()));
    }

    #[test]
    fn test_sparse_single_node_translation() {
        let points = grid(4);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let shifted = points
            .iter()
            .map(|p| [p[0] - 0.02, p[1], p[2] + 0.01])
            .collect::<Vec<_>>();
        let src_to_ctrl = vec![vec![Neighbor::new(0, 0.3)]; points.len()];
        let ctrl_regularization = vec![NeighborSet::new()];
        let params = CombinedMetricParams::default()
            .with_huber_boundary(10.0)
            .with_gauss_newton_convergence_tol(1e-10)
            .with_conjugate_gradient_convergence_tol(1e-12);

        let estimate = estimate_sparse_warp_field(
            &shifted,
            &normals,
            &points,
            &identity_correspondences(points.len()),
            1,
            &src_to_ctrl,
            &ctrl_regularization,
            &params,
        );

        assert_eq!(estimate.transforms.len(), 1);
        let tf = estimate.transforms[0];
        assert!(tf.rotation_angle() < 1e-8);
        assert_relative_eq!(tf.translation.x, -0.02, epsilon = 1e-8);
        assert_relative_eq!(tf.translation.y, 0.0, epsilon = 1e-8);
        assert_relative_eq!(tf.translation.z, 0.01, epsilon = 1e-8);
    }

    #[test]
    fn test_iteration_caps() {
        let points = grid(4);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        let target = points
            .iter()
            .map(|p| [p[0] + 0.1, p[1], p[2]])
            .collect::<Vec<_>>();
        let neighborhoods = regularization_neighborhoods(&points, 4, 0.1);
        let params = CombinedMetricParams::default()
            .with_max_gauss_newton_iterations(1)
            .with_max_conjugate_gradient_iterations(1);

        let estimate = estimate_dense_warp_field(
            &target,
            &normals,
            &points,
            &identity_correspondences(points.len()),
            &neighborhoods,
            &params,
        );
        assert_eq!(estimate.transforms.len(), points.len());
        assert_eq!(estimate.num_gauss_newton_iterations, 1);
        assert!(estimate.num_conjugate_gradient_iterations <= 1);
        assert_eq!(estimate.cost_history.len(), 2);
        assert!(estimate
            .transforms
            .iter()
            .all(|tf| tf.linear.is_finite() && tf.translation.is_finite()));
    }

    #[test]
    #[should_panic(expected = "Correspondence index out of bounds")]
    fn test_out_of_bounds_correspondence() {
        let points = grid(2);
        let normals = vec![[0.0, 0.0, 1.0]; points.len()];
        estimate_dense_warp_field(
            &points,
            &normals,
            &points,
            &[Correspondence::new(0, 10, 0.0)],
            &vec![NeighborSet::new(); points.len()],
            &CombinedMetricParams::default(),
        );
    }
}

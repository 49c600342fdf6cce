//! Matrix-free preconditioned Conjugate Gradient.

use rayon::prelude::*;

use crate::parallel::{par_axpy, par_dot};

/// A symmetric positive (semi-)definite linear operator.
pub trait LinearOperator: Sync {
    /// Number of rows and columns of the operator.
    fn dim(&self) -> usize;

    /// Compute `y = A * x`. `y` is fully overwritten.
    fn apply(&self, x: &[f64], y: &mut [f64]);

    /// Diagonal of the operator, used as Jacobi preconditioner.
    fn diagonal(&self) -> Vec<f64>;
}

/// Parameters of the Conjugate Gradient solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConjugateGradient {
    /// Maximum number of iterations.
    pub max_iterations: usize,
    /// Convergence tolerance on the relative residual `‖b − Ax‖ / ‖b‖`.
    pub tolerance: f64,
}

/// Outcome of a Conjugate Gradient solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConjugateGradientSummary {
    /// Number of iterations performed.
    pub num_iterations: usize,
    /// Relative residual of the returned solution.
    pub relative_residual: f64,
    /// Whether the tolerance was reached.
    pub converged: bool,
}

impl ConjugateGradient {
    /// Create a new solver.
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    /// Solve `A x = b`, using the content of `x` as initial guess.
    ///
    /// Reaching the iteration cap is not an error: `x` then holds the last iterate.
    /// Directions of zero or negative curvature stop the iteration, which keeps singular
    /// but consistent systems finite.
    pub fn solve<A: LinearOperator>(
        &self,
        op: &A,
        b: &[f64],
        x: &mut [f64],
    ) -> ConjugateGradientSummary {
        let n = op.dim();
        assert_eq!(b.len(), n);
        assert_eq!(x.len(), n);

        let b_norm = par_dot(b, b).sqrt();
        if b_norm == 0.0 {
            x.fill(0.0);
            return ConjugateGradientSummary {
                num_iterations: 0,
                relative_residual: 0.0,
                converged: true,
            };
        }

        // Jacobi preconditioner, unknowns without any term keep a unit scale
        let inv_diag = op
            .diagonal()
            .into_iter()
            .map(|d| if d > f64::EPSILON { 1.0 / d } else { 1.0 })
            .collect::<Vec<_>>();

        // r = b - A x
        let mut residual = vec![0.0; n];
        op.apply(x, &mut residual);
        residual
            .par_iter_mut()
            .zip(b.par_iter())
            .for_each(|(r, bi)| *r = bi - *r);

        let mut z = precondition(&inv_diag, &residual);
        let mut direction = z.clone();
        let mut rz = par_dot(&residual, &z);
        let mut a_direction = vec![0.0; n];

        let threshold = self.tolerance * b_norm;
        let mut residual_norm = par_dot(&residual, &residual).sqrt();
        let mut num_iterations = 0;

        while num_iterations < self.max_iterations && residual_norm > threshold {
            op.apply(&direction, &mut a_direction);
            let curvature = par_dot(&direction, &a_direction);
            if !(curvature > 0.0 && curvature.is_finite()) {
                log::trace!("cg: stopping on non-positive curvature {curvature}");
                break;
            }

            let alpha = rz / curvature;
            par_axpy(alpha, &direction, x);
            par_axpy(-alpha, &a_direction, &mut residual);
            num_iterations += 1;

            residual_norm = par_dot(&residual, &residual).sqrt();
            if residual_norm <= threshold {
                break;
            }

            z = precondition(&inv_diag, &residual);
            let rz_new = par_dot(&residual, &z);
            let beta = rz_new / rz;
            rz = rz_new;
            direction
                .par_iter_mut()
                .zip(z.par_iter())
                .for_each(|(d, zi)| *d = zi + beta * *d);
        }

        let relative_residual = residual_norm / b_norm;
        let converged = residual_norm <= threshold;
        if !converged {
            log::trace!(
                "cg: no convergence after {num_iterations} iterations, relative residual {relative_residual:e}"
            );
        }

        ConjugateGradientSummary {
            num_iterations,
            relative_residual,
            converged,
        }
    }
}

fn precondition(inv_diag: &[f64], residual: &[f64]) -> Vec<f64> {
    residual
        .par_iter()
        .zip(inv_diag.par_iter())
        .map(|(r, d)| r * d)
        .collect()
}

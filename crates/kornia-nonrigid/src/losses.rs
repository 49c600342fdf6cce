//! Robust loss used to reweight the data residuals.

/// Huber loss: quadratic below the boundary, linear above it.
///
/// The loss is scaled so that it matches the squared residual in its quadratic region:
/// `ρ(r) = r²` for `|r| <= δ` and `ρ(r) = 2δ|r| − δ²` otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HuberLoss {
    /// Boundary between the quadratic and the linear region.
    pub boundary: f64,
}

impl HuberLoss {
    /// Create a new Huber loss with the given boundary.
    pub fn new(boundary: f64) -> Self {
        Self { boundary }
    }

    /// Iteratively reweighted least squares weight for a residual magnitude.
    ///
    /// Returns `min(1, δ / |r|)`, which never divides by zero.
    #[inline]
    pub fn weight(&self, residual: f64) -> f64 {
        let residual = residual.abs();
        if residual <= self.boundary {
            1.0
        } else {
            self.boundary / residual
        }
    }

    /// Loss value for a residual magnitude.
    #[inline]
    pub fn loss(&self, residual: f64) -> f64 {
        let residual = residual.abs();
        if residual <= self.boundary {
            residual * residual
        } else {
            2.0 * self.boundary * residual - self.boundary * self.boundary
        }
    }
}

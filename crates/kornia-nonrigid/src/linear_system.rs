//! Block-sparse Gauss-Newton normal equations `JᵀJ x = Jᵀr`.
//!
//! The Jacobian is never assembled. Residuals are grouped in terms (one per
//! correspondence or per regularization edge), each term touching a few unknowns
//! through a `R x 6` Jacobian block. Products with `JᵀJ` are computed term-wise and
//! gathered per unknown through an incidence index, so every unknown is written by a
//! single task.

use std::ops::Range;

use rayon::prelude::*;

use crate::cg::LinearOperator;

/// Degrees of freedom of a rigid increment: rotation vector then translation.
pub(crate) const DOF: usize = 6;

/// Jacobian of an `R` dimensional residual with respect to one rigid increment.
pub(crate) type JacobianBlock<const R: usize> = [[f64; DOF]; R];

#[derive(Debug, Clone)]
struct TermEntry<const R: usize> {
    term: usize,
    unknown: usize,
    jacobian: JacobianBlock<R>,
}

#[derive(Debug, Clone)]
struct Term<const R: usize> {
    residual: [f64; R],
    entries: Range<usize>,
}

/// A collection of residual terms of dimension `R`, already scaled by the square root
/// of their weights.
#[derive(Debug, Clone, Default)]
pub(crate) struct TermSet<const R: usize> {
    terms: Vec<Term<R>>,
    entries: Vec<TermEntry<R>>,
}

impl<const R: usize> TermSet<R> {
    pub fn with_capacity(num_terms: usize) -> Self {
        Self {
            terms: Vec::with_capacity(num_terms),
            entries: Vec::with_capacity(num_terms),
        }
    }

    /// Add a term with its residual and the Jacobian blocks of the unknowns it touches.
    pub fn push(
        &mut self,
        residual: [f64; R],
        blocks: impl IntoIterator<Item = (usize, JacobianBlock<R>)>,
    ) {
        let term = self.terms.len();
        let start = self.entries.len();
        self.entries
            .extend(blocks.into_iter().map(|(unknown, jacobian)| TermEntry {
                term,
                unknown,
                jacobian,
            }));
        self.terms.push(Term {
            residual,
            entries: start..self.entries.len(),
        });
    }

    /// `J x` for every term.
    fn multiply(&self, x: &[f64]) -> Vec<[f64; R]> {
        self.terms
            .par_iter()
            .map(|term| {
                let mut out = [0.0; R];
                for entry in &self.entries[term.entries.clone()] {
                    let xk = &x[entry.unknown * DOF..(entry.unknown + 1) * DOF];
                    for (o, row) in out.iter_mut().zip(entry.jacobian.iter()) {
                        *o += row.iter().zip(xk).map(|(j, v)| j * v).sum::<f64>();
                    }
                }
                out
            })
            .collect()
    }

    fn residuals(&self) -> Vec<[f64; R]> {
        self.terms.iter().map(|term| term.residual).collect()
    }
}

/// Entry indices of a term set grouped by unknown (compressed rows).
#[derive(Debug, Clone)]
struct Incidence {
    offsets: Vec<usize>,
    entries: Vec<usize>,
}

impl Incidence {
    fn new<const R: usize>(set: &TermSet<R>, num_unknowns: usize) -> Self {
        let mut offsets = vec![0; num_unknowns + 1];
        for entry in &set.entries {
            offsets[entry.unknown + 1] += 1;
        }
        for k in 0..num_unknowns {
            offsets[k + 1] += offsets[k];
        }

        let mut cursor = offsets.clone();
        let mut entries = vec![0; set.entries.len()];
        for (i, entry) in set.entries.iter().enumerate() {
            entries[cursor[entry.unknown]] = i;
            cursor[entry.unknown] += 1;
        }

        Self { offsets, entries }
    }

    #[inline]
    fn of(&self, unknown: usize) -> &[usize] {
        &self.entries[self.offsets[unknown]..self.offsets[unknown + 1]]
    }
}

/// A term set together with its incidence index.
#[derive(Debug, Clone)]
struct IndexedTermSet<const R: usize> {
    set: TermSet<R>,
    incidence: Incidence,
}

impl<const R: usize> IndexedTermSet<R> {
    fn new(set: TermSet<R>, num_unknowns: usize) -> Self {
        let incidence = Incidence::new(&set, num_unknowns);
        Self { set, incidence }
    }

    /// `out += Σ_e J_eᵀ values[term(e)]` over the entries of `unknown`.
    fn accumulate_transpose(&self, unknown: usize, values: &[[f64; R]], out: &mut [f64]) {
        for &e in self.incidence.of(unknown) {
            let entry = &self.set.entries[e];
            let value = &values[entry.term];
            for (row, v) in entry.jacobian.iter().zip(value.iter()) {
                for (o, j) in out.iter_mut().zip(row.iter()) {
                    *o += j * v;
                }
            }
        }
    }

    fn accumulate_diagonal(&self, unknown: usize, out: &mut [f64]) {
        for &e in self.incidence.of(unknown) {
            for row in self.set.entries[e].jacobian.iter() {
                for (o, j) in out.iter_mut().zip(row.iter()) {
                    *o += j * j;
                }
            }
        }
    }
}

/// Normal equations of the data (point-to-point + point-to-plane) and stiffness terms.
#[derive(Debug, Clone)]
pub(crate) struct NormalEquations {
    num_unknowns: usize,
    data: IndexedTermSet<4>,
    stiffness: IndexedTermSet<12>,
}

impl NormalEquations {
    pub fn new(num_unknowns: usize, data: TermSet<4>, stiffness: TermSet<12>) -> Self {
        Self {
            num_unknowns,
            data: IndexedTermSet::new(data, num_unknowns),
            stiffness: IndexedTermSet::new(stiffness, num_unknowns),
        }
    }

    /// Right hand side `Jᵀr`.
    pub fn rhs(&self) -> Vec<f64> {
        let data_residuals = self.data.set.residuals();
        let stiffness_residuals = self.stiffness.set.residuals();
        let mut rhs = vec![0.0; self.num_unknowns * DOF];
        rhs.par_chunks_mut(DOF).enumerate().for_each(|(k, out)| {
            self.data.accumulate_transpose(k, &data_residuals, out);
            self.stiffness
                .accumulate_transpose(k, &stiffness_residuals, out);
        });
        rhs
    }
}

impl LinearOperator for NormalEquations {
    fn dim(&self) -> usize {
        self.num_unknowns * DOF
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let data_products = self.data.set.multiply(x);
        let stiffness_products = self.stiffness.set.multiply(x);
        y.par_chunks_mut(DOF).enumerate().for_each(|(k, out)| {
            out.fill(0.0);
            self.data.accumulate_transpose(k, &data_products, out);
            self.stiffness
                .accumulate_transpose(k, &stiffness_products, out);
        });
    }

    fn diagonal(&self) -> Vec<f64> {
        let mut diagonal = vec![0.0; self.dim()];
        diagonal
            .par_chunks_mut(DOF)
            .enumerate()
            .for_each(|(k, out)| {
                self.data.accumulate_diagonal(k, out);
                self.stiffness.accumulate_diagonal(k, out);
            });
        diagonal
    }
}

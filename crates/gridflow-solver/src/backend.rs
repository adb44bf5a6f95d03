//! Linear-solver backends behind a narrow capability trait.
//!
//! The Newton loop only ever asks "solve Ax = b for this sparse A"; which
//! factorization answers is a dependency-injection decision, not a branch
//! inside the iteration. Backends:
//!
//! - [`GaussSolver`]: dense Gaussian elimination with partial pivoting.
//! - [`FaerLu`]: dense LU via faer.
//! - [`RsparseLu`]: sparse LU via rsparse, reusing the symbolic analysis
//!   while the sparsity pattern is unchanged.

use crate::config::BackendKind;
use rsparse::{
    data::{Sprs, Symb},
    lsolve, lu, sqr, usolve,
};
use sprs::CsMat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinearSolveError {
    #[error("linear system is singular or near-singular")]
    Singular,
    #[error("dimension mismatch: matrix {rows}x{cols}, rhs {rhs}")]
    Dimension { rows: usize, cols: usize, rhs: usize },
}

/// Capability: solve Ax = b for a square sparse A.
pub trait LinearSolver: Send {
    fn solve(&mut self, matrix: &CsMat<f64>, rhs: &[f64]) -> Result<Vec<f64>, LinearSolveError>;
}

/// Build the configured backend.
pub fn backend_for(kind: BackendKind) -> Box<dyn LinearSolver> {
    match kind {
        BackendKind::Gauss => Box::new(GaussSolver),
        BackendKind::FaerLu => Box::new(FaerLu),
        BackendKind::RsparseLu => Box::new(RsparseLu::default()),
    }
}

fn check_dims(matrix: &CsMat<f64>, rhs: &[f64]) -> Result<usize, LinearSolveError> {
    let n = rhs.len();
    if matrix.rows() != n || matrix.cols() != n {
        return Err(LinearSolveError::Dimension {
            rows: matrix.rows(),
            cols: matrix.cols(),
            rhs: n,
        });
    }
    Ok(n)
}

fn to_dense(matrix: &CsMat<f64>) -> Vec<Vec<f64>> {
    let mut dense = vec![vec![0.0; matrix.cols()]; matrix.rows()];
    for (value, (row, col)) in matrix.iter() {
        dense[row][col] += *value;
    }
    dense
}

/// Dense Gaussian elimination with partial pivoting.
#[derive(Debug, Clone, Default)]
pub struct GaussSolver;

impl LinearSolver for GaussSolver {
    fn solve(&mut self, matrix: &CsMat<f64>, rhs: &[f64]) -> Result<Vec<f64>, LinearSolveError> {
        let n = check_dims(matrix, rhs)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut a = to_dense(matrix);
        let mut b = rhs.to_vec();

        for i in 0..n {
            let mut pivot = i;
            for row in i + 1..n {
                if a[row][i].abs() > a[pivot][i].abs() {
                    pivot = row;
                }
            }
            if pivot != i {
                a.swap(i, pivot);
                b.swap(i, pivot);
            }

            let diag = a[i][i];
            if diag.abs() < 1e-12 {
                return Err(LinearSolveError::Singular);
            }

            for value in a[i][i..].iter_mut() {
                *value /= diag;
            }
            b[i] /= diag;

            let pivot_segment = a[i][i..].to_vec();
            for row in 0..n {
                if row == i {
                    continue;
                }
                let factor = a[row][i];
                if factor == 0.0 {
                    continue;
                }
                for (target, &pivot) in a[row][i..].iter_mut().zip(pivot_segment.iter()) {
                    *target -= factor * pivot;
                }
                b[row] -= factor * b[i];
            }
        }

        Ok(b)
    }
}

/// Dense LU with partial pivoting via faer.
#[derive(Debug, Clone, Default)]
pub struct FaerLu;

impl LinearSolver for FaerLu {
    fn solve(&mut self, matrix: &CsMat<f64>, rhs: &[f64]) -> Result<Vec<f64>, LinearSolveError> {
        use faer::{prelude::*, solvers::PartialPivLu, Mat};

        let n = check_dims(matrix, rhs)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let dense = to_dense(matrix);
        let mat = Mat::from_fn(n, n, |i, j| dense[i][j]);
        let rhs_mat = Mat::from_fn(n, 1, |i, _| rhs[i]);
        let lu = PartialPivLu::new(mat.as_ref());
        let sol = lu.solve(&rhs_mat);

        let mut solution = Vec::with_capacity(n);
        for i in 0..n {
            solution.push(sol.read(i, 0));
        }
        if solution.iter().any(|v| !v.is_finite()) {
            return Err(LinearSolveError::Singular);
        }
        Ok(solution)
    }
}

/// Sparse LU via rsparse.
///
/// The symbolic ordering is recomputed only when the sparsity pattern
/// changes (the numeric values change every Newton iteration, the pattern
/// only on topology/structure changes).
#[derive(Default)]
pub struct RsparseLu {
    symbolic: Option<Symb>,
    pattern: Vec<usize>,
}

impl RsparseLu {
    fn pattern_of(a: &CsMat<f64>) -> Vec<usize> {
        let n = a.cols();
        let mut pattern = Vec::with_capacity(n + 1 + a.nnz());
        for i in 0..=n {
            pattern.push(a.indptr().index(i));
        }
        pattern.extend_from_slice(a.indices());
        pattern
    }
}

impl LinearSolver for RsparseLu {
    fn solve(&mut self, matrix: &CsMat<f64>, rhs: &[f64]) -> Result<Vec<f64>, LinearSolveError> {
        let n = check_dims(matrix, rhs)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let csc = matrix.to_csc();
        let indptr: Vec<isize> = (0..=n).map(|i| csc.indptr().index(i) as isize).collect();
        let a = Sprs {
            m: n,
            n,
            i: csc.indices().to_vec(),
            p: indptr,
            x: csc.data().to_vec(),
            nzmax: csc.data().len(),
        };

        let pattern = Self::pattern_of(&csc);
        if self.symbolic.is_none() || self.pattern != pattern {
            self.symbolic = Some(sqr(&a, 1, false));
            self.pattern = pattern;
        }
        let symb = self.symbolic.as_mut().expect("symbolic analysis present");

        let numeric = lu(&a, symb, 1e-6).map_err(|_| LinearSolveError::Singular)?;

        let mut x = vec![0.0; n];
        let mut out = vec![0.0; n];
        ipvec(&numeric.pinv, rhs, &mut x); // x = P*b
        lsolve(&numeric.l, &mut x); // x = L\x
        usolve(&numeric.u, &mut x); // x = U\x
        ipvec(&symb.q, &x, &mut out); // out = Q*x
        if out.iter().any(|v| !v.is_finite()) {
            return Err(LinearSolveError::Singular);
        }
        Ok(out)
    }
}

fn ipvec(p: &Option<Vec<isize>>, b: &[f64], x: &mut [f64]) {
    match p {
        Some(pvec) => {
            for k in 0..b.len() {
                x[pvec[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}

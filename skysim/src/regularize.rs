//! Iterative positive-definite regularisation of covariance matrices.

use crate::linalg::{cholesky_lower, symmetric_eigen};
use ndarray::Array2;

/// Relative eigenvalue tolerance: anything above −tol·λmax counts as
/// admissible.
const REL_TOL: f64 = 1e-12;

/// Outcome of regularising one matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegStatus {
    /// The matrix was already positive semidefinite.
    Unchanged,
    /// Negative directions were clipped away within the step budget.
    Regularised {
        /// Number of clip-and-rebuild iterations taken.
        steps: usize,
        /// ‖A′ − A‖max / ‖A‖max over the whole run.
        max_frac_change: f64,
    },
    /// The step budget ran out before the matrix became admissible.
    Exceeded {
        /// The configured step budget.
        steps: usize,
        /// Fractional change accumulated up to the point of giving up.
        max_frac_change: f64,
    },
}

impl RegStatus {
    /// `true` unless the step budget was exhausted.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        !matches!(self, Self::Exceeded { .. })
    }

    /// The reported maximum fractional change.
    #[must_use]
    pub const fn max_frac_change(self) -> f64 {
        match self {
            Self::Unchanged => 0.0,
            Self::Regularised {
                max_frac_change, ..
            }
            | Self::Exceeded {
                max_frac_change, ..
            } => max_frac_change,
        }
    }
}

fn max_abs(m: &Array2<f64>) -> f64 {
    m.iter().fold(0.0_f64, |acc, &value| acc.max(value.abs()))
}

fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0_f64, |acc, (&x, &y)| acc.max((x - y).abs()))
}

/// Nudges a symmetric matrix to positive semidefiniteness in place.
///
/// Each step clips negative eigenvalues to zero and rebuilds the matrix from
/// the clipped spectrum; admissibility is then re-checked through the
/// factorisation the draw will actually use, so rounding in the rebuild
/// cannot slip through. The clip is the minimum-norm change that removes a
/// negative direction, which keeps the reported fractional change small.
pub fn regularize(m: &mut Array2<f64>, max_steps: usize) -> RegStatus {
    let original = m.clone();
    let scale = max_abs(&original).max(f64::MIN_POSITIVE);

    for step in 0..=max_steps {
        let (values, vectors) = symmetric_eigen(m.view());
        let lambda_max = values.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
        let admissible = values.iter().all(|&v| v >= -REL_TOL * lambda_max)
            && cholesky_lower(m.view()).is_ok();

        if admissible {
            return if step == 0 {
                RegStatus::Unchanged
            } else {
                RegStatus::Regularised {
                    steps: step,
                    max_frac_change: max_abs_diff(m, &original) / scale,
                }
            };
        }
        if step == max_steps {
            break;
        }

        let clipped = values.mapv(|v| v.max(0.0));
        let rebuilt = vectors.dot(&Array2::from_diag(&clipped)).dot(&vectors.t());
        // keep exact symmetry against rounding in the triple product
        for i in 0..rebuilt.nrows() {
            for j in 0..i {
                let mean = 0.5 * (rebuilt[[i, j]] + rebuilt[[j, i]]);
                m[[i, j]] = mean;
                m[[j, i]] = mean;
            }
            m[[i, i]] = rebuilt[[i, i]];
        }
    }

    RegStatus::Exceeded {
        steps: max_steps,
        max_frac_change: max_abs_diff(m, &original) / scale,
    }
}

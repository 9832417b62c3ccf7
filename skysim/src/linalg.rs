//! Small dense symmetric-matrix kernels for the covariance pipeline.
//!
//! The matrices here are N×N with N the number of fields, typically a few
//! dozen at most, so simple cache-friendly loops beat anything clever.

use ndarray::{Array1, Array2, ArrayView2};

/// Status of a failed factorisation: the first column whose pivot came out
/// negative.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NotPositiveDefinite {
    /// Zero-based column of the offending pivot.
    pub column: usize,
}

/// Lower Cholesky factor L with L·Lᵀ = M.
///
/// Exactly singular but consistent matrices are accepted: a pivot within
/// rounding of zero is taken as an exact zero direction provided the rest of
/// its column vanishes too, which is what perfectly correlated fields and
/// zero-filled missing spectra produce.
///
/// # Errors
///
/// Returns the offending column when `m` is not positive semidefinite.
pub fn cholesky_lower(m: ArrayView2<'_, f64>) -> Result<Array2<f64>, NotPositiveDefinite> {
    let n = m.nrows();
    debug_assert_eq!(n, m.ncols());

    let scale = m
        .diag()
        .iter()
        .fold(0.0_f64, |acc, &value| acc.max(value.abs()));
    let pivot_tol = 1e-12 * scale;
    let column_tol = 1e-8 * scale.max(f64::MIN_POSITIVE).sqrt();

    let mut lower = Array2::zeros((n, n));
    for j in 0..n {
        let mut pivot = m[[j, j]];
        for k in 0..j {
            pivot -= lower[[j, k]] * lower[[j, k]];
        }

        if pivot > pivot_tol {
            let root = pivot.sqrt();
            lower[[j, j]] = root;
            for i in j + 1..n {
                let mut off = m[[i, j]];
                for k in 0..j {
                    off -= lower[[i, k]] * lower[[j, k]];
                }
                lower[[i, j]] = off / root;
            }
        } else if pivot >= -pivot_tol {
            // semidefinite direction: the whole column has to vanish
            for i in j + 1..n {
                let mut off = m[[i, j]];
                for k in 0..j {
                    off -= lower[[i, k]] * lower[[j, k]];
                }
                if off.abs() > column_tol {
                    return Err(NotPositiveDefinite { column: j });
                }
            }
        } else {
            return Err(NotPositiveDefinite { column: j });
        }
    }

    Ok(lower)
}

/// Eigendecomposition of a symmetric matrix by the cyclic Jacobi method.
///
/// Returns the eigenvalues and the matrix whose columns are the matching
/// eigenvectors, so that M = V·diag(λ)·Vᵀ.
///
/// # Panics
///
/// Panics if `m` is not square.
#[must_use]
pub fn symmetric_eigen(m: ArrayView2<'_, f64>) -> (Array1<f64>, Array2<f64>) {
    let n = m.nrows();
    assert_eq!(n, m.ncols());

    let mut a = m.to_owned();
    let mut v = Array2::eye(n);

    let off_norm = |a: &Array2<f64>| {
        let mut sum = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                sum += a[[p, q]] * a[[p, q]];
            }
        }
        sum.sqrt()
    };
    let frobenius = {
        let mut sum = 0.0;
        for p in 0..n {
            for q in 0..n {
                sum += a[[p, q]] * a[[p, q]];
            }
        }
        sum.sqrt()
    };
    let target = 1e-14 * frobenius.max(f64::MIN_POSITIVE);

    for _ in 0..64 {
        if off_norm(&a) <= target {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = a[[p, q]];
                if apq.abs() <= target / 16.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + theta.hypot(1.0));
                let c = 1.0 / t.hypot(1.0);
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    (a.diag().to_owned(), v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use ndarray::array;

    #[test]
    fn cholesky_reconstructs() {
        let m = array![[4.0, 2.0, 0.5], [2.0, 5.0, 1.0], [0.5, 1.0, 3.0]];
        let lower = cholesky_lower(m.view()).unwrap();

        let product = lower.dot(&lower.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(f64, product[[i, j]], m[[i, j]], epsilon = 1e-12);
            }
        }
        // strictly lower structure
        assert_approx_eq!(f64, lower[[0, 1]], 0.0);
        assert_approx_eq!(f64, lower[[0, 2]], 0.0);
        assert_approx_eq!(f64, lower[[1, 2]], 0.0);
    }

    #[test]
    fn cholesky_accepts_singular_consistent() {
        // perfectly correlated pair: one zero eigenvalue
        let m = array![[2.0, 2.0], [2.0, 2.0]];
        let lower = cholesky_lower(m.view()).unwrap();
        let product = lower.dot(&lower.t());
        for i in 0..2 {
            for j in 0..2 {
                assert_approx_eq!(f64, product[[i, j]], m[[i, j]], epsilon = 1e-12);
            }
        }

        // zero-filled field: zero row and column
        let m = array![[1.0, 0.0], [0.0, 0.0]];
        assert!(cholesky_lower(m.view()).is_ok());
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let m = array![[1.0, 2.0], [2.0, 1.0]];
        let err = cholesky_lower(m.view()).unwrap_err();
        assert_eq!(err.column, 1);

        let m = array![[-1.0, 0.0], [0.0, 1.0]];
        assert_eq!(cholesky_lower(m.view()).unwrap_err().column, 0);
    }

    #[test]
    fn eigen_reconstructs() {
        let m = array![[2.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 1.0]];
        let (values, vectors) = symmetric_eigen(m.view());

        let lambda = Array2::from_diag(&values);
        let rebuilt = vectors.dot(&lambda).dot(&vectors.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(f64, rebuilt[[i, j]], m[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn eigen_finds_known_spectrum() {
        let m = array![[2.0, 1.0], [1.0, 2.0]];
        let (values, _) = symmetric_eigen(m.view());
        let mut sorted: Vec<_> = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        assert_approx_eq!(f64, sorted[0], 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, sorted[1], 3.0, epsilon = 1e-12);
    }
}

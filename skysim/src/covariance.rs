//! Per-multipole cross-covariance assembly, validation and factorisation.
//!
//! The assembler is the transpose stage between the pair-major
//! [`GriddedSpectra`] product and the ℓ-major matrix stack the draw
//! consumes. The two products never share storage.

use crate::context::Diagnostics;
use crate::error::{Error, Result};
use crate::linalg::{self, NotPositiveDefinite};
use crate::regularize::{regularize, RegStatus};
use crate::spectrum::GriddedSpectra;
use ndarray::Array2;
use rayon::prelude::*;

/// How many times a violating correlation is re-inflated before the
/// assembler declares it persistent.
const INFLATE_ATTEMPTS: usize = 32;

/// Validation knobs of the assembler.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssemblyPolicy {
    /// Fill pairs that are missing in both orders with zero instead of
    /// failing.
    pub allow_missing: bool,
    /// Replace zero diagonal entries by this fraction of the smallest
    /// positive diagonal found anywhere in the stack.
    pub mindiag_frac: Option<f64>,
    /// Inflate variances by (1 + frac) when a correlation leaves [−1, 1].
    /// Zero keeps the violation fatal.
    pub badcorr_frac: f64,
    /// Smallest multipole the diagonal and correlation validation applies
    /// to; matrices below it are assembled but never factorised.
    pub validate_lmin: usize,
}

/// The ℓ-indexed stack of N×N cross-covariance matrices.
#[derive(Clone, Debug)]
pub struct CovarianceStack {
    nfields: usize,
    mats: Vec<Array2<f64>>,
}

impl CovarianceStack {
    /// Assembles the stack from gridded spectra, filling missing entries by
    /// symmetry and validating diagonals and correlations.
    ///
    /// Warnings and errors are annotated with (ℓ, i, j) and emitted in
    /// ascending (ℓ, i, j) order, so diagnostics are reproducible.
    ///
    /// # Errors
    ///
    /// Fails when a pair is missing in both orders without
    /// `policy.allow_missing`, and when a correlation leaves [−1, 1] while
    /// `policy.badcorr_frac` is zero.
    pub fn assemble(
        gridded: &GriddedSpectra,
        policy: &AssemblyPolicy,
        diag: &Diagnostics,
    ) -> Result<Self> {
        let n = gridded.nfields();
        let lmax = gridded.lmax();

        let mut mats = Vec::with_capacity(lmax + 1);
        for ell in 0..=lmax {
            let mut m = Array2::zeros((n, n));
            for i in 0..n {
                for j in 0..n {
                    let value = gridded
                        .get(i, j)
                        .or_else(|| gridded.get(j, i))
                        .map(|cl| cl[ell]);
                    match value {
                        Some(value) => m[[i, j]] = value,
                        None if policy.allow_missing => {}
                        None => {
                            return Err(Error::Input(format!(
                                "covariance (ell = {ell}): no spectrum for pair \
                                 ({i}, {j}) in either order"
                            )));
                        }
                    }
                }
            }
            mats.push(m);
        }

        let mut stack = Self { nfields: n, mats };
        stack.validate_diagonals(policy, diag);
        stack.validate_correlations(policy, diag)?;
        Ok(stack)
    }

    fn validate_diagonals(&mut self, policy: &AssemblyPolicy, diag: &Diagnostics) {
        // the replacement floor references the whole stack, so scan first
        let min_positive = self
            .mats
            .iter()
            .flat_map(|m| m.diag().to_vec())
            .filter(|&d| d > 0.0)
            .fold(f64::INFINITY, f64::min);

        for (ell, m) in self.mats.iter_mut().enumerate().skip(policy.validate_lmin) {
            for i in 0..self.nfields {
                let d = m[[i, i]];
                if d < 0.0 {
                    diag.warn(format!(
                        "covariance (ell = {ell}): negative variance {d:e} for field {i}"
                    ));
                } else if d == 0.0 {
                    if let Some(frac) = policy.mindiag_frac {
                        if min_positive.is_finite() {
                            m[[i, i]] = frac * min_positive;
                        }
                    } else {
                        diag.warn(format!(
                            "covariance (ell = {ell}): zero variance for field {i}"
                        ));
                    }
                }
            }
        }
    }

    fn validate_correlations(&mut self, policy: &AssemblyPolicy, diag: &Diagnostics) -> Result<()> {
        for (ell, m) in self.mats.iter_mut().enumerate().skip(policy.validate_lmin) {
            for i in 0..self.nfields {
                for j in i + 1..self.nfields {
                    if m[[i, i]] <= 0.0 || m[[j, j]] <= 0.0 {
                        // no correlation is defined against a zero or
                        // negative variance; the diagnostic already fired
                        continue;
                    }
                    let bound = (m[[i, i]] * m[[j, j]]).sqrt();
                    if m[[i, j]].abs() <= bound {
                        continue;
                    }

                    if policy.badcorr_frac <= 0.0 {
                        return Err(Error::Domain(format!(
                            "covariance (ell = {ell}): correlation of pair ({i}, {j}) \
                             exceeds unity and no inflation is configured"
                        )));
                    }

                    let factor = 1.0 + policy.badcorr_frac;
                    let mut attempts = 0;
                    while attempts < INFLATE_ATTEMPTS
                        && m[[i, j]].abs() > (m[[i, i]] * m[[j, j]]).sqrt()
                    {
                        m[[i, i]] *= factor;
                        m[[j, j]] *= factor;
                        attempts += 1;
                    }
                    diag.warn(format!(
                        "covariance (ell = {ell}): correlation of pair ({i}, {j}) \
                         exceeded unity; variances inflated {attempts} time(s)"
                    ));
                    if m[[i, j]].abs() > (m[[i, i]] * m[[j, j]]).sqrt() {
                        diag.warn(format!(
                            "covariance (ell = {ell}): correlation of pair ({i}, {j}) \
                             still exceeds unity after inflation"
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of fields.
    #[must_use]
    pub fn nfields(&self) -> usize {
        self.nfields
    }

    /// Largest multipole of the stack.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.mats.len() - 1
    }

    /// The matrix at multipole `ell`.
    ///
    /// # Panics
    ///
    /// Panics if `ell` is outside the stack.
    #[must_use]
    pub fn matrix(&self, ell: usize) -> &Array2<f64> {
        &self.mats[ell]
    }

    /// Regularises every matrix in `[lmin, lmax]` in place.
    ///
    /// Returns the largest fractional change across the range.
    ///
    /// # Errors
    ///
    /// Fails with the offending ℓ when any matrix exhausts `max_steps`.
    pub fn regularize_range(
        &mut self,
        lmin: usize,
        lmax: usize,
        max_steps: usize,
        diag: &Diagnostics,
    ) -> Result<f64> {
        let statuses: Vec<(usize, RegStatus)> = self.mats[lmin..=lmax]
            .par_iter_mut()
            .enumerate()
            .map(|(offset, m)| (lmin + offset, regularize(m, max_steps)))
            .collect();

        let mut worst = 0.0_f64;
        for (ell, status) in statuses {
            if !status.is_ok() {
                return Err(Error::Numerical(format!(
                    "covariance (ell = {ell}): still not positive semidefinite \
                     after {max_steps} regularisation steps"
                )));
            }
            if let RegStatus::Regularised {
                steps,
                max_frac_change,
            } = status
            {
                diag.warn(format!(
                    "covariance (ell = {ell}): regularised in {steps} step(s), \
                     max fractional change {max_frac_change:e}"
                ));
                worst = worst.max(max_frac_change);
            }
        }
        Ok(worst)
    }

    /// Factorises the matrices of `[lmin, lmax]` into lower Cholesky
    /// triangles, consuming the stack.
    ///
    /// # Errors
    ///
    /// Fails with the offending ℓ when a matrix is not positive
    /// semidefinite.
    pub fn into_cholesky(self, lmin: usize, lmax: usize) -> Result<CholeskyStack> {
        let factors: Vec<std::result::Result<Array2<f64>, (usize, NotPositiveDefinite)>> = self
            .mats[lmin..=lmax]
            .par_iter()
            .enumerate()
            .map(|(offset, m)| {
                linalg::cholesky_lower(m.view()).map_err(|err| (lmin + offset, err))
            })
            .collect();

        let mut triangles = Vec::with_capacity(factors.len());
        for factor in factors {
            match factor {
                Ok(lower) => triangles.push(lower),
                Err((ell, failure)) => {
                    return Err(Error::Numerical(format!(
                        "Cholesky failed at ell = {ell}: pivot {} not positive",
                        failure.column
                    )));
                }
            }
        }

        Ok(CholeskyStack {
            nfields: self.nfields,
            lmin,
            triangles,
        })
    }
}

/// Lower Cholesky triangles for ℓ ∈ [lmin, lmax].
#[derive(Clone, Debug)]
pub struct CholeskyStack {
    nfields: usize,
    lmin: usize,
    triangles: Vec<Array2<f64>>,
}

impl CholeskyStack {
    /// Number of fields.
    #[must_use]
    pub fn nfields(&self) -> usize {
        self.nfields
    }

    /// Smallest multipole covered.
    #[must_use]
    pub fn lmin(&self) -> usize {
        self.lmin
    }

    /// Largest multipole covered.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.lmin + self.triangles.len() - 1
    }

    /// The triangle at multipole `ell`.
    ///
    /// # Panics
    ///
    /// Panics if `ell` is outside [lmin, lmax].
    #[must_use]
    pub fn triangle(&self, ell: usize) -> &Array2<f64> {
        &self.triangles[ell - self.lmin]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn gridded_two_fields(lmax: usize) -> GriddedSpectra {
        let mut gridded = GriddedSpectra::empty(2, lmax);
        gridded.set(0, 0, vec![1.0; lmax + 1]);
        gridded.set(1, 1, vec![2.0; lmax + 1]);
        gridded.set(0, 1, vec![0.5; lmax + 1]);
        gridded
    }

    #[test]
    fn symmetry_fill_from_either_order() {
        let diag = Diagnostics::new();
        let stack = CovarianceStack::assemble(
            &gridded_two_fields(4),
            &AssemblyPolicy::default(),
            &diag,
        )
        .unwrap();

        for ell in 0..=4 {
            let m = stack.matrix(ell);
            assert_approx_eq!(f64, m[[0, 1]], 0.5);
            assert_approx_eq!(f64, m[[1, 0]], 0.5);
        }
        assert_eq!(diag.warning_count(), 0);
    }

    #[test]
    fn missing_pair_policy() {
        let mut gridded = GriddedSpectra::empty(2, 2);
        gridded.set(0, 0, vec![1.0; 3]);
        gridded.set(1, 1, vec![1.0; 3]);
        let diag = Diagnostics::new();

        assert!(CovarianceStack::assemble(&gridded, &AssemblyPolicy::default(), &diag).is_err());

        let stack = CovarianceStack::assemble(
            &gridded,
            &AssemblyPolicy {
                allow_missing: true,
                ..AssemblyPolicy::default()
            },
            &diag,
        )
        .unwrap();
        assert_approx_eq!(f64, stack.matrix(1)[[0, 1]], 0.0);
    }

    #[test]
    fn zero_diagonal_replacement() {
        let mut gridded = GriddedSpectra::empty(2, 1);
        gridded.set(0, 0, vec![4.0, 4.0]);
        gridded.set(1, 1, vec![0.0, 0.0]);
        gridded.set(0, 1, vec![0.0, 0.0]);

        let diag = Diagnostics::new();
        let stack = CovarianceStack::assemble(
            &gridded,
            &AssemblyPolicy {
                mindiag_frac: Some(0.1),
                ..AssemblyPolicy::default()
            },
            &diag,
        )
        .unwrap();
        // floor is 0.1 times the smallest positive diagonal in the stack
        assert_approx_eq!(f64, stack.matrix(0)[[1, 1]], 0.4);
        assert_eq!(diag.warning_count(), 0);

        // without the floor it only warns
        let diag = Diagnostics::new();
        let stack =
            CovarianceStack::assemble(&gridded, &AssemblyPolicy::default(), &diag).unwrap();
        assert_approx_eq!(f64, stack.matrix(0)[[1, 1]], 0.0);
        assert_eq!(diag.warning_count(), 2);
    }

    #[test]
    fn correlation_inflation() {
        let mut gridded = GriddedSpectra::empty(2, 0);
        gridded.set(0, 0, vec![1.0]);
        gridded.set(1, 1, vec![1.0]);
        gridded.set(0, 1, vec![1.1]);

        // no inflation configured: fatal
        let diag = Diagnostics::new();
        let result = CovarianceStack::assemble(&gridded, &AssemblyPolicy::default(), &diag);
        assert!(matches!(result, Err(Error::Domain(_))));

        // with inflation the bound is restored
        let diag = Diagnostics::new();
        let stack = CovarianceStack::assemble(
            &gridded,
            &AssemblyPolicy {
                badcorr_frac: 0.1,
                ..AssemblyPolicy::default()
            },
            &diag,
        )
        .unwrap();
        let m = stack.matrix(0);
        assert!(m[[0, 1]].abs() <= (m[[0, 0]] * m[[1, 1]]).sqrt());
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn cholesky_stack_diagonal_case() {
        let diag = Diagnostics::new();
        let mut gridded = GriddedSpectra::empty(2, 8);
        let cl: Vec<f64> = (0..=8).map(|l| 1.0 / f64::from(u32::try_from(l + 1).unwrap()).powi(2)).collect();
        gridded.set(0, 0, cl.clone());
        gridded.set(1, 1, cl.clone());
        gridded.set(0, 1, vec![0.0; 9]);

        let mut stack =
            CovarianceStack::assemble(&gridded, &AssemblyPolicy::default(), &diag).unwrap();
        let change = stack.regularize_range(2, 8, 10, &diag).unwrap();
        assert_approx_eq!(f64, change, 0.0);

        let chol = stack.into_cholesky(2, 8).unwrap();
        for ell in 2..=8 {
            let lower = chol.triangle(ell);
            assert_approx_eq!(f64, lower[[0, 0]], cl[ell].sqrt(), epsilon = 1e-14);
            assert_approx_eq!(f64, lower[[1, 1]], cl[ell].sqrt(), epsilon = 1e-14);
            assert_approx_eq!(f64, lower[[1, 0]], 0.0);
        }
    }
}

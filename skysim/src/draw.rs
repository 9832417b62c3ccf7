//! The correlated harmonic-coefficient draw.
//!
//! Reproducibility is the design constraint here: the flat index
//! j = ℓ(ℓ+1)/2 + m over ℓ ∈ [lmin, lmax] is split into one contiguous
//! chunk per logical thread by a static schedule, and chunk k draws from
//! its own PCG stream seeded `seed + (k + 1)·OFFSET`. A run is therefore a
//! pure function of (seed, thread count); the runtime scheduling of the
//! worker pool never changes the result.

use crate::alm::{triangle_index, triangle_unravel, Alm, AlmSet};
use crate::covariance::CholeskyStack;
use crate::error::{Error, Result};
use num_complex::Complex64;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;
use rayon::prelude::*;

/// Stride between per-thread seeds.
pub const SEED_OFFSET: u64 = 10_000_000;

/// Exclusive upper bound on the thread count of the static schedule.
pub const MAX_THREADS: usize = 210;

/// A validated draw schedule.
#[derive(Clone, Copy, Debug)]
pub struct DrawPlan {
    lmin: usize,
    lmax: usize,
    threads: usize,
    seed: u64,
}

impl DrawPlan {
    /// Validates the multipole range, thread count and seed.
    ///
    /// The seed preconditions keep the per-thread PCG streams disjoint:
    /// `seed < OFFSET − 1`, `threads < 210` and
    /// `seed + threads·OFFSET < 2³¹`.
    ///
    /// # Errors
    ///
    /// Fails on an empty multipole range or a violated precondition.
    pub fn new(lmin: usize, lmax: usize, threads: usize, seed: u64) -> Result<Self> {
        if lmin == 0 || lmin > lmax {
            return Err(Error::Config(format!(
                "draw range [{lmin}, {lmax}] is empty or includes the monopole"
            )));
        }
        if threads == 0 || threads >= MAX_THREADS {
            return Err(Error::Config(format!(
                "draw needs 1 to {} threads, got {threads}",
                MAX_THREADS - 1
            )));
        }
        if seed >= SEED_OFFSET - 1 {
            return Err(Error::Config(format!(
                "seed {seed} must stay below {}",
                SEED_OFFSET - 1
            )));
        }
        let highest = seed + (threads as u64) * SEED_OFFSET;
        if highest >= 1 << 31 {
            return Err(Error::Config(format!(
                "seed {seed} with {threads} threads pushes the stream seeds to \
                 {highest}, past 2^31"
            )));
        }

        Ok(Self {
            lmin,
            lmax,
            threads,
            seed,
        })
    }

    /// Smallest drawn multipole.
    #[must_use]
    pub const fn lmin(&self) -> usize {
        self.lmin
    }

    /// Largest drawn multipole.
    #[must_use]
    pub const fn lmax(&self) -> usize {
        self.lmax
    }

    /// The static chunk boundaries over the flat j range, one per thread.
    /// Early chunks absorb the remainder, so the partition only depends on
    /// the thread count.
    fn chunks(&self) -> Vec<std::ops::Range<usize>> {
        let first = triangle_index(self.lmin, 0);
        let last = triangle_index(self.lmax, self.lmax);
        let total = last - first + 1;

        let base = total / self.threads;
        let remainder = total % self.threads;

        let mut ranges = Vec::with_capacity(self.threads);
        let mut start = first;
        for k in 0..self.threads {
            let len = base + usize::from(k < remainder);
            ranges.push(start..start + len);
            start += len;
        }
        ranges
    }
}

/// Draws correlated aℓm for every field.
///
/// Per flat index j the chunk's PCG stream yields, field by field, a
/// complex standard draw: 𝒩(0, ½) on the real and imaginary parts for
/// m > 0, and a real 𝒩(0, 1) for m = 0. The vector is then rotated through
/// the Cholesky triangle of its multipole.
///
/// # Panics
///
/// Panics if the plan's range is not covered by the factor stack.
#[must_use]
pub fn draw_alm(chol: &CholeskyStack, plan: &DrawPlan) -> AlmSet {
    assert!(plan.lmin >= chol.lmin() && plan.lmax <= chol.lmax());
    let nfields = chol.nfields();

    // each chunk of the static schedule produces its own j-major block, so
    // no shared state is written during the draw
    let blocks: Vec<(std::ops::Range<usize>, Vec<Complex64>)> = plan
        .chunks()
        .into_par_iter()
        .enumerate()
        .map(|(k, range)| {
            let stream_seed = plan.seed + (k as u64 + 1) * SEED_OFFSET;
            let mut rng = Pcg64::seed_from_u64(stream_seed);
            let half = Normal::new(0.0, 0.5_f64.sqrt()).unwrap();
            let unit = Normal::new(0.0, 1.0).unwrap();

            let mut block = vec![Complex64::new(0.0, 0.0); range.len() * nfields];
            let mut x = vec![Complex64::new(0.0, 0.0); nfields];
            for (slot, j) in range.clone().enumerate() {
                let (ell, m) = triangle_unravel(j);
                for value in &mut x {
                    *value = if m == 0 {
                        Complex64::new(unit.sample(&mut rng), 0.0)
                    } else {
                        Complex64::new(half.sample(&mut rng), half.sample(&mut rng))
                    };
                }

                let lower = chol.triangle(ell);
                let out = &mut block[slot * nfields..(slot + 1) * nfields];
                for (i, target) in out.iter_mut().enumerate() {
                    let mut acc = Complex64::new(0.0, 0.0);
                    for (b, &source) in x.iter().enumerate().take(i + 1) {
                        acc += lower[[i, b]] * source;
                    }
                    *target = acc;
                }
            }
            (range, block)
        })
        .collect();

    // stitch the j-major blocks into per-field triangular buffers
    let mut alms: Vec<Alm> = (0..nfields).map(|_| Alm::zero(plan.lmax)).collect();
    for (range, block) in blocks {
        for (slot, j) in range.enumerate() {
            let (ell, m) = triangle_unravel(j);
            for (field, alm) in alms.iter_mut().enumerate() {
                alm.set(ell, m, block[slot * nfields + field]);
            }
        }
    }

    AlmSet::from_fields(alms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::{AssemblyPolicy, CovarianceStack};
    use crate::spectrum::GriddedSpectra;

    fn diagonal_chol(lmax: usize, c0: f64, c1: f64) -> CholeskyStack {
        let mut gridded = GriddedSpectra::empty(2, lmax);
        gridded.set(0, 0, vec![c0; lmax + 1]);
        gridded.set(1, 1, vec![c1; lmax + 1]);
        gridded.set(0, 1, vec![0.0; lmax + 1]);
        let diag = crate::context::Diagnostics::new();
        CovarianceStack::assemble(&gridded, &AssemblyPolicy::default(), &diag)
            .unwrap()
            .into_cholesky(1, lmax)
            .unwrap()
    }

    #[test]
    fn preconditions_are_checked() {
        assert!(DrawPlan::new(2, 32, 4, 42).is_ok());
        assert!(DrawPlan::new(0, 32, 4, 42).is_err());
        assert!(DrawPlan::new(8, 4, 4, 42).is_err());
        assert!(DrawPlan::new(2, 32, 0, 42).is_err());
        assert!(DrawPlan::new(2, 32, MAX_THREADS, 42).is_err());
        assert!(DrawPlan::new(2, 32, 4, SEED_OFFSET - 1).is_err());
        // the extreme admissible plan still keeps every stream seed below 2^31
        assert!(DrawPlan::new(2, 32, 209, SEED_OFFSET - 2).is_ok());
    }

    #[test]
    fn chunks_partition_the_range() {
        let plan = DrawPlan::new(2, 16, 5, 1).unwrap();
        let chunks = plan.chunks();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].start, triangle_index(2, 0));
        assert_eq!(chunks[4].end, triangle_index(16, 16) + 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn same_plan_is_bit_identical() {
        let chol = diagonal_chol(16, 1.0, 2.0);
        let plan = DrawPlan::new(2, 16, 3, 42).unwrap();

        let first = draw_alm(&chol, &plan);
        let second = draw_alm(&chol, &plan);
        for field in 0..2 {
            assert_eq!(first.field(field).coeffs(), second.field(field).coeffs());
        }
    }

    #[test]
    fn thread_count_changes_the_realisation() {
        let chol = diagonal_chol(16, 1.0, 2.0);
        let narrow = draw_alm(&chol, &DrawPlan::new(2, 16, 1, 42).unwrap());
        let wide = draw_alm(&chol, &DrawPlan::new(2, 16, 4, 42).unwrap());
        assert_ne!(narrow.field(0).coeffs(), wide.field(0).coeffs());
    }

    #[test]
    fn m_zero_stays_real_and_low_ell_is_empty() {
        let chol = diagonal_chol(8, 1.0, 1.0);
        let alms = draw_alm(&chol, &DrawPlan::new(2, 8, 2, 7).unwrap());

        for field in 0..2 {
            let alm = alms.field(field);
            for ell in 2..=8 {
                assert_eq!(alm.get(ell, 0).im, 0.0);
            }
            assert_eq!(alm.get(0, 0).norm_sqr(), 0.0);
            assert_eq!(alm.get(1, 0).norm_sqr(), 0.0);
            assert_eq!(alm.get(1, 1).norm_sqr(), 0.0);
        }
    }

    #[test]
    fn correlation_is_applied() {
        // perfectly correlated fields draw identical coefficients
        let mut gridded = GriddedSpectra::empty(2, 8);
        gridded.set(0, 0, vec![1.0; 9]);
        gridded.set(1, 1, vec![1.0; 9]);
        gridded.set(0, 1, vec![1.0; 9]);
        let diag = crate::context::Diagnostics::new();
        let chol = CovarianceStack::assemble(&gridded, &AssemblyPolicy::default(), &diag)
            .unwrap()
            .into_cholesky(2, 8)
            .unwrap();

        let alms = draw_alm(&chol, &DrawPlan::new(2, 8, 2, 11).unwrap());
        assert_eq!(alms.field(0).coeffs(), alms.field(1).coeffs());
    }
}

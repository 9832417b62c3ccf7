//! Triangular storage for spherical-harmonic coefficients.

use crate::convert::f64_from_usize;
use num_complex::Complex64;

/// Flat index of (ℓ, m) in triangular order, m ≤ ℓ.
#[must_use]
pub const fn triangle_index(ell: usize, m: usize) -> usize {
    ell * (ell + 1) / 2 + m
}

/// Inverts [`triangle_index`]: the (ℓ, m) of a flat index.
#[must_use]
pub fn triangle_unravel(index: usize) -> (usize, usize) {
    // ℓ = ⌊(√(8j + 1) − 1) / 2⌋, nudged against rounding at the boundaries
    #[allow(clippy::cast_precision_loss)]
    let mut ell = (((8 * index + 1) as f64).sqrt() - 1.0) as usize / 2;
    while triangle_index(ell + 1, 0) <= index {
        ell += 1;
    }
    while triangle_index(ell, 0) > index {
        ell -= 1;
    }
    (ell, index - triangle_index(ell, 0))
}

/// The aℓm of a single field, 0 ≤ m ≤ ℓ ≤ lmax.
///
/// The m = 0 column is real for real fields; everything in this crate
/// maintains that invariant.
#[derive(Clone, Debug)]
pub struct Alm {
    lmax: usize,
    coeffs: Vec<Complex64>,
}

impl Alm {
    /// An all-zero coefficient set up to `lmax`.
    #[must_use]
    pub fn zero(lmax: usize) -> Self {
        Self {
            lmax,
            coeffs: vec![Complex64::new(0.0, 0.0); triangle_index(lmax, lmax) + 1],
        }
    }

    /// The band limit.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// The coefficient at (ℓ, m).
    ///
    /// # Panics
    ///
    /// Panics if m > ℓ or ℓ > lmax.
    #[must_use]
    pub fn get(&self, ell: usize, m: usize) -> Complex64 {
        assert!(m <= ell && ell <= self.lmax);
        self.coeffs[triangle_index(ell, m)]
    }

    /// Overwrites the coefficient at (ℓ, m).
    ///
    /// # Panics
    ///
    /// Panics if m > ℓ or ℓ > lmax.
    pub fn set(&mut self, ell: usize, m: usize, value: Complex64) {
        assert!(m <= ell && ell <= self.lmax);
        self.coeffs[triangle_index(ell, m)] = value;
    }

    /// The flat triangular buffer.
    #[must_use]
    pub fn coeffs(&self) -> &[Complex64] {
        &self.coeffs
    }

    /// Angular power spectrum of the coefficients:
    /// Cℓ = (|aℓ0|² + 2 Σ_{m>0} |aℓm|²) / (2ℓ + 1).
    #[must_use]
    pub fn power_spectrum(&self) -> Vec<f64> {
        (0..=self.lmax)
            .map(|ell| {
                let mut total = self.get(ell, 0).norm_sqr();
                for m in 1..=ell {
                    total += 2.0 * self.get(ell, m).norm_sqr();
                }
                total / (2.0 * f64_from_usize(ell) + 1.0)
            })
            .collect()
    }
}

/// One [`Alm`] per field, in registry order.
#[derive(Clone, Debug)]
pub struct AlmSet {
    alms: Vec<Alm>,
}

impl AlmSet {
    /// All-zero coefficients for `nfields` fields up to `lmax`.
    #[must_use]
    pub fn zero(nfields: usize, lmax: usize) -> Self {
        Self {
            alms: (0..nfields).map(|_| Alm::zero(lmax)).collect(),
        }
    }

    /// Wraps per-field coefficient sets.
    #[must_use]
    pub fn from_fields(alms: Vec<Alm>) -> Self {
        Self { alms }
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alms.len()
    }

    /// `true` when no fields are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alms.is_empty()
    }

    /// The coefficients of one field.
    ///
    /// # Panics
    ///
    /// Panics if `field` is out of bounds.
    #[must_use]
    pub fn field(&self, field: usize) -> &Alm {
        &self.alms[field]
    }

    /// Mutable access to the coefficients of one field.
    ///
    /// # Panics
    ///
    /// Panics if `field` is out of bounds.
    pub fn field_mut(&mut self, field: usize) -> &mut Alm {
        &mut self.alms[field]
    }
}

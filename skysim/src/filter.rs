//! Stateless in-place transforms applied to the loaded spectra.
//!
//! Filters run in the declared order and never change the ℓ grid of a
//! sample, only its values.

use crate::context::Diagnostics;
use crate::error::Result;
use crate::interp::Interp1d;
use crate::spectrum::SpectrumSet;
use itertools::izip;
use std::f64::consts::PI;

/// Arc-minutes to radians.
const ARCMIN: f64 = PI / (180.0 * 60.0);

/// One in-place spectrum transform.
#[derive(Clone, Debug)]
pub enum Filter {
    /// Multiply every value by a constant.
    Rescale(f64),
    /// Multiply by the Gaussian beam exp(−ℓ(ℓ+1)σ²); σ is given in
    /// arc-minutes.
    GaussianBeam {
        /// Beam width in arc-minutes.
        sigma_arcmin: f64,
    },
    /// Multiply by the squared pixel window W(ℓ)², with W tabulated on
    /// [0, 4·Nside] and interpolated at non-integer ℓ.
    PixelWindow {
        /// The tabulated window function.
        window: Interp1d,
        /// 4·Nside, the highest multipole the window is defined for.
        ell_limit: f64,
    },
    /// Multiply by exp(−(ℓ/ℓsup)ⁿ).
    Suppress {
        /// Suppression scale ℓsup.
        ell_sup: f64,
        /// Suppression steepness n.
        index: f64,
    },
}

impl Filter {
    /// Applies the filter to one spectrum in place.
    pub fn apply(&self, pair: (usize, usize), ell: &[f64], cl: &mut [f64], diag: &Diagnostics) {
        match self {
            Self::Rescale(factor) => {
                for value in cl.iter_mut() {
                    *value *= factor;
                }
            }
            Self::GaussianBeam { sigma_arcmin } => {
                let sigma = sigma_arcmin * ARCMIN;
                for (&ell, value) in izip!(ell, cl.iter_mut()) {
                    *value *= (-ell * (ell + 1.0) * sigma * sigma).exp();
                }
            }
            Self::PixelWindow { window, ell_limit } => {
                if ell.last().copied().unwrap_or(0.0) > *ell_limit {
                    diag.warn(format!(
                        "pair ({}, {}): input multipoles exceed the pixel window limit {}",
                        pair.0, pair.1, ell_limit
                    ));
                }
                for (&ell, value) in izip!(ell, cl.iter_mut()) {
                    let w = window.eval_clamped(ell);
                    *value *= w * w;
                }
            }
            Self::Suppress { ell_sup, index } => {
                for (&ell, value) in izip!(ell, cl.iter_mut()) {
                    *value *= (-(ell / ell_sup).powf(*index)).exp();
                }
            }
        }
    }
}

/// Applies `filters` in order to every spectrum of `set`.
///
/// # Errors
///
/// Never fails today; the signature leaves room for filters that can reject
/// a spectrum.
pub fn apply_all(filters: &[Filter], set: &mut SpectrumSet, diag: &Diagnostics) -> Result<()> {
    set.try_for_each_mut(|pair, sample| {
        let (ell, cl) = sample.parts_mut();
        for filter in filters {
            filter.apply(pair, ell, cl, diag);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::SpectrumSample;
    use float_cmp::assert_approx_eq;

    fn one_pair_set(ell: &[f64], cl: &[f64]) -> SpectrumSet {
        let mut set = SpectrumSet::empty(1);
        set.insert(
            0,
            0,
            SpectrumSample::new(ell.to_vec(), cl.to_vec()).unwrap(),
        );
        set
    }

    #[test]
    fn rescale_and_suppress() {
        let diag = Diagnostics::new();
        let mut set = one_pair_set(&[2.0, 10.0], &[1.0, 1.0]);

        apply_all(
            &[
                Filter::Rescale(3.0),
                Filter::Suppress {
                    ell_sup: 10.0,
                    index: 2.0,
                },
            ],
            &mut set,
            &diag,
        )
        .unwrap();

        let cl = set.get(0, 0).unwrap().cl();
        assert_approx_eq!(f64, cl[0], 3.0 * (-0.04_f64).exp());
        assert_approx_eq!(f64, cl[1], 3.0 * (-1.0_f64).exp());
    }

    #[test]
    fn beam_is_unity_at_zero_width() {
        let diag = Diagnostics::new();
        let mut set = one_pair_set(&[2.0, 64.0], &[1.0, 1.0]);
        apply_all(
            &[Filter::GaussianBeam { sigma_arcmin: 0.0 }],
            &mut set,
            &diag,
        )
        .unwrap();
        assert_approx_eq!(f64, set.get(0, 0).unwrap().cl()[1], 1.0);

        // a finite beam damps high multipoles more strongly
        let mut set = one_pair_set(&[2.0, 512.0], &[1.0, 1.0]);
        apply_all(
            &[Filter::GaussianBeam {
                sigma_arcmin: 30.0,
            }],
            &mut set,
            &diag,
        )
        .unwrap();
        let cl = set.get(0, 0).unwrap().cl();
        assert!(cl[1] < cl[0]);
        assert!(cl[1] < 1.0);
    }

    #[test]
    fn pixel_window_squares_and_warns() {
        let diag = Diagnostics::new();
        let window = Interp1d::new(vec![0.0, 8.0], vec![1.0, 0.5]).unwrap();
        let mut set = one_pair_set(&[4.0, 16.0], &[1.0, 1.0]);

        apply_all(
            &[Filter::PixelWindow {
                window,
                ell_limit: 8.0,
            }],
            &mut set,
            &diag,
        )
        .unwrap();

        let cl = set.get(0, 0).unwrap().cl();
        assert_approx_eq!(f64, cl[0], 0.75 * 0.75);
        // beyond the table the window clamps to its last value
        assert_approx_eq!(f64, cl[1], 0.25);
        assert_eq!(diag.warning_count(), 1);
    }
}

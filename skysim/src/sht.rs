//! Ring-based scalar and spin-2 spherical-harmonic transforms.
//!
//! These are direct transforms: per ring the normalised associated Legendre
//! functions are built by recurrence, collapsed over ℓ into per-order ring
//! sums, and swept over the ring's equally spaced azimuths. No FFT is
//! involved, which keeps the code small at the cost of an O(L²) factor per
//! ring; the band limits this crate works at make that a fine trade.
//!
//! Accuracy degrades towards the ℓ = 3·Nside − 1 resolution limit of the
//! grid, as with any quadrature on iso-latitude rings. The forward
//! transform accepts optional per-ring weights to push that boundary out.

use crate::alm::{triangle_index, Alm};
use crate::convert::f64_from_usize;
use crate::error::{Error, Result};
use crate::pixel::{Pixelization, Ring};
use num_complex::Complex64;
use rayon::prelude::*;

/// Fills `table` with λℓm(θ), the fully normalised associated Legendre
/// functions including the Condon–Shortley phase, in triangular layout.
fn legendre_table(lmax: usize, cos_theta: f64, sin_theta: f64, table: &mut [f64]) {
    debug_assert_eq!(table.len(), triangle_index(lmax, lmax) + 1);

    table[triangle_index(0, 0)] = (4.0 * std::f64::consts::PI).sqrt().recip();
    for m in 1..=lmax {
        let mf = f64_from_usize(m);
        table[triangle_index(m, m)] = -((2.0 * mf + 1.0) / (2.0 * mf)).sqrt()
            * sin_theta
            * table[triangle_index(m - 1, m - 1)];
    }

    for m in 0..lmax {
        let mf = f64_from_usize(m);
        table[triangle_index(m + 1, m)] =
            (2.0 * mf + 3.0).sqrt() * cos_theta * table[triangle_index(m, m)];

        for l in m + 2..=lmax {
            let lf = f64_from_usize(l);
            let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
            let b = (((lf - 1.0) * (lf - 1.0) - mf * mf)
                / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0))
                .sqrt();
            table[triangle_index(l, m)] = a
                * (cos_theta * table[triangle_index(l - 1, m)]
                    - b * table[triangle_index(l - 2, m)]);
        }
    }
}

/// Splits a map buffer into per-ring windows.
fn ring_windows<'a>(pix: &Pixelization, map: &'a mut [f64]) -> Vec<(Ring, &'a mut [f64])> {
    let mut windows = Vec::with_capacity(pix.nrings());
    let mut rest = map;
    for ring in pix.rings() {
        let (window, tail) = std::mem::take(&mut rest).split_at_mut(ring.len);
        windows.push((ring, window));
        rest = tail;
    }
    debug_assert!(rest.is_empty());
    windows
}

/// Direct transforms at a fixed band limit on a fixed grid.
#[derive(Clone, Debug)]
pub struct SphericalTransform {
    pix: Pixelization,
    lmax: usize,
}

impl SphericalTransform {
    /// Couples a band limit to a grid.
    ///
    /// # Errors
    ///
    /// Rejects band limits below 2 (the spin-2 transform needs ℓ = 2) and
    /// beyond 4·Nside, where the grid cannot represent the modes at all.
    pub fn new(pix: Pixelization, lmax: usize) -> Result<Self> {
        if lmax < 2 {
            return Err(Error::Config(format!(
                "band limit {lmax} is below the spin-2 minimum of 2"
            )));
        }
        if lmax > 4 * pix.nside() {
            return Err(Error::Config(format!(
                "band limit {lmax} exceeds 4 Nside = {}",
                4 * pix.nside()
            )));
        }
        Ok(Self { pix, lmax })
    }

    /// The grid the transforms run on.
    #[must_use]
    pub const fn pixelization(&self) -> &Pixelization {
        &self.pix
    }

    /// The band limit.
    #[must_use]
    pub const fn lmax(&self) -> usize {
        self.lmax
    }

    fn table_len(&self) -> usize {
        triangle_index(self.lmax, self.lmax) + 1
    }

    /// Inverse scalar transform: coefficients to a pixel map.
    ///
    /// # Panics
    ///
    /// Panics if `alm` has a different band limit.
    #[must_use]
    pub fn synthesize(&self, alm: &Alm) -> Vec<f64> {
        assert_eq!(alm.lmax(), self.lmax);

        let mut map = vec![0.0; self.pix.npix()];
        ring_windows(&self.pix, &mut map)
            .into_par_iter()
            .for_each(|(ring, window)| {
                let mut table = vec![0.0; self.table_len()];
                legendre_table(self.lmax, ring.cos_theta, ring.sin_theta, &mut table);

                // collapse over ell first; the ring sweep then only sees m
                let sums: Vec<Complex64> = (0..=self.lmax)
                    .map(|m| {
                        (m..=self.lmax)
                            .map(|l| alm.get(l, m) * table[triangle_index(l, m)])
                            .sum()
                    })
                    .collect();

                for (j, value) in window.iter_mut().enumerate() {
                    let phi = f64_from_usize(j).mul_add(ring.dphi, ring.phi0);
                    *value = sums
                        .iter()
                        .enumerate()
                        .map(|(m, &sum)| {
                            let c = if m == 0 { 1.0 } else { 2.0 };
                            let phase =
                                Complex64::from_polar(1.0, f64_from_usize(m) * phi);
                            c * (sum * phase).re
                        })
                        .sum();
                }
            });
        map
    }

    /// Forward scalar transform: a pixel map to coefficients.
    ///
    /// `ring_weights`, when given, scales the quadrature contribution of
    /// each ring and must hold one entry per ring.
    ///
    /// # Errors
    ///
    /// Rejects maps and weight vectors of the wrong length.
    pub fn analyze(&self, map: &[f64], ring_weights: Option<&[f64]>) -> Result<Alm> {
        if map.len() != self.pix.npix() {
            return Err(Error::Input(format!(
                "map holds {} pixels, grid needs {}",
                map.len(),
                self.pix.npix()
            )));
        }
        if let Some(weights) = ring_weights {
            if weights.len() != self.pix.nrings() {
                return Err(Error::Input(format!(
                    "{} ring weights for {} rings",
                    weights.len(),
                    self.pix.nrings()
                )));
            }
        }

        // stage one: weighted ring sums F_{r,m} = w_r ΔΩ Σ_j map_j e^{-i m φ_j},
        // ring-major so the parallel writes stay disjoint
        let solid_angle = self.pix.solid_angle();
        let nrings = self.pix.nrings();
        let mut ring_sums = vec![Complex64::new(0.0, 0.0); nrings * (self.lmax + 1)];
        ring_sums
            .par_chunks_mut(self.lmax + 1)
            .enumerate()
            .for_each(|(index, row)| {
                let ring = self.pix.ring(index);
                let weight = ring_weights.map_or(1.0, |weights| weights[index]) * solid_angle;
                let pixels = &map[ring.start..ring.start + ring.len];

                for (m, slot) in row.iter_mut().enumerate() {
                    let sum: Complex64 = pixels
                        .iter()
                        .enumerate()
                        .map(|(j, &value)| {
                            let phi = f64_from_usize(j).mul_add(ring.dphi, ring.phi0);
                            value * Complex64::from_polar(1.0, -f64_from_usize(m) * phi)
                        })
                        .sum();
                    *slot = weight * sum;
                }
            });

        // λ_mm(θ) = prefactor_m · (−sin θ)^m seeds the rolling ℓ recurrence
        let mut prefactor = vec![(4.0 * std::f64::consts::PI).sqrt().recip(); self.lmax + 1];
        for m in 1..=self.lmax {
            let mf = f64_from_usize(m);
            prefactor[m] = prefactor[m - 1] * ((2.0 * mf + 1.0) / (2.0 * mf)).sqrt();
        }

        // stage two: per order, sweep the rings in a fixed serial order so
        // the coefficient sums are bit-reproducible under any thread count
        let per_order: Vec<Vec<Complex64>> = (0..=self.lmax)
            .into_par_iter()
            .map(|m| {
                let mf = f64_from_usize(m);
                let mut acc = vec![Complex64::new(0.0, 0.0); self.lmax + 1 - m];
                for index in 0..nrings {
                    let ring = self.pix.ring(index);
                    let x = ring.cos_theta;
                    let sum = ring_sums[index * (self.lmax + 1) + m];

                    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                    let mut lam = prefactor[m] * (-ring.sin_theta).powi(m as i32);
                    let mut lam_prev = 0.0;
                    acc[0] += lam * sum;
                    for l in m + 1..=self.lmax {
                        let lf = f64_from_usize(l);
                        let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
                        let b = (((lf - 1.0) * (lf - 1.0) - mf * mf)
                            / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0))
                            .sqrt();
                        let next = a * (x * lam - b * lam_prev);
                        lam_prev = lam;
                        lam = next;
                        acc[l - m] += lam * sum;
                    }
                }
                acc
            })
            .collect();

        let mut alm = Alm::zero(self.lmax);
        for (m, acc) in per_order.iter().enumerate() {
            for (offset, &value) in acc.iter().enumerate() {
                let mut value = value;
                if m == 0 {
                    // rounding keeps a stray imaginary part off the real column
                    value.im = 0.0;
                }
                alm.set(m + offset, m, value);
            }
        }
        Ok(alm)
    }

    /// Inverse spin-2 transform of an E-mode coefficient set (B ≡ 0) into
    /// the two shear components.
    ///
    /// # Panics
    ///
    /// Panics if `e_alm` has a different band limit.
    #[must_use]
    pub fn synthesize_spin2(&self, e_alm: &Alm) -> (Vec<f64>, Vec<f64>) {
        assert_eq!(e_alm.lmax(), self.lmax);

        let mut gamma1 = vec![0.0; self.pix.npix()];
        let mut gamma2 = vec![0.0; self.pix.npix()];

        ring_windows(&self.pix, &mut gamma1)
            .into_par_iter()
            .zip(ring_windows(&self.pix, &mut gamma2))
            .for_each(|((ring, window1), (_, window2))| {
                let mut table = vec![0.0; self.table_len()];
                legendre_table(self.lmax, ring.cos_theta, ring.sin_theta, &mut table);
                let x = ring.cos_theta;
                let sin2 = ring.sin_theta * ring.sin_theta;

                // W and X spin functions collapsed over ell per order
                let mut sums_w = vec![Complex64::new(0.0, 0.0); self.lmax + 1];
                let mut sums_x = vec![Complex64::new(0.0, 0.0); self.lmax + 1];
                for m in 0..=self.lmax {
                    let mf = f64_from_usize(m);
                    for l in m.max(2)..=self.lmax {
                        let lf = f64_from_usize(l);
                        // normalisation carried over from λ(l-1, m)
                        let shoulder = ((lf * lf - mf * mf) * (2.0 * lf + 1.0)
                            / (2.0 * lf - 1.0))
                            .sqrt();
                        let lam = table[triangle_index(l, m)];
                        let lam_lower = if l > m {
                            table[triangle_index(l - 1, m)]
                        } else {
                            0.0
                        };

                        let w = -((lf - mf * mf) / sin2 + 0.5 * lf * (lf - 1.0)) * lam
                            + shoulder * x / sin2 * lam_lower;
                        let xf = mf / sin2 * ((lf - 1.0) * x * lam - shoulder * lam_lower);

                        let spin_norm = ((lf + 2.0)
                            * (lf + 1.0)
                            * lf
                            * (lf - 1.0))
                            .sqrt()
                            .recip();
                        let coeff = e_alm.get(l, m);
                        sums_w[m] += coeff * (w * spin_norm);
                        sums_x[m] += coeff * (xf * spin_norm);
                    }
                }

                for (j, (value1, value2)) in
                    window1.iter_mut().zip(window2.iter_mut()).enumerate()
                {
                    let phi = f64_from_usize(j).mul_add(ring.dphi, ring.phi0);
                    let mut g1 = 0.0;
                    let mut g2 = 0.0;
                    for m in 0..=self.lmax {
                        let c = if m == 0 { 1.0 } else { 2.0 };
                        let phase = Complex64::from_polar(1.0, f64_from_usize(m) * phi);
                        g1 -= c * (sums_w[m] * phase).re;
                        g2 += c * (sums_x[m] * phase).im;
                    }
                    *value1 = g1;
                    *value2 = g2;
                }
            });

        (gamma1, gamma2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use std::f64::consts::PI;

    fn transform(nside: usize, lmax: usize) -> SphericalTransform {
        SphericalTransform::new(Pixelization::new(nside).unwrap(), lmax).unwrap()
    }

    #[test]
    fn monopole_is_constant() {
        let sht = transform(4, 4);
        let mut alm = Alm::zero(4);
        alm.set(0, 0, Complex64::new(2.0, 0.0));

        let map = sht.synthesize(&alm);
        let expected = 2.0 / (4.0 * PI).sqrt();
        for &value in &map {
            assert_approx_eq!(f64, value, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn dipole_follows_cos_theta() {
        let sht = transform(4, 4);
        let mut alm = Alm::zero(4);
        alm.set(1, 0, Complex64::new(1.0, 0.0));

        let map = sht.synthesize(&alm);
        let pix = sht.pixelization();
        for ring in pix.rings() {
            let expected = (3.0 / (4.0 * PI)).sqrt() * ring.cos_theta;
            for j in 0..ring.len {
                assert_approx_eq!(f64, map[ring.start + j], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn analysis_inverts_synthesis_at_low_ell() {
        let sht = transform(16, 8);
        let mut alm = Alm::zero(8);
        alm.set(0, 0, Complex64::new(0.7, 0.0));
        alm.set(2, 0, Complex64::new(1.0, 0.0));
        alm.set(3, 2, Complex64::new(0.4, -0.3));
        alm.set(5, 5, Complex64::new(-0.2, 0.1));

        let map = sht.synthesize(&alm);
        let recovered = sht.analyze(&map, None).unwrap();

        for l in 0..=8 {
            for m in 0..=l {
                let input = alm.get(l, m);
                let output = recovered.get(l, m);
                assert_approx_eq!(f64, input.re, output.re, epsilon = 2e-2);
                assert_approx_eq!(f64, input.im, output.im, epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn ring_weights_must_match() {
        let sht = transform(2, 4);
        let map = vec![0.0; sht.pixelization().npix()];
        assert!(sht.analyze(&map, Some(&[1.0; 3])).is_err());
        assert!(sht
            .analyze(&map, Some(&vec![1.0; sht.pixelization().nrings()]))
            .is_ok());
        assert!(sht.analyze(&map[1..], None).is_err());
    }

    #[test]
    fn axisymmetric_shear_has_no_cross_component() {
        let sht = transform(8, 8);
        let mut e_alm = Alm::zero(8);
        e_alm.set(2, 0, Complex64::new(1.0, 0.0));

        let (gamma1, gamma2) = sht.synthesize_spin2(&e_alm);

        for &value in &gamma2 {
            assert_approx_eq!(f64, value, 0.0, epsilon = 1e-12);
        }

        // the quadrupole pattern scales as sin²θ across rings
        let pix = sht.pixelization();
        let rings: Vec<_> = pix.rings().collect();
        let a = rings[1];
        let b = rings[5];
        let ratio = gamma1[a.start] / gamma1[b.start];
        let expected = (a.sin_theta * a.sin_theta) / (b.sin_theta * b.sin_theta);
        assert_approx_eq!(f64, ratio, expected, epsilon = 1e-10);
    }

    #[test]
    fn band_limit_is_guarded() {
        let pix = Pixelization::new(2).unwrap();
        assert!(SphericalTransform::new(pix, 1).is_err());
        assert!(SphericalTransform::new(pix, 8).is_ok());
        assert!(SphericalTransform::new(pix, 9).is_err());
    }
}

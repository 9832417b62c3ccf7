//! Equal-area iso-latitude pixelisation of the sphere.
//!
//! The grid follows the standard ring layout: 4·Nside − 1 iso-latitude
//! rings holding 12·Nside² equal-area pixels, with polar caps of 4·i pixels
//! and an equatorial belt of 4·Nside pixels per ring. Only the geometry
//! lives here; the transforms that consume it are in [`crate::sht`].

use crate::convert::f64_from_usize;
use crate::error::{Error, Result};
use std::f64::consts::PI;

/// One iso-latitude ring of the grid.
#[derive(Clone, Copy, Debug)]
pub struct Ring {
    /// Flat index of the first pixel of the ring.
    pub start: usize,
    /// Number of pixels in the ring.
    pub len: usize,
    /// cos θ of the ring.
    pub cos_theta: f64,
    /// sin θ of the ring; never zero, rings avoid the poles.
    pub sin_theta: f64,
    /// Azimuth of the first pixel centre.
    pub phi0: f64,
    /// Azimuthal spacing between pixel centres.
    pub dphi: f64,
}

/// The resolution-Nside pixel grid.
#[derive(Clone, Copy, Debug)]
pub struct Pixelization {
    nside: usize,
}

impl Pixelization {
    /// Creates a grid of 12·`nside`² pixels.
    ///
    /// # Errors
    ///
    /// Rejects `nside` of zero.
    pub fn new(nside: usize) -> Result<Self> {
        if nside == 0 {
            return Err(Error::Config("Nside must be positive".to_owned()));
        }
        Ok(Self { nside })
    }

    /// The resolution parameter.
    #[must_use]
    pub const fn nside(&self) -> usize {
        self.nside
    }

    /// Total pixel count, 12·Nside².
    #[must_use]
    pub const fn npix(&self) -> usize {
        12 * self.nside * self.nside
    }

    /// Number of iso-latitude rings.
    #[must_use]
    pub const fn nrings(&self) -> usize {
        4 * self.nside - 1
    }

    /// Solid angle of every pixel, 4π / npix.
    #[must_use]
    pub fn solid_angle(&self) -> f64 {
        4.0 * PI / f64_from_usize(self.npix())
    }

    /// Geometry of ring `index` ∈ [0, nrings).
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn ring(&self, index: usize) -> Ring {
        assert!(index < self.nrings());
        let n = self.nside;
        let nf = f64_from_usize(n);
        // rings are numbered 1..=4n-1 in the geometry formulas
        let i = index + 1;
        let i_f = f64_from_usize(i);

        let (start, len, z, phi0_steps) = if i < n {
            // north polar cap
            (2 * i * (i - 1), 4 * i, 1.0 - i_f * i_f / (3.0 * nf * nf), 0.5)
        } else if i <= 3 * n {
            // equatorial belt; azimuths of consecutive rings interleave
            let start = 2 * n * (n - 1) + (i - n) * 4 * n;
            let offset = if (i - n) % 2 == 0 { 0.5 } else { 1.0 };
            (start, 4 * n, 4.0 / 3.0 - 2.0 * i_f / (3.0 * nf), offset)
        } else {
            // south polar cap, mirror of the north
            let mirror = 4 * n - i;
            let mf = f64_from_usize(mirror);
            let after = 2 * (4 * n - 1 - i) * (4 * n - i);
            (
                self.npix() - after - 4 * mirror,
                4 * mirror,
                -(1.0 - mf * mf / (3.0 * nf * nf)),
                0.5,
            )
        };

        let dphi = 2.0 * PI / f64_from_usize(len);
        Ring {
            start,
            len,
            cos_theta: z,
            sin_theta: (1.0 - z * z).sqrt(),
            phi0: phi0_steps * dphi,
            dphi,
        }
    }

    /// Iterates over all rings from north to south.
    pub fn rings(&self) -> impl Iterator<Item = Ring> + '_ {
        (0..self.nrings()).map(move |index| self.ring(index))
    }

    /// The (θ, φ) centre of pixel `pixel`.
    ///
    /// # Panics
    ///
    /// Panics if `pixel` is out of range.
    #[must_use]
    pub fn pixel_center(&self, pixel: usize) -> (f64, f64) {
        assert!(pixel < self.npix());
        // rings are short, a linear scan only walks the caps
        let ring = self
            .rings()
            .find(|ring| pixel < ring.start + ring.len)
            .unwrap_or_else(|| unreachable!());
        let j = f64_from_usize(pixel - ring.start);
        (
            ring.cos_theta.acos(),
            j.mul_add(ring.dphi, ring.phi0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn ring_structure_tiles_the_sphere() {
        for nside in [1_usize, 2, 4, 8] {
            let pix = Pixelization::new(nside).unwrap();

            let mut expected_start = 0;
            for ring in pix.rings() {
                assert_eq!(ring.start, expected_start);
                expected_start += ring.len;
                assert!(ring.sin_theta > 0.0);
                assert!(ring.cos_theta.abs() < 1.0);
            }
            assert_eq!(expected_start, pix.npix());
        }
    }

    #[test]
    fn rings_mirror_north_south() {
        let pix = Pixelization::new(4).unwrap();
        let nrings = pix.nrings();
        for index in 0..nrings / 2 {
            let north = pix.ring(index);
            let south = pix.ring(nrings - 1 - index);
            assert_eq!(north.len, south.len);
            assert_approx_eq!(f64, north.cos_theta, -south.cos_theta, epsilon = 1e-14);
        }
        // the middle ring sits on the equator
        let equator = pix.ring(nrings / 2);
        assert_approx_eq!(f64, equator.cos_theta, 0.0, epsilon = 1e-14);
    }

    #[test]
    fn equal_area_covers_the_sphere() {
        let pix = Pixelization::new(2).unwrap();
        let total = pix.solid_angle() * f64_from_usize(pix.npix());
        assert_approx_eq!(f64, total, 4.0 * PI, epsilon = 1e-12);
    }

    #[test]
    fn pixel_centers_stay_in_their_ring() {
        let pix = Pixelization::new(2).unwrap();
        for pixel in 0..pix.npix() {
            let (theta, phi) = pix.pixel_center(pixel);
            assert!((0.0..PI).contains(&theta));
            assert!((0.0..=2.0 * PI).contains(&phi));
        }

        // first pixel of the north cap sits at phi = dphi / 2
        let first = pix.pixel_center(0);
        assert_approx_eq!(f64, first.1, PI / 4.0, epsilon = 1e-14);
    }
}

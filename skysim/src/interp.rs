//! Monotone interpolation on sorted one-dimensional grids.
//!
//! Input spectra and the pixel window are sampled on arbitrary ℓ grids; the
//! pipeline resamples both onto integer multipoles. Piecewise-linear
//! interpolation is used throughout because it preserves monotonicity of the
//! samples, which higher-order schemes do not guarantee.

use crate::error::{Error, Result};

/// Piecewise-linear interpolant over a strictly increasing grid.
#[derive(Clone, Debug)]
pub struct Interp1d {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Interp1d {
    /// Builds an interpolant from matching abscissa and ordinate samples.
    ///
    /// # Errors
    ///
    /// Rejects fewer than two samples, mismatched lengths, and abscissae
    /// that are not strictly increasing.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(Error::Input(format!(
                "interpolation grid: {} abscissae but {} ordinates",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(Error::Input(format!(
                "interpolation grid: need at least 2 samples, got {}",
                x.len()
            )));
        }
        if x.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::Input(
                "interpolation grid: abscissae must be strictly increasing".to_owned(),
            ));
        }

        Ok(Self { x, y })
    }

    /// Smallest abscissa of the grid.
    #[must_use]
    pub fn min_x(&self) -> f64 {
        self.x[0]
    }

    /// Largest abscissa of the grid.
    #[must_use]
    pub fn max_x(&self) -> f64 {
        *self.x.last().unwrap()
    }

    /// Value at `x`, or `None` outside the sampled range.
    #[must_use]
    pub fn eval(&self, x: f64) -> Option<f64> {
        if x < self.min_x() || x > self.max_x() {
            return None;
        }

        // index of the right-hand neighbour; x == x[0] lands in segment 0
        let hi = self.x.partition_point(|&node| node < x).max(1);
        let lo = hi - 1;
        if hi == self.x.len() {
            return Some(*self.y.last().unwrap());
        }

        let fraction = (x - self.x[lo]) / (self.x[hi] - self.x[lo]);
        Some(fraction.mul_add(self.y[hi] - self.y[lo], self.y[lo]))
    }

    /// Value at `x`, clamped to the boundary ordinates outside the range.
    #[must_use]
    pub fn eval_clamped(&self, x: f64) -> f64 {
        if x <= self.min_x() {
            self.y[0]
        } else if x >= self.max_x() {
            *self.y.last().unwrap()
        } else {
            // inside the range, so eval always succeeds
            self.eval(x).unwrap_or_else(|| unreachable!())
        }
    }

    /// Linear extrapolation below the grid from the first two samples.
    #[must_use]
    pub fn extrapolate_low(&self, x: f64) -> f64 {
        let slope = (self.y[1] - self.y[0]) / (self.x[1] - self.x[0]);
        slope.mul_add(x - self.x[0], self.y[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn rejects_bad_grids() {
        assert!(Interp1d::new(vec![0.0], vec![1.0]).is_err());
        assert!(Interp1d::new(vec![0.0, 1.0], vec![1.0]).is_err());
        assert!(Interp1d::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(Interp1d::new(vec![1.0, 0.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn linear_segments() {
        let interp = Interp1d::new(vec![0.0, 1.0, 3.0], vec![0.0, 2.0, 0.0]).unwrap();

        assert_approx_eq!(f64, interp.eval(0.0).unwrap(), 0.0);
        assert_approx_eq!(f64, interp.eval(0.5).unwrap(), 1.0);
        assert_approx_eq!(f64, interp.eval(1.0).unwrap(), 2.0);
        assert_approx_eq!(f64, interp.eval(2.0).unwrap(), 1.0);
        assert_approx_eq!(f64, interp.eval(3.0).unwrap(), 0.0);
        assert_eq!(interp.eval(-0.1), None);
        assert_eq!(interp.eval(3.1), None);
    }

    #[test]
    fn clamped_and_extrapolated() {
        let interp = Interp1d::new(vec![2.0, 4.0], vec![10.0, 20.0]).unwrap();

        assert_approx_eq!(f64, interp.eval_clamped(0.0), 10.0);
        assert_approx_eq!(f64, interp.eval_clamped(5.0), 20.0);
        assert_approx_eq!(f64, interp.eval_clamped(3.0), 15.0);
        assert_approx_eq!(f64, interp.extrapolate_low(1.0), 5.0);
        assert_approx_eq!(f64, interp.extrapolate_low(0.0), 0.0);
    }
}

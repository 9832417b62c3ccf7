//! Legendre polynomials, Gauss–Legendre quadrature and the discrete
//! Legendre transform pair used by the lognormal spectrum conversion.
//!
//! The transform works at a fixed bandwidth L with 2L quadrature nodes, so
//! the synthesis–analysis round trip is exact for any spectrum supported on
//! ℓ ≤ L: the integrand Pℓ·Pℓ′ has degree at most 2L, well inside the
//! 4L − 1 exactness range of the quadrature.

use crate::convert::f64_from_usize;
use rayon::prelude::*;
use std::f64::consts::PI;

/// Evaluates (Pₙ(x), Pₙ′(x)) with the three-term recurrence.
fn legendre_pair(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (1.0, 0.0);
    }

    let mut prev = 1.0;
    let mut current = x;
    for k in 2..=n {
        let k = f64_from_usize(k);
        let next = ((2.0 * k - 1.0) * x * current - (k - 1.0) * prev) / k;
        prev = current;
        current = next;
    }

    let n = f64_from_usize(n);
    let derivative = n * (x * current - prev) / (x * x - 1.0);
    (current, derivative)
}

/// Nodes and weights of the n-point Gauss–Legendre rule on [−1, 1].
#[derive(Clone, Debug)]
pub struct GaussLegendre {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl GaussLegendre {
    /// Computes the rule by Newton iteration on the roots of Pₙ.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    #[must_use]
    pub fn new(n: usize) -> Self {
        assert!(n > 0);

        let (nodes, weights) = (0..n)
            .into_par_iter()
            .map(|i| {
                // Tricomi-style initial guess, accurate enough for Newton to
                // converge in a handful of steps
                let mut x =
                    (PI * (f64_from_usize(i) + 0.75) / (f64_from_usize(n) + 0.5)).cos();
                let mut derivative = 0.0;
                for _ in 0..100 {
                    let (value, slope) = legendre_pair(n, x);
                    derivative = slope;
                    let step = value / slope;
                    x -= step;
                    if step.abs() < 1e-15 {
                        break;
                    }
                }
                let weight = 2.0 / ((1.0 - x * x) * derivative * derivative);
                (x, weight)
            })
            .unzip();

        Self { nodes, weights }
    }

    /// The quadrature nodes, in descending order of the initial guesses.
    #[must_use]
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// The quadrature weights matching [`GaussLegendre::nodes`].
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

/// The discrete Legendre transform pair at bandwidth `lmax`.
///
/// Synthesis maps a spectrum Cℓ to the correlation function
/// ξ(θ) = Σℓ (2ℓ+1)/(4π) Cℓ Pℓ(cos θ) sampled at the quadrature nodes;
/// analysis inverts it with the quadrature weights.
#[derive(Clone, Debug)]
pub struct DiscreteLegendre {
    lmax: usize,
    quad: GaussLegendre,
    // Pℓ(xₖ) for all nodes, node-major: poly[k * (lmax + 1) + l]
    poly: Vec<f64>,
}

impl DiscreteLegendre {
    /// Precomputes the 2·`lmax` node rule and the polynomial table.
    ///
    /// # Panics
    ///
    /// Panics if `lmax` is zero.
    #[must_use]
    pub fn new(lmax: usize) -> Self {
        assert!(lmax > 0);
        let quad = GaussLegendre::new(2 * lmax);

        let poly = quad
            .nodes()
            .par_iter()
            .flat_map_iter(|&x| {
                let mut row = Vec::with_capacity(lmax + 1);
                row.push(1.0);
                row.push(x);
                for l in 2..=lmax {
                    let l = f64_from_usize(l);
                    let next = ((2.0 * l - 1.0) * x * row[row.len() - 1]
                        - (l - 1.0) * row[row.len() - 2])
                        / l;
                    row.push(next);
                }
                row
            })
            .collect();

        Self { lmax, quad, poly }
    }

    /// The bandwidth L.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// The cos θ values the correlation function is sampled at.
    #[must_use]
    pub fn nodes(&self) -> &[f64] {
        self.quad.nodes()
    }

    /// Synthesis: spectrum on [0, L] to correlation function at the nodes.
    ///
    /// # Panics
    ///
    /// Panics if `cl` does not cover exactly [0, L].
    #[must_use]
    pub fn synthesis(&self, cl: &[f64]) -> Vec<f64> {
        assert_eq!(cl.len(), self.lmax + 1);

        self.poly
            .par_chunks(self.lmax + 1)
            .map(|row| {
                row.iter()
                    .zip(cl)
                    .enumerate()
                    .map(|(l, (&p, &c))| (2.0 * f64_from_usize(l) + 1.0) / (4.0 * PI) * c * p)
                    .sum()
            })
            .collect()
    }

    /// Analysis: correlation function at the nodes back to a spectrum on
    /// [0, L].
    ///
    /// # Panics
    ///
    /// Panics if `xi` is not sampled at the quadrature nodes.
    #[must_use]
    pub fn analysis(&self, xi: &[f64]) -> Vec<f64> {
        assert_eq!(xi.len(), self.quad.nodes().len());

        (0..=self.lmax)
            .into_par_iter()
            .map(|l| {
                2.0 * PI
                    * self
                        .quad
                        .weights()
                        .iter()
                        .zip(xi)
                        .enumerate()
                        .map(|(k, (&w, &value))| w * value * self.poly[k * (self.lmax + 1) + l])
                        .sum::<f64>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn quadrature_integrates_polynomials() {
        let quad = GaussLegendre::new(8);

        let total: f64 = quad.weights().iter().sum();
        assert_approx_eq!(f64, total, 2.0, epsilon = 1e-12);

        // ∫ x² dx over [−1, 1] = 2/3
        let second: f64 = quad
            .nodes()
            .iter()
            .zip(quad.weights())
            .map(|(&x, &w)| w * x * x)
            .sum();
        assert_approx_eq!(f64, second, 2.0 / 3.0, epsilon = 1e-12);

        // degree 15 = 2n − 1 is still exact: ∫ x¹⁴ dx = 2/15
        let high: f64 = quad
            .nodes()
            .iter()
            .zip(quad.weights())
            .map(|(&x, &w)| w * x.powi(14))
            .sum();
        assert_approx_eq!(f64, high, 2.0 / 15.0, epsilon = 1e-12);
    }

    #[test]
    fn legendre_values() {
        let (p2, dp2) = legendre_pair(2, 0.5);
        assert_approx_eq!(f64, p2, 0.5 * (3.0 * 0.25 - 1.0), epsilon = 1e-14);
        assert_approx_eq!(f64, dp2, 3.0 * 0.5, epsilon = 1e-14);

        let (p5, _) = legendre_pair(5, 1.0);
        assert_approx_eq!(f64, p5, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn transform_round_trip_is_exact() {
        let lmax = 24;
        let dlt = DiscreteLegendre::new(lmax);

        let cl: Vec<f64> = (0..=lmax)
            .map(|l| if l < 2 { 0.0 } else { 1.0 / f64_from_usize(l * l) })
            .collect();

        let xi = dlt.synthesis(&cl);
        let recovered = dlt.analysis(&xi);

        for (&input, &output) in cl.iter().zip(&recovered) {
            assert_approx_eq!(f64, input, output, epsilon = 1e-12);
        }
    }

    #[test]
    fn orthogonality_of_distinct_modes() {
        let dlt = DiscreteLegendre::new(16);
        let mut cl = vec![0.0; 17];
        cl[3] = 1.0;

        let xi = dlt.synthesis(&cl);
        let recovered = dlt.analysis(&xi);

        for (l, &value) in recovered.iter().enumerate() {
            let expected = if l == 3 { 1.0 } else { 0.0 };
            assert_approx_eq!(f64, value, expected, epsilon = 1e-12);
        }
    }
}

//! The lognormal → Gaussian spectrum transform.
//!
//! For a pair of shifted-lognormal fields with mean-shift products
//! M = (μᵢ+sᵢ)(μⱼ+sⱼ), the correlation functions relate pointwise as
//! ξ_G(θ) = log(1 + ξ(θ)/M). The spectrum transform is the Legendre
//! round trip Cℓ → ξ → ξ_G → Cℓ_G at the quadrature nodes of a
//! [`DiscreteLegendre`] at the run's band limit.

use crate::context::Diagnostics;
use crate::error::{Error, Result};
use crate::field::FieldRegistry;
use crate::legendre::DiscreteLegendre;
use crate::spectrum::GriddedSpectra;
use rayon::prelude::*;

/// Everything the round trip produces for one pair, kept so intermediate
/// products can be written out.
#[derive(Clone, Debug)]
pub struct GaussianisedPair {
    /// The ordered field pair.
    pub pair: (usize, usize),
    /// ξ(θ) at the quadrature nodes.
    pub xi: Vec<f64>,
    /// ξ_G(θ) at the quadrature nodes.
    pub xi_gauss: Vec<f64>,
    /// The auxiliary Gaussian spectrum Cℓ_G.
    pub cl_gauss: Vec<f64>,
    /// Samples where log(1 + ξ/M) had a non-positive argument.
    pub failed_samples: usize,
}

/// Mean-shift product (μᵢ+sᵢ)(μⱼ+sⱼ) of a pair.
#[must_use]
pub fn mean_product(registry: &FieldRegistry, i: usize, j: usize) -> f64 {
    let fi = registry.field(i);
    let fj = registry.field(j);
    (fi.mean + fi.shift) * (fj.mean + fj.shift)
}

/// Runs the round trip for one spectrum.
///
/// Non-positive log arguments are replaced by a zero sentinel and counted;
/// the caller decides whether any failure aborts the run.
#[must_use]
pub fn gaussianise_pair(
    dlt: &DiscreteLegendre,
    pair: (usize, usize),
    cl: &[f64],
    mean_product: f64,
) -> GaussianisedPair {
    let xi = dlt.synthesis(cl);

    let mut failed_samples = 0;
    let xi_gauss: Vec<f64> = xi
        .iter()
        .map(|&value| {
            let argument = 1.0 + value / mean_product;
            if argument > 0.0 {
                argument.ln()
            } else {
                failed_samples += 1;
                0.0
            }
        })
        .collect();

    let cl_gauss = dlt.analysis(&xi_gauss);

    GaussianisedPair {
        pair,
        xi,
        xi_gauss,
        cl_gauss,
        failed_samples,
    }
}

/// Gaussianises every pair of the grid, in parallel, replacing each
/// spectrum with its auxiliary Gaussian counterpart.
///
/// Returns the per-pair products so callers can emit the intermediate
/// correlation functions.
///
/// # Errors
///
/// A warning is raised per pair with failed samples; once all pairs have
/// been scanned the run aborts if any sample failed anywhere.
pub fn gaussianise_all(
    dlt: &DiscreteLegendre,
    gridded: &mut GriddedSpectra,
    registry: &FieldRegistry,
    diag: &Diagnostics,
) -> Result<Vec<GaussianisedPair>> {
    let pairs: Vec<(usize, usize)> = gridded.pairs().map(|(pair, _)| pair).collect();

    let mut results: Vec<GaussianisedPair> = pairs
        .par_iter()
        .map(|&(i, j)| {
            let cl = gridded.get(i, j).unwrap_or_else(|| unreachable!());
            gaussianise_pair(dlt, (i, j), cl, mean_product(registry, i, j))
        })
        .collect();
    results.sort_by_key(|result| result.pair);

    let mut failed_pairs = 0;
    for result in &results {
        if result.failed_samples > 0 {
            failed_pairs += 1;
            diag.warn(format!(
                "gaussianisation of pair ({}, {}): {} non-positive sample(s) \
                 replaced by zero",
                result.pair.0, result.pair.1, result.failed_samples
            ));
        }
    }
    if failed_pairs > 0 {
        return Err(Error::Domain(format!(
            "gaussianisation failed for {failed_pairs} pair(s)"
        )));
    }

    for result in &results {
        gridded.set(result.pair.0, result.pair.1, result.cl_gauss.clone());
    }
    Ok(results)
}

/// The closed-form inverse used by tests and consistency checks:
/// ξ = M·(exp(ξ_G) − 1).
#[must_use]
pub fn lognormal_xi_from_gauss(xi_gauss: &[f64], mean_product: f64) -> Vec<f64> {
    xi_gauss
        .iter()
        .map(|&value| mean_product * (value.exp() - 1.0))
        .collect()
}

/// The pixel-space scale α = (μ + s)·exp(−v̂/2) that restores the target
/// mean after exponentiation.
#[must_use]
pub fn lognormal_scale(mean: f64, shift: f64, variance: f64) -> f64 {
    (mean + shift) * (-0.5 * variance).exp()
}

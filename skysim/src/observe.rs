//! Observed maps and catalogue emission: selection, Poisson sampling.

use crate::context::Diagnostics;
use crate::draw::SEED_OFFSET;
use crate::field::{FieldKind, FieldName, FieldRegistry};
use crate::synthesis::SkyMaps;
use rand::SeedableRng;
use rand_distr::{Distribution as SampleDistribution, Poisson};
use rand_pcg::Pcg64;
use rayon::prelude::*;

/// Policy of the observables stage.
#[derive(Clone, Copy, Debug)]
pub struct ObservePolicy {
    /// Draw Poisson counts instead of keeping the expected values.
    pub poisson: bool,
    /// Constant selection-function amplitude: expected counts per pixel at
    /// zero density contrast.
    pub selection_scale: f64,
    /// The run's master seed; the stage offsets its streams past the
    /// harmonic draw's block.
    pub seed: u64,
    /// Thread count of the harmonic draw, defining where that block ends.
    pub draw_threads: usize,
}

/// Applies the selection function to every density field and, when
/// configured, Poisson-samples the expected counts.
///
/// The expected count per pixel is S·(1 + δ); negative expectations are
/// clipped to zero with a warning per field. Convergence fields pass
/// through unchanged. The Poisson streams follow the same static-schedule
/// discipline as the harmonic draw, one PCG stream per field seeded past
/// the draw's block, so observed maps are reproducible for a fixed seed.
#[must_use]
pub fn observed_maps(
    maps: &SkyMaps,
    registry: &FieldRegistry,
    policy: &ObservePolicy,
    diag: &Diagnostics,
) -> SkyMaps {
    let pix = *maps.pixelization();
    let first_stream = policy.seed + (policy.draw_threads as u64 + 1) * SEED_OFFSET;

    let fields: Vec<Vec<f64>> = (0..maps.len())
        .map(|index| {
            let field = registry.field(index);
            if field.kind != FieldKind::Density {
                return maps.field(index).to_vec();
            }

            let mut clipped = 0_usize;
            let mut expected: Vec<f64> = maps
                .field(index)
                .iter()
                .map(|&delta| {
                    let counts = policy.selection_scale * (1.0 + delta);
                    if counts < 0.0 {
                        clipped += 1;
                        0.0
                    } else {
                        counts
                    }
                })
                .collect();
            if clipped > 0 {
                diag.warn(format!(
                    "field {}: {clipped} pixel(s) with negative expected counts \
                     clipped to zero",
                    field.name
                ));
            }

            if policy.poisson {
                let mut rng = Pcg64::seed_from_u64(first_stream + index as u64);
                for value in &mut expected {
                    if *value > 0.0 {
                        let sampler = Poisson::new(*value).unwrap_or_else(|_| unreachable!());
                        *value = sampler.sample(&mut rng);
                    }
                }
            }
            expected
        })
        .collect();

    SkyMaps::from_fields(pix, fields)
}

/// One catalogue row: a pixel of a density field with its observed count.
#[derive(Clone, Copy, Debug)]
pub struct CatalogEntry {
    /// The field the counts belong to.
    pub field: FieldName,
    /// Colatitude of the pixel centre, radians.
    pub theta: f64,
    /// Azimuth of the pixel centre, radians.
    pub phi: f64,
    /// Midpoint of the field's redshift window.
    pub redshift: f64,
    /// Observed (or expected) counts in the pixel.
    pub count: f64,
}

/// Flattens the observed maps into catalogue rows, skipping empty pixels
/// and non-density fields. Rows are ordered field-major, then by pixel.
#[must_use]
pub fn catalogue(observed: &SkyMaps, registry: &FieldRegistry) -> Vec<CatalogEntry> {
    let pix = observed.pixelization();
    let mut entries = Vec::new();

    for index in registry.indices_of(FieldKind::Density) {
        let field = registry.field(index);
        let rows: Vec<CatalogEntry> = observed
            .field(index)
            .par_iter()
            .enumerate()
            .filter(|&(_, &count)| count > 0.0)
            .map(|(pixel, &count)| {
                let (theta, phi) = pix.pixel_center(pixel);
                CatalogEntry {
                    field: field.name,
                    theta,
                    phi,
                    redshift: field.z_mid(),
                    count,
                }
            })
            .collect();
        entries.extend(rows);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Distribution, Field};
    use crate::pixel::Pixelization;
    use float_cmp::assert_approx_eq;

    fn registry() -> FieldRegistry {
        FieldRegistry::new(
            vec![
                Field {
                    name: FieldName { f: 1, z: 1 },
                    kind: FieldKind::Density,
                    mean: 0.0,
                    shift: 1.0,
                    zmin: 0.0,
                    zmax: 0.5,
                },
                Field {
                    name: FieldName { f: 2, z: 1 },
                    kind: FieldKind::Convergence,
                    mean: 0.0,
                    shift: 1.0,
                    zmin: 0.0,
                    zmax: 0.5,
                },
            ],
            Distribution::Gaussian,
        )
        .unwrap()
    }

    fn policy(poisson: bool) -> ObservePolicy {
        ObservePolicy {
            poisson,
            selection_scale: 10.0,
            seed: 42,
            draw_threads: 4,
        }
    }

    #[test]
    fn expected_counts_clip_and_scale() {
        let registry = registry();
        let pix = Pixelization::new(1).unwrap();
        let mut density = vec![0.5; pix.npix()];
        density[0] = -2.0;
        let kappa = vec![0.125; pix.npix()];
        let maps = SkyMaps::from_fields(pix, vec![density, kappa]);
        let diag = Diagnostics::new();

        let observed = observed_maps(&maps, &registry, &policy(false), &diag);

        assert_approx_eq!(f64, observed.field(0)[0], 0.0);
        assert_approx_eq!(f64, observed.field(0)[1], 15.0);
        // convergence fields pass through untouched
        assert_approx_eq!(f64, observed.field(1)[0], 0.125);
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn poisson_draw_is_reproducible_and_integer() {
        let registry = registry();
        let pix = Pixelization::new(2).unwrap();
        let maps = SkyMaps::constant(pix, &[0.0, 0.0]);
        let diag = Diagnostics::new();

        let first = observed_maps(&maps, &registry, &policy(true), &diag);
        let second = observed_maps(&maps, &registry, &policy(true), &diag);
        assert_eq!(first.field(0), second.field(0));
        assert!(first.field(0).iter().all(|&count| count.fract() == 0.0));

        // the sample mean tracks the expectation
        let total: f64 = first.field(0).iter().sum();
        let expectation = 10.0 * crate::convert::f64_from_usize(pix.npix());
        assert!((total - expectation).abs() < 0.2 * expectation);
    }

    #[test]
    fn catalogue_rows_cover_positive_pixels() {
        let registry = registry();
        let pix = Pixelization::new(1).unwrap();
        let mut density = vec![1.0; pix.npix()];
        density[3] = -1.0; // expected counts 0 there
        let maps = SkyMaps::from_fields(pix, vec![density, vec![1.0; pix.npix()]]);
        let diag = Diagnostics::new();

        let observed = observed_maps(&maps, &registry, &policy(false), &diag);
        let entries = catalogue(&observed, &registry);

        // one field, one empty pixel, convergence skipped
        assert_eq!(entries.len(), pix.npix() - 1);
        assert!(entries.iter().all(|entry| entry.field == FieldName { f: 1, z: 1 }));
        assert_approx_eq!(f64, entries[0].redshift, 0.25);
    }
}

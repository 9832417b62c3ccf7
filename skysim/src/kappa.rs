//! Line-of-sight integration of density slices into convergence fields.

use crate::context::Diagnostics;
use crate::error::Result;
use crate::field::{Field, FieldKind, FieldName, FieldRegistry};
use crate::synthesis::SkyMaps;
use rayon::prelude::*;

/// Lensing efficiency of a lens slice for a given source redshift.
///
/// The tabulation is deliberately behind a trait: the pipeline only needs
/// the weight per (lens, source) pair, so an externally tabulated kernel
/// can be dropped in without touching the integration.
pub trait LensingKernel: Sync {
    /// W(z_lens | z_source), the weight of the lens slice.
    fn weight(&self, z_lens: f64, z_source: f64) -> f64;
}

/// Closed-form kernel in a flat matter-dominated background, where the
/// comoving distance is χ(z) = (2c/H₀)·(1 − 1/√(1+z)).
#[derive(Clone, Copy, Debug)]
pub struct MatterDominatedKernel {
    /// Matter density parameter.
    pub omega_m: f64,
    /// H₀/c in the inverse of the distance unit used for χ.
    pub hubble_over_c: f64,
}

impl Default for MatterDominatedKernel {
    fn default() -> Self {
        Self {
            omega_m: 1.0,
            // h = 0.7 in units of c = 1, Mpc distances
            hubble_over_c: 7e-4 / 3.0,
        }
    }
}

impl MatterDominatedKernel {
    fn comoving(&self, z: f64) -> f64 {
        2.0 / self.hubble_over_c * (1.0 - (1.0 + z).sqrt().recip())
    }
}

impl LensingKernel for MatterDominatedKernel {
    fn weight(&self, z_lens: f64, z_source: f64) -> f64 {
        if z_lens <= 0.0 || z_lens >= z_source {
            return 0.0;
        }
        let chi_lens = self.comoving(z_lens);
        let chi_source = self.comoving(z_source);
        1.5 * self.omega_m
            * self.hubble_over_c
            * self.hubble_over_c
            * (1.0 + z_lens)
            * chi_lens
            * (chi_source - chi_lens)
            / chi_source
    }
}

/// Integrates every density field's foreground slices into a convergence
/// map and appends the results to the registry and map set.
///
/// Density slices of one physical field are expected to be contiguous in
/// redshift; gaps or overlaps only warn. The derived fields keep the source
/// slice's redshift window and are named with an `f` offset past the
/// largest existing physical field number. Returns the new field indices.
///
/// # Errors
///
/// Fails only when a derived name collides, which the offset rules out for
/// well-formed registries.
pub fn integrate_density_to_convergence(
    registry: &mut FieldRegistry,
    maps: &mut SkyMaps,
    kernel: &dyn LensingKernel,
    diag: &Diagnostics,
) -> Result<Vec<usize>> {
    let density: Vec<usize> = registry.indices_of(FieldKind::Density).collect();
    let name_offset = registry
        .fields()
        .iter()
        .map(|field| field.name.f)
        .max()
        .unwrap_or(0);

    // contiguity check per physical field, in ascending redshift
    let mut physical: Vec<u32> = density
        .iter()
        .map(|&index| registry.field(index).name.f)
        .collect();
    physical.sort_unstable();
    physical.dedup();
    for &f in &physical {
        let mut slices: Vec<&Field> = density
            .iter()
            .map(|&index| registry.field(index))
            .filter(|field| field.name.f == f)
            .collect();
        slices.sort_by(|a, b| a.zmin.total_cmp(&b.zmin));
        for pair in slices.windows(2) {
            if (pair[0].zmax - pair[1].zmin).abs() > 1e-9 {
                diag.warn(format!(
                    "density slices {} and {} of field f{f} are not contiguous",
                    pair[0].name, pair[1].name
                ));
            }
        }
    }

    let mut created = Vec::with_capacity(density.len());
    for &source_index in &density {
        let source = registry.field(source_index).clone();
        let z_source = source.z_mid();

        // accumulate the foreground slices of the same physical field
        let mut convergence = vec![0.0; maps.pixelization().npix()];
        for &lens_index in &density {
            let lens = registry.field(lens_index);
            if lens.name.f != source.name.f || lens.zmax > source.zmin + 1e-9 {
                continue;
            }
            let weight = kernel.weight(lens.z_mid(), z_source) * (lens.zmax - lens.zmin);
            if weight == 0.0 {
                continue;
            }
            convergence
                .par_iter_mut()
                .zip(maps.field(lens_index).par_iter())
                .for_each(|(target, &delta)| *target += weight * delta);
        }

        let index = registry.push_derived(Field {
            name: FieldName {
                f: source.name.f + name_offset,
                z: source.name.z,
            },
            kind: FieldKind::Convergence,
            mean: 0.0,
            shift: 1.0,
            zmin: source.zmin,
            zmax: source.zmax,
        })?;
        maps.push(convergence);
        created.push(index);
    }

    Ok(created)
}

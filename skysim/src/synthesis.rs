//! Pixel maps and the distribution stage that turns the auxiliary Gaussian
//! maps into the target fields.

use crate::alm::AlmSet;
use crate::context::Diagnostics;
use crate::convert::f64_from_usize;
use crate::field::{Distribution, FieldRegistry};
use crate::lognormal::lognormal_scale;
use crate::pixel::Pixelization;
use crate::sht::SphericalTransform;
use rayon::prelude::*;

/// One pixel map per field on a shared grid.
#[derive(Clone, Debug)]
pub struct SkyMaps {
    pix: Pixelization,
    maps: Vec<Vec<f64>>,
}

impl SkyMaps {
    /// Maps filled with a constant per field.
    #[must_use]
    pub fn constant(pix: Pixelization, values: &[f64]) -> Self {
        Self {
            pix,
            maps: values
                .iter()
                .map(|&value| vec![value; pix.npix()])
                .collect(),
        }
    }

    /// Wraps per-field pixel buffers.
    ///
    /// # Panics
    ///
    /// Panics if any buffer does not match the grid.
    #[must_use]
    pub fn from_fields(pix: Pixelization, maps: Vec<Vec<f64>>) -> Self {
        assert!(maps.iter().all(|map| map.len() == pix.npix()));
        Self { pix, maps }
    }

    /// The shared grid.
    #[must_use]
    pub const fn pixelization(&self) -> &Pixelization {
        &self.pix
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// `true` when no fields are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// The pixels of one field.
    ///
    /// # Panics
    ///
    /// Panics if `field` is out of bounds.
    #[must_use]
    pub fn field(&self, field: usize) -> &[f64] {
        &self.maps[field]
    }

    /// Mutable pixels of one field.
    ///
    /// # Panics
    ///
    /// Panics if `field` is out of bounds.
    pub fn field_mut(&mut self, field: usize) -> &mut Vec<f64> {
        &mut self.maps[field]
    }

    /// Appends a field map.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not match the grid.
    pub fn push(&mut self, map: Vec<f64>) {
        assert_eq!(map.len(), self.pix.npix());
        self.maps.push(map);
    }

    /// Empirical mean and unbiased variance of one field map.
    ///
    /// # Panics
    ///
    /// Panics if `field` is out of bounds.
    #[must_use]
    pub fn moments(&self, field: usize) -> (f64, f64) {
        let map = &self.maps[field];
        let n = f64_from_usize(map.len());
        let mean = map.iter().sum::<f64>() / n;
        let variance = map
            .iter()
            .map(|&value| (value - mean) * (value - mean))
            .sum::<f64>()
            / (n - 1.0);
        (mean, variance)
    }
}

/// Inverse scalar transform of every field's coefficients.
#[must_use]
pub fn synthesize_maps(sht: &SphericalTransform, alms: &AlmSet) -> SkyMaps {
    let maps = (0..alms.len())
        .map(|field| sht.synthesize(alms.field(field)))
        .collect();
    SkyMaps::from_fields(*sht.pixelization(), maps)
}

/// Applies the run's distribution to the auxiliary Gaussian maps in place.
///
/// Lognormal fields are exponentiated pixel by pixel with the per-field
/// scale α = (μ+s)·exp(−v̂/2), which restores the target mean; fields whose
/// μ + s is not positive cannot be exponentiated and stay Gaussian with a
/// warning (the registry already rejects density fields in that state).
/// Gaussian fields are shifted by their target mean.
pub fn apply_distribution(maps: &mut SkyMaps, registry: &FieldRegistry, diag: &Diagnostics) {
    for index in 0..registry.len().min(maps.len()) {
        let field = registry.field(index).clone();
        match registry.distribution() {
            Distribution::Homogeneous => {
                maps.field_mut(index).fill(field.mean);
            }
            Distribution::Gaussian => {
                maps.field_mut(index)
                    .par_iter_mut()
                    .for_each(|value| *value += field.mean);
            }
            Distribution::Lognormal => {
                if field.mean + field.shift <= 0.0 {
                    diag.warn(format!(
                        "field {}: mean + shift is not positive, leaving the \
                         field Gaussian",
                        field.name
                    ));
                    maps.field_mut(index)
                        .par_iter_mut()
                        .for_each(|value| *value += field.mean);
                    continue;
                }

                let (mean, variance) = maps.moments(index);
                log::debug!(
                    "field {}: auxiliary map mean {mean:e}, variance {variance:e}",
                    field.name
                );
                let scale = lognormal_scale(field.mean, field.shift, variance);
                let shift = field.shift;
                maps.field_mut(index)
                    .par_iter_mut()
                    .for_each(|value| *value = scale.mul_add(value.exp(), -shift));
            }
        }
    }
}

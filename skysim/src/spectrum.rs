//! Angular power spectrum samples and the two input loaders.
//!
//! Spectra arrive either as one two-column file per ordered pair, probed
//! under a common filename prefix, or as a single multi-column table whose
//! header names the pairs. Both forms produce a [`SpectrumSet`], which the
//! filters mutate in place and the resampling turns into the integer-ℓ
//! [`GriddedSpectra`] consumed by the covariance assembler.

use crate::context::Diagnostics;
use crate::error::{Error, Result};
use crate::field::{FieldName, FieldRegistry};
use crate::interp::Interp1d;
use std::fs;
use std::path::Path;

/// How the multipole ℓ = 1 is filled when the input does not sample it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DipolePolicy {
    /// Set Cℓ(1) to zero.
    Clamp,
    /// Linearly extrapolate Cℓ(1) from the two lowest input samples.
    Extrapolate,
}

/// The (ℓ, Cℓ) samples of one ordered field pair.
#[derive(Clone, Debug)]
pub struct SpectrumSample {
    ell: Vec<f64>,
    cl: Vec<f64>,
}

impl SpectrumSample {
    /// Builds a sample set; `ell` must be strictly increasing with at least
    /// two entries.
    ///
    /// # Errors
    ///
    /// Rejects grids that violate the ℓ-monotonicity or minimum-length
    /// invariants.
    pub fn new(ell: Vec<f64>, cl: Vec<f64>) -> Result<Self> {
        if ell.len() != cl.len() {
            return Err(Error::Input(format!(
                "spectrum: {} multipoles but {} values",
                ell.len(),
                cl.len()
            )));
        }
        if ell.len() < 2 {
            return Err(Error::Input(format!(
                "spectrum: need at least 2 samples, got {}",
                ell.len()
            )));
        }
        if ell.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::Input(
                "spectrum: multipoles must be strictly increasing".to_owned(),
            ));
        }

        Ok(Self { ell, cl })
    }

    /// The sampled multipoles.
    #[must_use]
    pub fn ell(&self) -> &[f64] {
        &self.ell
    }

    /// The sampled spectrum values.
    #[must_use]
    pub fn cl(&self) -> &[f64] {
        &self.cl
    }

    /// Split borrow used by the in-place filters: the ℓ grid stays frozen
    /// while the values are rewritten.
    pub fn parts_mut(&mut self) -> (&[f64], &mut [f64]) {
        (&self.ell, &mut self.cl)
    }

    /// Drops all samples above `ell_limit`.
    ///
    /// # Errors
    ///
    /// Fails when fewer than two samples survive.
    pub fn crop(&mut self, ell_limit: f64) -> Result<()> {
        let keep = self.ell.partition_point(|&ell| ell <= ell_limit);
        if keep < 2 {
            return Err(Error::Input(format!(
                "cropping at ell = {ell_limit} leaves {keep} samples"
            )));
        }
        self.ell.truncate(keep);
        self.cl.truncate(keep);
        Ok(())
    }

    /// Resamples onto the integer grid ℓ ∈ [0, `lmax`].
    ///
    /// ℓ = 0 is required by the discrete Legendre transform and always set
    /// to zero. ℓ = 1 follows `dipole` when the input does not sample it;
    /// extrapolation from an input whose lowest sample sits at ℓ = 0 has no
    /// well-defined base, so that case clamps and warns. Multipoles outside
    /// the sampled range are zero.
    ///
    /// # Errors
    ///
    /// Propagates interpolation-grid construction failures.
    pub fn resample(
        &self,
        lmax: usize,
        dipole: DipolePolicy,
        diag: &Diagnostics,
    ) -> Result<Vec<f64>> {
        let interp = Interp1d::new(self.ell.clone(), self.cl.clone())?;
        let mut grid = vec![0.0; lmax + 1];

        grid[1] = if interp.min_x() > 0.0 && interp.min_x() <= 1.0 {
            // the input genuinely samples the dipole region
            interp.eval(1.0).unwrap_or(0.0)
        } else {
            match dipole {
                DipolePolicy::Clamp => 0.0,
                DipolePolicy::Extrapolate if interp.min_x() > 1.0 => interp.extrapolate_low(1.0),
                DipolePolicy::Extrapolate => {
                    diag.warn(
                        "dipole extrapolation requested but the input starts at ell = 0; \
                         clamping Cl(1) to zero",
                    );
                    0.0
                }
            }
        };

        for (ell, value) in grid.iter_mut().enumerate().skip(2) {
            #[allow(clippy::cast_precision_loss)]
            if let Some(interpolated) = interp.eval(ell as f64) {
                *value = interpolated;
            }
        }

        Ok(grid)
    }
}

/// Collection of loaded spectra, indexed by ordered field pair.
#[derive(Debug)]
pub struct SpectrumSet {
    nfields: usize,
    samples: Vec<Option<SpectrumSample>>,
    input_order: Vec<(usize, usize)>,
}

impl SpectrumSet {
    /// An empty set over `nfields` fields.
    #[must_use]
    pub fn empty(nfields: usize) -> Self {
        Self {
            nfields,
            samples: (0..nfields * nfields).map(|_| None).collect(),
            input_order: Vec::new(),
        }
    }

    /// Number of fields this set is indexed over.
    #[must_use]
    pub fn nfields(&self) -> usize {
        self.nfields
    }

    /// The sample for the ordered pair (i, j), if present.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> Option<&SpectrumSample> {
        self.samples[i * self.nfields + j].as_ref()
    }

    /// Stores a sample for the ordered pair (i, j), recording input order.
    pub fn insert(&mut self, i: usize, j: usize, sample: SpectrumSample) {
        if self.samples[i * self.nfields + j].replace(sample).is_none() {
            self.input_order.push((i, j));
        }
    }

    /// Ordered pairs in the order they were inserted.
    #[must_use]
    pub fn input_order(&self) -> &[(usize, usize)] {
        &self.input_order
    }

    /// Iterates over the present pairs in insertion order.
    pub fn pairs(&self) -> impl Iterator<Item = ((usize, usize), &SpectrumSample)> {
        self.input_order
            .iter()
            .map(move |&(i, j)| ((i, j), self.get(i, j).unwrap_or_else(|| unreachable!())))
    }

    /// Runs `visit` over every present sample in row-major pair order,
    /// stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `visit`.
    pub fn try_for_each_mut(
        &mut self,
        mut visit: impl FnMut((usize, usize), &mut SpectrumSample) -> Result<()>,
    ) -> Result<()> {
        for flat in 0..self.samples.len() {
            if let Some(sample) = self.samples[flat].as_mut() {
                visit((flat / self.nfields, flat % self.nfields), sample)?;
            }
        }
        Ok(())
    }

    /// Loads spectra from `source`: a path to a multi-column table when the
    /// path names a file, otherwise a filename prefix probed per ordered
    /// pair as `<prefix>f{af}z{az}f{bf}z{bz}.dat`.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed files, and, unless `policy`
    /// allows missing pairs, when both (i, j) and (j, i) are absent for some
    /// unordered pair.
    pub fn load(
        source: &str,
        registry: &FieldRegistry,
        policy: &LoadPolicy,
        diag: &Diagnostics,
    ) -> Result<Self> {
        let mut set = if Path::new(source).is_file() {
            Self::load_table(source, registry, diag)?
        } else {
            Self::load_prefix(source, registry)?
        };

        if let Some(limit) = policy.crop_limit {
            set.try_for_each_mut(|_, sample| sample.crop(limit))?;
        }

        set.check_partners(registry, policy.allow_missing)?;
        Ok(set)
    }

    fn load_prefix(prefix: &str, registry: &FieldRegistry) -> Result<Self> {
        let nfields = registry.len();
        let mut set = Self::empty(nfields);

        for i in 0..nfields {
            for j in 0..nfields {
                let path = format!(
                    "{prefix}{}{}.dat",
                    registry.index_to_name(i),
                    registry.index_to_name(j)
                );
                if !Path::new(&path).is_file() {
                    continue;
                }
                let text = fs::read_to_string(&path)?;
                let (ell, cl) = parse_two_columns(&text)
                    .map_err(|err| Error::Input(format!("{path}: {err}")))?;
                set.insert(
                    i,
                    j,
                    SpectrumSample::new(ell, cl)
                        .map_err(|err| Error::Input(format!("{path}: {err}")))?,
                );
            }
        }

        if set.input_order.is_empty() {
            return Err(Error::Input(format!(
                "no spectrum files found under prefix '{prefix}'"
            )));
        }
        Ok(set)
    }

    fn load_table(path: &str, registry: &FieldRegistry, diag: &Diagnostics) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let header = lines
            .next()
            .ok_or_else(|| Error::Input(format!("{path}: empty spectrum table")))?;
        let labels: Vec<_> = header
            .trim_start_matches('#')
            .split_whitespace()
            .collect();
        if labels.len() < 2 {
            return Err(Error::Input(format!(
                "{path}: header must name the ell column and at least one pair"
            )));
        }

        // column -> ordered pair, None for labels we cannot place
        let columns: Vec<Option<(usize, usize)>> = labels[1..]
            .iter()
            .map(|label| {
                let Some((a, b)) = parse_pair_label(label) else {
                    diag.warn(format!("{path}: skipping unrecognised column '{label}'"));
                    return None;
                };
                match (registry.name_to_index(a), registry.name_to_index(b)) {
                    (Some(i), Some(j)) => Some((i, j)),
                    _ => {
                        diag.warn(format!("{path}: skipping unknown field pair '{label}'"));
                        None
                    }
                }
            })
            .collect();

        let mut ell = Vec::new();
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); columns.len()];
        for line in lines.filter(|line| !line.starts_with('#')) {
            let row: Vec<f64> = line
                .split_whitespace()
                .map(str::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| Error::Input(format!("{path}: {err}")))?;
            if row.len() != columns.len() + 1 {
                return Err(Error::Input(format!(
                    "{path}: expected {} columns, found {}",
                    columns.len() + 1,
                    row.len()
                )));
            }
            ell.push(row[0]);
            for (column, &value) in values.iter_mut().zip(&row[1..]) {
                column.push(value);
            }
        }

        let mut set = Self::empty(registry.len());
        for (pair, column) in columns.iter().zip(values) {
            if let &Some((i, j)) = pair {
                set.insert(
                    i,
                    j,
                    SpectrumSample::new(ell.clone(), column)
                        .map_err(|err| Error::Input(format!("{path}: {err}")))?,
                );
            }
        }

        if set.input_order.is_empty() {
            return Err(Error::Input(format!(
                "{path}: no usable spectrum columns"
            )));
        }
        Ok(set)
    }

    fn check_partners(&self, registry: &FieldRegistry, allow_missing: bool) -> Result<()> {
        if allow_missing {
            return Ok(());
        }
        for i in 0..self.nfields {
            for j in i..self.nfields {
                if self.get(i, j).is_none() && self.get(j, i).is_none() {
                    return Err(Error::Input(format!(
                        "no spectrum for pair ({}, {}) in either order",
                        registry.index_to_name(i),
                        registry.index_to_name(j)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resamples every present pair onto the integer grid [0, `lmax`].
    ///
    /// # Errors
    ///
    /// Propagates per-pair resampling failures.
    pub fn resample_all(
        &self,
        lmax: usize,
        dipole: DipolePolicy,
        diag: &Diagnostics,
    ) -> Result<GriddedSpectra> {
        let mut gridded = GriddedSpectra::empty(self.nfields, lmax);
        for ((i, j), sample) in self.pairs() {
            gridded.set(i, j, sample.resample(lmax, dipole, diag)?);
        }
        Ok(gridded)
    }
}

/// Loading policy flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadPolicy {
    /// Treat pairs absent in both orders as zero instead of failing.
    pub allow_missing: bool,
    /// Crop loaded samples to ℓ ≤ limit (the `CROP_CL` contract).
    pub crop_limit: Option<f64>,
}

/// Per-pair spectra on the shared integer multipole grid [0, lmax].
///
/// This is the pair-major data product; the covariance assembler transposes
/// it into the ℓ-major matrix stack. The two never share storage.
#[derive(Clone, Debug)]
pub struct GriddedSpectra {
    nfields: usize,
    lmax: usize,
    rows: Vec<Option<Vec<f64>>>,
}

impl GriddedSpectra {
    /// An empty grid over `nfields` fields up to `lmax`.
    #[must_use]
    pub fn empty(nfields: usize, lmax: usize) -> Self {
        Self {
            nfields,
            lmax,
            rows: (0..nfields * nfields).map(|_| None).collect(),
        }
    }

    /// Number of fields.
    #[must_use]
    pub fn nfields(&self) -> usize {
        self.nfields
    }

    /// Largest multipole of the grid.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// The gridded spectrum of the ordered pair (i, j), if present.
    ///
    /// # Panics
    ///
    /// Panics if the indices are out of bounds.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> Option<&[f64]> {
        self.rows[i * self.nfields + j].as_deref()
    }

    /// Stores the gridded spectrum of the ordered pair (i, j).
    ///
    /// # Panics
    ///
    /// Panics if `values` does not cover exactly [0, lmax].
    pub fn set(&mut self, i: usize, j: usize, values: Vec<f64>) {
        assert_eq!(values.len(), self.lmax + 1);
        self.rows[i * self.nfields + j] = Some(values);
    }

    /// Iterates over present pairs in row-major order.
    pub fn pairs(&self) -> impl Iterator<Item = ((usize, usize), &[f64])> {
        self.rows.iter().enumerate().filter_map(move |(flat, row)| {
            row.as_deref()
                .map(|values| ((flat / self.nfields, flat % self.nfields), values))
        })
    }
}

fn parse_two_columns(text: &str) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut ell = Vec::new();
    let mut cl = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (Some(first), Some(second), None) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(Error::Input(format!("expected two columns in '{line}'")));
        };
        ell.push(
            first
                .parse()
                .map_err(|_| Error::Input(format!("bad multipole '{first}'")))?,
        );
        cl.push(
            second
                .parse()
                .map_err(|_| Error::Input(format!("bad spectrum value '{second}'")))?,
        );
    }

    Ok((ell, cl))
}

/// Parses a table header label of the form `Cl-f{af}z{az}f{bf}z{bz}`.
#[must_use]
pub fn parse_pair_label(label: &str) -> Option<(FieldName, FieldName)> {
    let rest = label.strip_prefix("Cl-")?;
    let (af, rest) = parse_field_component(rest, 'f')?;
    let (az, rest) = parse_field_component(rest, 'z')?;
    let (bf, rest) = parse_field_component(rest, 'f')?;
    let (bz, rest) = parse_field_component(rest, 'z')?;
    if !rest.is_empty() {
        return None;
    }
    Some((FieldName { f: af, z: az }, FieldName { f: bf, z: bz }))
}

fn parse_field_component(text: &str, tag: char) -> Option<(u32, &str)> {
    let rest = text.strip_prefix(tag)?;
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let value = rest[..digits].parse().ok()?;
    Some((value, &rest[digits..]))
}

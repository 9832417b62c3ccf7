//! The key-value run configuration and its command-line overrides.

use anyhow::{bail, Context, Result};
use skysim::context::Diagnostics;
use skysim::field::Distribution;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A named pipeline stage; every stage doubles as an output key and as a
/// target for `EXIT_AT`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Filtered spectra on the integer grid.
    ClOut,
    /// Correlation functions before gaussianisation.
    XiOut,
    /// Correlation functions after gaussianisation.
    GxiOut,
    /// Auxiliary Gaussian spectra.
    GclOut,
    /// Per-ℓ covariance matrices as assembled.
    CovlPrefix,
    /// Per-ℓ covariance matrices after regularisation.
    RegcovlPrefix,
    /// Per-ℓ Cholesky triangles.
    CholPrefix,
    /// Auxiliary harmonic coefficients.
    AuxalmOut,
    /// Auxiliary Gaussian maps.
    AuxmapOut,
    /// Final field maps.
    MapOut,
    /// Shear component maps.
    ShearMapOut,
    /// Observed (selection-applied) maps.
    ObsmapOut,
    /// The point catalogue.
    CatalogOut,
}

impl Stage {
    /// The configuration key this stage is named by.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::ClOut => "CL_OUT",
            Self::XiOut => "XI_OUT",
            Self::GxiOut => "GXI_OUT",
            Self::GclOut => "GCL_OUT",
            Self::CovlPrefix => "COVL_PREFIX",
            Self::RegcovlPrefix => "REGCOVL_PREFIX",
            Self::CholPrefix => "CHOL_PREFIX",
            Self::AuxalmOut => "AUXALM_OUT",
            Self::AuxmapOut => "AUXMAP_OUT",
            Self::MapOut => "MAP_OUT",
            Self::ShearMapOut => "SHEAR_MAP_OUT",
            Self::ObsmapOut => "OBSMAP_OUT",
            Self::CatalogOut => "CATALOG_OUT",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.key())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        const ALL: [Stage; 13] = [
            Stage::ClOut,
            Stage::XiOut,
            Stage::GxiOut,
            Stage::GclOut,
            Stage::CovlPrefix,
            Stage::RegcovlPrefix,
            Stage::CholPrefix,
            Stage::AuxalmOut,
            Stage::AuxmapOut,
            Stage::MapOut,
            Stage::ShearMapOut,
            Stage::ObsmapOut,
            Stage::CatalogOut,
        ];
        ALL.into_iter()
            .find(|stage| stage.key() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Where each optional intermediate product goes; `None` skips the write.
#[derive(Clone, Debug, Default)]
pub struct Outputs {
    /// Filtered spectra table.
    pub cl_out: Option<PathBuf>,
    /// ξ(θ) table.
    pub xi_out: Option<PathBuf>,
    /// ξ_G(θ) table.
    pub gxi_out: Option<PathBuf>,
    /// Auxiliary Gaussian spectra table.
    pub gcl_out: Option<PathBuf>,
    /// Per-ℓ covariance file prefix.
    pub covl_prefix: Option<String>,
    /// Per-ℓ regularised covariance file prefix.
    pub regcovl_prefix: Option<String>,
    /// Per-ℓ Cholesky triangle file prefix.
    pub chol_prefix: Option<String>,
    /// Auxiliary aℓm table.
    pub auxalm_out: Option<PathBuf>,
    /// Auxiliary Gaussian map table.
    pub auxmap_out: Option<PathBuf>,
    /// Final map table.
    pub map_out: Option<PathBuf>,
    /// Shear map table.
    pub shear_map_out: Option<PathBuf>,
    /// Observed map table.
    pub obsmap_out: Option<PathBuf>,
    /// Catalogue table.
    pub catalog_out: Option<PathBuf>,
}

/// The fully validated run configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Statistical model of the run.
    pub dist: Distribution,
    /// Path of the FIELDS_INFO registry file.
    pub fields_info: PathBuf,
    /// Spectrum source: a table file or a per-pair filename prefix.
    pub cl_prefix: String,
    /// Smallest simulated multipole.
    pub lmin: usize,
    /// Largest simulated multipole.
    pub lmax: usize,
    /// Grid resolution.
    pub nside: usize,
    /// Constant spectrum rescale.
    pub scale_cls: f64,
    /// Gaussian beam width in arc-minutes; non-positive disables the beam.
    pub winfunc_sigma: f64,
    /// Apply the squared pixel window.
    pub apply_pixwin: bool,
    /// Two-column pixel window table, required with `apply_pixwin`.
    pub pixwin_file: Option<PathBuf>,
    /// Exponential suppression scale; negative disables.
    pub suppress_l: f64,
    /// Exponential suppression steepness.
    pub sup_index: f64,
    /// Treat pairs missing in both orders as zero.
    pub allow_miss_cl: bool,
    /// Crop input spectra to ℓ ≤ 4·Nside.
    pub crop_cl: bool,
    /// Extrapolate Cℓ(1) from the low-ℓ tail instead of clamping.
    pub extrap_dipole: bool,
    /// Variance inflation applied on correlations outside [−1, 1].
    pub badcorr_frac: f64,
    /// Zero-diagonal replacement fraction; zero disables.
    pub mindiag_frac: f64,
    /// Regulariser step budget.
    pub reg_maxsteps: usize,
    /// Master seed of the realisation.
    pub rndseed: u64,
    /// Integrate density slices into convergence fields.
    pub dens2kappa: bool,
    /// Poisson-sample the observed maps instead of keeping expectations.
    pub poisson: bool,
    /// Selection-function amplitude for the observables stage.
    pub selec_scale: f64,
    /// Fixed worker thread count; zero uses the pool default.
    pub nthreads: usize,
    /// Stop right after the named stage.
    pub exit_at: Option<Stage>,
    /// Intermediate product destinations.
    pub outputs: Outputs,
}

/// Parses the `KEY: value` file format. `#` starts a comment; blank lines
/// are skipped.
///
/// # Errors
///
/// Fails on lines without a `:` separator or with an empty key.
pub fn parse_entries(text: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("configuration line {}: expected 'KEY: value'", lineno + 1);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("configuration line {}: empty key", lineno + 1);
        }
        entries.push((key.to_owned(), value.trim().to_owned()));
    }
    Ok(entries)
}

/// Parses one command-line override, accepting both `KEY: value` and
/// `KEY=value`.
///
/// # Errors
///
/// Fails when neither separator is present.
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    let split = raw
        .split_once(':')
        .or_else(|| raw.split_once('='))
        .with_context(|| format!("override '{raw}' is not of the form KEY=VALUE"))?;
    Ok((split.0.trim().to_owned(), split.1.trim().to_owned()))
}

struct Lookup {
    entries: Vec<(String, String)>,
    used: Vec<bool>,
}

impl Lookup {
    fn new(entries: Vec<(String, String)>) -> Self {
        let used = vec![false; entries.len()];
        Self { entries, used }
    }

    /// Last occurrence wins, so overrides appended after the file entries
    /// shadow them.
    fn take(&mut self, key: &str) -> Option<String> {
        let mut found = None;
        for (index, (entry_key, value)) in self.entries.iter().enumerate() {
            if entry_key == key {
                self.used[index] = true;
                found = Some(value.clone());
            }
        }
        found
    }

    fn unused(&self) -> Option<&str> {
        self.entries
            .iter()
            .zip(&self.used)
            .find(|(_, &used)| !used)
            .map(|((key, _), _)| key.as_str())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .ok()
        .with_context(|| format!("{key}: cannot parse '{value}'"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => bail!("{key}: expected 0 or 1, got '{value}'"),
    }
}

pub(crate) fn parse_dist(value: &str) -> Result<Distribution> {
    match value {
        "LOGNORMAL" => Ok(Distribution::Lognormal),
        "GAUSSIAN" => Ok(Distribution::Gaussian),
        "HOMOGENEOUS" => Ok(Distribution::Homogeneous),
        _ => bail!("DIST: expected LOGNORMAL, GAUSSIAN or HOMOGENEOUS, got '{value}'"),
    }
}

impl Settings {
    /// Builds and validates the configuration from file entries plus
    /// overrides (appended last, so they win).
    ///
    /// # Errors
    ///
    /// Fails on unknown keys, missing required keys, unparsable values and
    /// inconsistent ranges.
    pub fn build(
        mut entries: Vec<(String, String)>,
        overrides: Vec<(String, String)>,
        diag: &Diagnostics,
    ) -> Result<Self> {
        entries.extend(overrides);
        let mut lookup = Lookup::new(entries);

        let dist = parse_dist(
            &lookup
                .take("DIST")
                .context("DIST is required")?,
        )?;
        let fields_info = PathBuf::from(
            lookup
                .take("FIELDS_INFO")
                .context("FIELDS_INFO is required")?,
        );
        let cl_prefix = lookup.take("CL_PREFIX").context("CL_PREFIX is required")?;

        let lrange = lookup.take("LRANGE").context("LRANGE is required")?;
        let mut lrange_tokens = lrange.split_whitespace();
        let (Some(lmin), Some(lmax), None) = (
            lrange_tokens.next(),
            lrange_tokens.next(),
            lrange_tokens.next(),
        ) else {
            bail!("LRANGE: expected two integers, got '{lrange}'");
        };
        let lmin: usize = parse_value("LRANGE", lmin)?;
        let lmax: usize = parse_value("LRANGE", lmax)?;
        if lmin < 1 || lmin > lmax {
            bail!("LRANGE: need 1 <= lmin <= lmax, got {lmin} {lmax}");
        }

        let nside: usize = parse_value("NSIDE", &lookup.take("NSIDE").context("NSIDE is required")?)?;
        if nside == 0 {
            bail!("NSIDE: must be positive");
        }
        if lmax > 4 * nside {
            bail!("LRANGE: lmax {lmax} exceeds 4 Nside = {}", 4 * nside);
        }
        if lmax + 1 > 3 * nside {
            diag.warn(format!(
                "lmax {lmax} is beyond the well-resolved range of Nside {nside}"
            ));
        }

        let crop_cl = match lookup.take("CROP_CL") {
            None => false,
            Some(value) => {
                let code: i64 = parse_value("CROP_CL", &value)?;
                match code {
                    0 => false,
                    1 => true,
                    other => {
                        diag.warn(format!("CROP_CL: unexpected value {other}, assuming 0"));
                        false
                    }
                }
            }
        };

        let take_flag = |lookup: &mut Lookup, key: &str| -> Result<bool> {
            lookup.take(key).map_or(Ok(false), |value| parse_flag(key, &value))
        };
        let take_f64 = |lookup: &mut Lookup, key: &str, default: f64| -> Result<f64> {
            lookup
                .take(key)
                .map_or(Ok(default), |value| parse_value(key, &value))
        };

        let apply_pixwin = take_flag(&mut lookup, "APPLY_PIXWIN")?;
        let pixwin_file = lookup.take("PIXWIN_FILE").map(PathBuf::from);
        if apply_pixwin && pixwin_file.is_none() {
            bail!("APPLY_PIXWIN: 1 requires PIXWIN_FILE");
        }

        let rndseed: u64 = lookup
            .take("RNDSEED")
            .map_or(Ok(1), |value| parse_value("RNDSEED", &value))?;

        let outputs = Outputs {
            cl_out: lookup.take("CL_OUT").map(PathBuf::from),
            xi_out: lookup.take("XI_OUT").map(PathBuf::from),
            gxi_out: lookup.take("GXI_OUT").map(PathBuf::from),
            gcl_out: lookup.take("GCL_OUT").map(PathBuf::from),
            covl_prefix: lookup.take("COVL_PREFIX"),
            regcovl_prefix: lookup.take("REGCOVL_PREFIX"),
            chol_prefix: lookup.take("CHOL_PREFIX"),
            auxalm_out: lookup.take("AUXALM_OUT").map(PathBuf::from),
            auxmap_out: lookup.take("AUXMAP_OUT").map(PathBuf::from),
            map_out: lookup.take("MAP_OUT").map(PathBuf::from),
            shear_map_out: lookup.take("SHEAR_MAP_OUT").map(PathBuf::from),
            obsmap_out: lookup.take("OBSMAP_OUT").map(PathBuf::from),
            catalog_out: lookup.take("CATALOG_OUT").map(PathBuf::from),
        };

        let exit_at = lookup
            .take("EXIT_AT")
            .map(|value| {
                Stage::from_str(&value).map_err(|err| anyhow::anyhow!("EXIT_AT: {err}"))
            })
            .transpose()?;

        let settings = Self {
            dist,
            fields_info,
            cl_prefix,
            lmin,
            lmax,
            nside,
            scale_cls: take_f64(&mut lookup, "SCALE_CLS", 1.0)?,
            winfunc_sigma: take_f64(&mut lookup, "WINFUNC_SIGMA", -1.0)?,
            apply_pixwin,
            pixwin_file,
            suppress_l: take_f64(&mut lookup, "SUPPRESS_L", -1.0)?,
            sup_index: take_f64(&mut lookup, "SUP_INDEX", -1.0)?,
            allow_miss_cl: take_flag(&mut lookup, "ALLOW_MISS_CL")?,
            crop_cl,
            extrap_dipole: take_flag(&mut lookup, "EXTRAP_DIPOLE")?,
            badcorr_frac: take_f64(&mut lookup, "BADCORR_FRAC", 0.0)?,
            mindiag_frac: take_f64(&mut lookup, "MINDIAG_FRAC", 0.0)?,
            reg_maxsteps: lookup
                .take("REG_MAXSTEPS")
                .map_or(Ok(40), |value| parse_value("REG_MAXSTEPS", &value))?,
            rndseed,
            dens2kappa: take_flag(&mut lookup, "DENS2KAPPA")?,
            poisson: take_flag(&mut lookup, "POISSON")?,
            selec_scale: take_f64(&mut lookup, "SELEC_SCALE", 1.0)?,
            nthreads: lookup
                .take("NTHREADS")
                .map_or(Ok(0), |value| parse_value("NTHREADS", &value))?,
            exit_at,
            outputs,
        };

        if let Some(unknown) = lookup.unused() {
            bail!("unknown configuration key '{unknown}'");
        }
        Ok(settings)
    }
}

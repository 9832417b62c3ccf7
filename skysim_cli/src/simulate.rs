//! The `simulate` subcommand: the full pipeline, stage by stage.

use super::config::{self, Settings, Stage};
use super::helpers::{self, XiKind};
use super::{GlobalConfiguration, Subcommand};
use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use skysim::alm::AlmSet;
use skysim::context::Diagnostics;
use skysim::covariance::{AssemblyPolicy, CovarianceStack};
use skysim::draw::{draw_alm, DrawPlan};
use skysim::field::{Distribution, FieldKind, FieldRegistry};
use skysim::filter::{self, Filter};
use skysim::kappa::{integrate_density_to_convergence, MatterDominatedKernel};
use skysim::legendre::DiscreteLegendre;
use skysim::lognormal;
use skysim::observe::{self, ObservePolicy};
use skysim::pixel::Pixelization;
use skysim::shear::build_shear;
use skysim::spectrum::{DipolePolicy, GriddedSpectra, LoadPolicy, SpectrumSet};
use skysim::sht::SphericalTransform;
use skysim::synthesis::{self, SkyMaps};
use std::path::PathBuf;
use std::process::ExitCode;

/// Generates one realisation of the configured fields.
#[derive(Parser)]
pub struct Opts {
    /// Path of the run configuration file.
    #[arg(value_hint = ValueHint::FilePath)]
    config: PathBuf,
    /// Configuration overrides of the form KEY=VALUE, applied last.
    #[arg(value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    /// Number of worker threads; 0 keeps the pool default.
    #[arg(default_value_t = 0, long)]
    threads: usize,
}

impl Subcommand for Opts {
    fn run(&self, _cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let diag = Diagnostics::new();

        let entries = config::parse_entries(&helpers::read_text(&self.config)?)
            .with_context(|| format!("in '{}'", self.config.display()))?;
        let overrides = self
            .overrides
            .iter()
            .map(|raw| config::parse_override(raw))
            .collect::<Result<Vec<_>>>()?;
        let mut settings = Settings::build(entries, overrides, &diag)?;
        if self.threads > 0 {
            settings.nthreads = self.threads;
        }

        let outcome = if settings.nthreads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(settings.nthreads)
                .build()
                .context("unable to build the worker pool")?;
            pool.install(|| run_stages(&settings, &diag))
        } else {
            run_stages(&settings, &diag)
        };

        println!("{} warning(s)", diag.warning_count());
        outcome.map(|_| ExitCode::SUCCESS)
    }
}

/// `true` when the run is configured to stop right after `stage`.
fn stops_after(settings: &Settings, stage: Stage) -> bool {
    if settings.exit_at == Some(stage) {
        log::info!("stopping after {stage} as requested");
        true
    } else {
        false
    }
}

/// Effective thread count of the static schedules.
fn thread_count(settings: &Settings) -> usize {
    if settings.nthreads > 0 {
        settings.nthreads
    } else {
        rayon::current_num_threads()
    }
}

#[allow(clippy::cast_precision_loss)]
fn nside_f64(nside: usize) -> f64 {
    nside as f64
}

/// Runs the pipeline; `Ok(())` covers both completion and a deliberate
/// `EXIT_AT` stop.
#[allow(clippy::too_many_lines)]
fn run_stages(settings: &Settings, diag: &Diagnostics) -> Result<()> {
    let pix = Pixelization::new(settings.nside)?;

    let mut registry = FieldRegistry::from_fields_info(
        &helpers::read_text(&settings.fields_info)?,
        settings.dist,
    )?;
    log::info!("{} field(s) registered", registry.len());

    // ---- spectra: load, filter, resample --------------------------------
    let mut gridded = if settings.dist == Distribution::Homogeneous {
        // the harmonic stages are skipped entirely; an empty grid keeps the
        // downstream bookkeeping uniform
        GriddedSpectra::empty(registry.len(), settings.lmax)
    } else {
        let mut spectra = SpectrumSet::load(
            &settings.cl_prefix,
            &registry,
            &LoadPolicy {
                allow_missing: settings.allow_miss_cl,
                crop_limit: settings.crop_cl.then(|| 4.0 * nside_f64(settings.nside)),
            },
            diag,
        )?;
        registry.record_input_order(spectra.input_order());

        let mut filters = Vec::new();
        if (settings.scale_cls - 1.0).abs() > f64::EPSILON {
            filters.push(Filter::Rescale(settings.scale_cls));
        }
        if settings.winfunc_sigma > 0.0 {
            filters.push(Filter::GaussianBeam {
                sigma_arcmin: settings.winfunc_sigma,
            });
        }
        if settings.apply_pixwin {
            let path = settings
                .pixwin_file
                .as_ref()
                .unwrap_or_else(|| unreachable!());
            filters.push(Filter::PixelWindow {
                window: helpers::read_window_table(path)?,
                ell_limit: 4.0 * nside_f64(settings.nside),
            });
        }
        if settings.suppress_l >= 0.0 && settings.sup_index >= 0.0 {
            filters.push(Filter::Suppress {
                ell_sup: settings.suppress_l,
                index: settings.sup_index,
            });
        }
        filter::apply_all(&filters, &mut spectra, diag)?;

        let dipole = if settings.extrap_dipole {
            DipolePolicy::Extrapolate
        } else {
            DipolePolicy::Clamp
        };
        spectra.resample_all(settings.lmax, dipole, diag)?
    };

    if let Some(path) = &settings.outputs.cl_out {
        helpers::write_spectra(path, &registry, &gridded)?;
    }
    if stops_after(settings, Stage::ClOut) {
        return Ok(());
    }

    // ---- lognormal -> Gaussian auxiliary spectra ------------------------
    if settings.dist == Distribution::Lognormal {
        let dlt = DiscreteLegendre::new(settings.lmax);
        let pairs = lognormal::gaussianise_all(&dlt, &mut gridded, &registry, diag)?;

        if let Some(path) = &settings.outputs.xi_out {
            helpers::write_xi(path, &registry, dlt.nodes(), &pairs, XiKind::Lognormal)?;
        }
        if stops_after(settings, Stage::XiOut) {
            return Ok(());
        }
        if let Some(path) = &settings.outputs.gxi_out {
            helpers::write_xi(path, &registry, dlt.nodes(), &pairs, XiKind::Gaussian)?;
        }
        if stops_after(settings, Stage::GxiOut) {
            return Ok(());
        }
        if let Some(path) = &settings.outputs.gcl_out {
            helpers::write_spectra(path, &registry, &gridded)?;
        }
        if stops_after(settings, Stage::GclOut) {
            return Ok(());
        }
    }

    // ---- covariance, draw, auxiliary maps -------------------------------
    let (mut maps, drawn) = if settings.dist == Distribution::Homogeneous {
        let means: Vec<f64> = registry.fields().iter().map(|field| field.mean).collect();
        (SkyMaps::constant(pix, &means), None)
    } else {
        match harmonic_stages(settings, diag, &registry, &gridded, pix)? {
            Some((maps, alms)) => (maps, Some(alms)),
            None => return Ok(()),
        }
    };

    synthesis::apply_distribution(&mut maps, &registry, diag);

    if settings.dens2kappa {
        let kernel = MatterDominatedKernel::default();
        let created = integrate_density_to_convergence(&mut registry, &mut maps, &kernel, diag)?;
        log::info!("{} convergence field(s) derived", created.len());
    }

    if let Some(path) = &settings.outputs.map_out {
        helpers::write_maps(path, &registry, &maps)?;
    }
    if stops_after(settings, Stage::MapOut) {
        return Ok(());
    }

    // ---- shear ----------------------------------------------------------
    if let Some(path) = &settings.outputs.shear_map_out {
        let sht = SphericalTransform::new(pix, settings.lmax)?;
        let mut shear = Vec::new();
        for index in registry.indices_of(FieldKind::Convergence) {
            // Gaussian runs reuse the drawn coefficients; lognormal runs and
            // derived convergence fields go through the forward transform
            let drawn_alm = match (&drawn, settings.dist) {
                (Some(alms), Distribution::Gaussian) if index < alms.len() => {
                    Some(alms.field(index))
                }
                _ => None,
            };
            let components = if let Some(alm) = drawn_alm {
                build_shear(&sht, None, Some(alm), None)?
            } else {
                build_shear(&sht, Some(maps.field(index)), None, None)?
            };
            shear.push((index, components));
        }
        helpers::write_shear(path, &registry, &maps, &shear)?;
    }
    if stops_after(settings, Stage::ShearMapOut) {
        return Ok(());
    }

    // ---- observables ----------------------------------------------------
    if settings.outputs.obsmap_out.is_some() || settings.outputs.catalog_out.is_some() {
        let observed = observe::observed_maps(
            &maps,
            &registry,
            &ObservePolicy {
                poisson: settings.poisson,
                selection_scale: settings.selec_scale,
                seed: settings.rndseed,
                draw_threads: thread_count(settings),
            },
            diag,
        );

        if let Some(path) = &settings.outputs.obsmap_out {
            helpers::write_maps(path, &registry, &observed)?;
        }
        if stops_after(settings, Stage::ObsmapOut) {
            return Ok(());
        }

        if let Some(path) = &settings.outputs.catalog_out {
            let entries = observe::catalogue(&observed, &registry);
            helpers::write_catalog(path, &entries)?;
        }
    }

    Ok(())
}

/// Covariance assembly through auxiliary map synthesis; `None` when
/// `EXIT_AT` stops inside this block.
fn harmonic_stages(
    settings: &Settings,
    diag: &Diagnostics,
    registry: &FieldRegistry,
    gridded: &GriddedSpectra,
    pix: Pixelization,
) -> Result<Option<(SkyMaps, AlmSet)>> {
    let mut stack = CovarianceStack::assemble(
        gridded,
        &AssemblyPolicy {
            allow_missing: settings.allow_miss_cl,
            mindiag_frac: (settings.mindiag_frac > 0.0).then_some(settings.mindiag_frac),
            badcorr_frac: settings.badcorr_frac,
            validate_lmin: settings.lmin,
        },
        diag,
    )?;

    if let Some(prefix) = &settings.outputs.covl_prefix {
        helpers::write_covariance(prefix, &stack, settings.lmin, settings.lmax)?;
    }
    if stops_after(settings, Stage::CovlPrefix) {
        return Ok(None);
    }

    // regularised spectra over the full range are only needed when they
    // are going to be written out
    let (reg_lmin, reg_lmax) = if settings.outputs.regcovl_prefix.is_some() {
        (1, settings.lmax)
    } else {
        (settings.lmin, settings.lmax)
    };
    let worst = stack.regularize_range(reg_lmin, reg_lmax, settings.reg_maxsteps, diag)?;
    if worst > 0.0 {
        log::info!("largest covariance change from regularisation: {worst:e}");
    }

    if let Some(prefix) = &settings.outputs.regcovl_prefix {
        helpers::write_covariance(prefix, &stack, reg_lmin, reg_lmax)?;
    }
    if stops_after(settings, Stage::RegcovlPrefix) {
        return Ok(None);
    }

    let chol = stack.into_cholesky(settings.lmin, settings.lmax)?;
    if let Some(prefix) = &settings.outputs.chol_prefix {
        helpers::write_cholesky(prefix, &chol)?;
    }
    if stops_after(settings, Stage::CholPrefix) {
        return Ok(None);
    }

    let plan = DrawPlan::new(
        settings.lmin,
        settings.lmax,
        thread_count(settings),
        settings.rndseed,
    )?;
    let alms = draw_alm(&chol, &plan);

    if let Some(path) = &settings.outputs.auxalm_out {
        helpers::write_alm(path, registry, &alms)?;
    }
    if stops_after(settings, Stage::AuxalmOut) {
        return Ok(None);
    }

    let sht = SphericalTransform::new(pix, settings.lmax)?;
    let maps = synthesis::synthesize_maps(&sht, &alms);

    if let Some(path) = &settings.outputs.auxmap_out {
        helpers::write_maps(path, registry, &maps)?;
    }
    if stops_after(settings, Stage::AuxmapOut) {
        return Ok(None);
    }

    Ok(Some((maps, alms)))
}

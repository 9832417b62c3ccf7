//! File reading and plain-text table writers for every pipeline product.

use anyhow::{Context, Result};
use ndarray::Array2;
use prettytable::format::{FormatBuilder, LinePosition, LineSeparator};
use prettytable::Table;
use skysim::alm::AlmSet;
use skysim::covariance::{CholeskyStack, CovarianceStack};
use skysim::field::FieldRegistry;
use skysim::interp::Interp1d;
use skysim::lognormal::GaussianisedPair;
use skysim::observe::CatalogEntry;
use skysim::spectrum::GriddedSpectra;
use skysim::synthesis::SkyMaps;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Reads a whole text file with a path-carrying error.
///
/// # Errors
///
/// Fails when the file cannot be read.
pub fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("unable to read '{}'", path.display()))
}

/// Opens a buffered writer with a path-carrying error.
///
/// # Errors
///
/// Fails when the file cannot be created.
pub fn create_text(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).with_context(|| {
        format!("unable to write '{}'", path.display())
    })?))
}

/// Loads a two-column (ℓ, W) table as an interpolant, for the pixel window.
///
/// # Errors
///
/// Fails on unreadable files or malformed tables.
pub fn read_window_table(path: &Path) -> Result<Interp1d> {
    let text = read_text(path)?;
    let mut ell = Vec::new();
    let mut window = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (Some(first), Some(second)) = (tokens.next(), tokens.next()) else {
            anyhow::bail!("'{}': expected two columns in '{line}'", path.display());
        };
        ell.push(first.parse::<f64>()?);
        window.push(second.parse::<f64>()?);
    }
    Ok(Interp1d::new(ell, window)?)
}

/// The bordered-title table style used by the info subcommands.
#[must_use]
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.set_format(
        FormatBuilder::new()
            .column_separator(' ')
            .separator(LinePosition::Title, LineSeparator::new('-', '+', ' ', ' '))
            .build(),
    );
    table
}

/// Pair label in the input file convention, e.g. `Cl-f1z1f1z2`.
fn pair_label(registry: &FieldRegistry, i: usize, j: usize) -> String {
    format!(
        "Cl-{}{}",
        registry.index_to_name(i),
        registry.index_to_name(j)
    )
}

/// Writes the gridded spectra as one multi-column table, columns in the
/// recorded input order.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_spectra(
    path: &Path,
    registry: &FieldRegistry,
    gridded: &GriddedSpectra,
) -> Result<()> {
    let mut out = create_text(path)?;

    write!(out, "# l")?;
    for &(i, j) in registry.input_order() {
        write!(out, " {}", pair_label(registry, i, j))?;
    }
    writeln!(out)?;

    for ell in 0..=gridded.lmax() {
        write!(out, "{ell}")?;
        for &(i, j) in registry.input_order() {
            let value = gridded.get(i, j).map_or(0.0, |cl| cl[ell]);
            write!(out, " {value:e}")?;
        }
        writeln!(out)?;
    }
    Ok(out.flush()?)
}

/// Which correlation function of a [`GaussianisedPair`] to emit.
#[derive(Clone, Copy, Debug)]
pub enum XiKind {
    /// ξ(θ), before gaussianisation.
    Lognormal,
    /// ξ_G(θ), after gaussianisation.
    Gaussian,
}

/// Writes correlation functions at the transform nodes, one column per
/// pair, first column cos θ.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_xi(
    path: &Path,
    registry: &FieldRegistry,
    nodes: &[f64],
    pairs: &[GaussianisedPair],
    kind: XiKind,
) -> Result<()> {
    let mut out = create_text(path)?;

    write!(out, "# cos_theta")?;
    for pair in pairs {
        write!(out, " {}", pair_label(registry, pair.pair.0, pair.pair.1))?;
    }
    writeln!(out)?;

    for (row, &node) in nodes.iter().enumerate() {
        write!(out, "{node:e}")?;
        for pair in pairs {
            let values = match kind {
                XiKind::Lognormal => &pair.xi,
                XiKind::Gaussian => &pair.xi_gauss,
            };
            write!(out, " {:e}", values[row])?;
        }
        writeln!(out)?;
    }
    Ok(out.flush()?)
}

fn write_matrix(out: &mut impl Write, matrix: &Array2<f64>) -> Result<()> {
    for row in matrix.rows() {
        let mut first = true;
        for value in row {
            if !first {
                write!(out, " ")?;
            }
            write!(out, "{value:e}")?;
            first = false;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Writes one matrix file per multipole under `prefix`, named
/// `<prefix>l<ell>.dat`.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_covariance(prefix: &str, stack: &CovarianceStack, lmin: usize, lmax: usize) -> Result<()> {
    for ell in lmin..=lmax {
        let path = format!("{prefix}l{ell}.dat");
        let mut out = create_text(Path::new(&path))?;
        write_matrix(&mut out, stack.matrix(ell))?;
        out.flush()?;
    }
    Ok(())
}

/// Writes one Cholesky triangle file per multipole under `prefix`.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_cholesky(prefix: &str, chol: &CholeskyStack) -> Result<()> {
    for ell in chol.lmin()..=chol.lmax() {
        let path = format!("{prefix}l{ell}.dat");
        let mut out = create_text(Path::new(&path))?;
        write_matrix(&mut out, chol.triangle(ell))?;
        out.flush()?;
    }
    Ok(())
}

/// Writes the harmonic coefficients: rows of `l m` followed by the real and
/// imaginary parts per field.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_alm(path: &Path, registry: &FieldRegistry, alms: &AlmSet) -> Result<()> {
    let mut out = create_text(path)?;

    write!(out, "# l m")?;
    for field in registry.fields().iter().take(alms.len()) {
        write!(out, " Re[{0}] Im[{0}]", field.name)?;
    }
    writeln!(out)?;

    let lmax = alms.field(0).lmax();
    for ell in 0..=lmax {
        for m in 0..=ell {
            write!(out, "{ell} {m}")?;
            for field in 0..alms.len() {
                let value = alms.field(field).get(ell, m);
                write!(out, " {:e} {:e}", value.re, value.im)?;
            }
            writeln!(out)?;
        }
    }
    Ok(out.flush()?)
}

/// Writes pixel maps: rows of `theta phi` followed by one column per field.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_maps(path: &Path, registry: &FieldRegistry, maps: &SkyMaps) -> Result<()> {
    let mut out = create_text(path)?;

    write!(out, "# theta phi")?;
    for field in registry.fields().iter().take(maps.len()) {
        write!(out, " {}", field.name)?;
    }
    writeln!(out)?;

    let pix = maps.pixelization();
    for pixel in 0..pix.npix() {
        let (theta, phi) = pix.pixel_center(pixel);
        write!(out, "{theta:e} {phi:e}")?;
        for field in 0..maps.len() {
            write!(out, " {:e}", maps.field(field)[pixel])?;
        }
        writeln!(out)?;
    }
    Ok(out.flush()?)
}

/// Writes shear maps: rows of `theta phi` and (γ₁, γ₂) per convergence
/// field.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_shear(
    path: &Path,
    registry: &FieldRegistry,
    maps: &SkyMaps,
    shear: &[(usize, skysim::shear::ShearMaps)],
) -> Result<()> {
    let mut out = create_text(path)?;

    write!(out, "# theta phi")?;
    for &(index, _) in shear {
        let name = registry.index_to_name(index);
        write!(out, " gamma1[{name}] gamma2[{name}]")?;
    }
    writeln!(out)?;

    let pix = maps.pixelization();
    for pixel in 0..pix.npix() {
        let (theta, phi) = pix.pixel_center(pixel);
        write!(out, "{theta:e} {phi:e}")?;
        for (_, components) in shear {
            write!(out, " {:e} {:e}", components.gamma1[pixel], components.gamma2[pixel])?;
        }
        writeln!(out)?;
    }
    Ok(out.flush()?)
}

/// Writes the catalogue: one row per populated pixel.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_catalog(path: &Path, entries: &[CatalogEntry]) -> Result<()> {
    let mut out = create_text(path)?;
    writeln!(out, "# f z theta phi redshift count")?;
    for entry in entries {
        writeln!(
            out,
            "{} {} {:e} {:e} {:e} {:e}",
            entry.field.f, entry.field.z, entry.theta, entry.phi, entry.redshift, entry.count
        )?;
    }
    Ok(out.flush()?)
}

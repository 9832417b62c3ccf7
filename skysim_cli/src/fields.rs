//! The `fields` subcommand: print and validate a FIELDS_INFO registry.

use super::{config, helpers, GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use prettytable::{cell, Row};
use skysim::field::{FieldKind, FieldRegistry};
use std::path::PathBuf;
use std::process::ExitCode;

/// Validates a field registry file and prints its contents.
#[derive(Parser)]
pub struct Opts {
    /// Path of the FIELDS_INFO file.
    #[arg(value_hint = ValueHint::FilePath)]
    fields_info: PathBuf,
    /// Distribution to validate against.
    #[arg(default_value = "LOGNORMAL", long)]
    dist: String,
}

impl Subcommand for Opts {
    fn run(&self, _cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let dist = config::parse_dist(&self.dist)?;
        let registry =
            FieldRegistry::from_fields_info(&helpers::read_text(&self.fields_info)?, dist)?;

        let mut table = helpers::create_table();
        let mut title = Row::empty();
        for label in ["index", "name", "kind", "mean", "shift", "zmin", "zmax"] {
            title.add_cell(cell!(c->label));
        }
        table.set_titles(title);
        for (index, field) in registry.fields().iter().enumerate() {
            let kind = match field.kind {
                FieldKind::Density => "density",
                FieldKind::Convergence => "convergence",
            };
            let mut row = Row::empty();
            row.add_cell(cell!(r->format!("{index}")));
            row.add_cell(cell!(l->format!("{}", field.name)));
            row.add_cell(cell!(l->kind));
            row.add_cell(cell!(r->format!("{}", field.mean)));
            row.add_cell(cell!(r->format!("{}", field.shift)));
            row.add_cell(cell!(r->format!("{}", field.zmin)));
            row.add_cell(cell!(r->format!("{}", field.zmax)));
            table.add_row(row);
        }
        table.printstd();

        Ok(ExitCode::SUCCESS)
    }
}

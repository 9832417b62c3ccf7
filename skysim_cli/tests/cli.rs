#![allow(missing_docs)]

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use predicates::str;

const FIELDS_TWO_DENSITY: &str = "# f z mean shift kind zmin zmax\n\
                                  1 1 0.0 1.0 1 0.0 0.5\n\
                                  1 2 0.0 1.0 1 0.5 1.0\n";

fn spectrum_file() -> String {
    (2..=8)
        .map(|l| format!("{l} {:e}\n", 1.0 / f64::from(l * l)))
        .collect()
}

fn cross_file() -> String {
    (2..=8)
        .map(|l| format!("{l} {:e}\n", 0.3 / f64::from(l * l)))
        .collect()
}

/// A minimal two-field Gaussian run under `dir`, returning the config path.
fn write_run(dir: &TempDir, extra: &str) -> std::path::PathBuf {
    dir.child("fields.dat").write_str(FIELDS_TWO_DENSITY).unwrap();
    dir.child("cl-f1z1f1z1.dat").write_str(&spectrum_file()).unwrap();
    dir.child("cl-f1z2f1z2.dat").write_str(&spectrum_file()).unwrap();
    dir.child("cl-f1z1f1z2.dat").write_str(&cross_file()).unwrap();

    let config = format!(
        "DIST: GAUSSIAN\n\
         FIELDS_INFO: {fields}\n\
         CL_PREFIX: {prefix}\n\
         LRANGE: 2 8\n\
         NSIDE: 4\n\
         RNDSEED: 42\n\
         {extra}",
        fields = dir.child("fields.dat").path().display(),
        prefix = dir.path().join("cl-").display(),
    );
    let path = dir.child("run.config");
    path.write_str(&config).unwrap();
    path.path().to_path_buf()
}

fn skysim() -> Command {
    Command::cargo_bin("skysim").unwrap()
}

#[test]
fn early_exit_after_filtered_spectra() {
    let dir = TempDir::new().unwrap();
    let out = dir.child("cl-out.dat");
    let config = write_run(
        &dir,
        &format!(
            "CL_OUT: {}\nEXIT_AT: CL_OUT\n",
            out.path().display()
        ),
    );

    skysim().arg("simulate").arg(&config).assert().success();

    let text = std::fs::read_to_string(out.path()).unwrap();
    assert!(text.starts_with("# l Cl-f1z1f1z1"));
    // 0..=8 rows plus the header
    assert_eq!(text.lines().count(), 10);
}

#[test]
fn maps_are_written_and_reproducible() {
    let dir = TempDir::new().unwrap();
    let out = dir.child("maps.dat");
    let config = write_run(&dir, &format!("MAP_OUT: {}\n", out.path().display()));

    skysim()
        .arg("simulate")
        .arg(&config)
        .arg("--threads")
        .arg("2")
        .assert()
        .success();
    let first = std::fs::read_to_string(out.path()).unwrap();
    // header plus one row per pixel of an Nside 4 grid
    assert_eq!(first.lines().count(), 1 + 12 * 16);

    skysim()
        .arg("simulate")
        .arg(&config)
        .arg("--threads")
        .arg("2")
        .assert()
        .success();
    let second = std::fs::read_to_string(out.path()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn overrides_shadow_the_file() {
    let dir = TempDir::new().unwrap();
    let out = dir.child("maps.dat");
    let config = write_run(&dir, &format!("MAP_OUT: {}\n", out.path().display()));

    // an override that breaks the range must fail the run
    skysim()
        .arg("simulate")
        .arg(&config)
        .arg("LRANGE=2 128")
        .assert()
        .failure()
        .stderr(str::contains("LRANGE"));
}

#[test]
fn unknown_keys_are_fatal() {
    let dir = TempDir::new().unwrap();
    let config = write_run(&dir, "SOME_TYPO: 1\n");

    skysim()
        .arg("simulate")
        .arg(&config)
        .assert()
        .failure()
        .stderr(str::contains("unknown configuration key"));
}

#[test]
fn missing_partner_respects_the_allowance() {
    let dir = TempDir::new().unwrap();
    dir.child("fields.dat").write_str(FIELDS_TWO_DENSITY).unwrap();
    // only one auto-spectrum present
    dir.child("cl-f1z1f1z1.dat").write_str(&spectrum_file()).unwrap();

    let base = format!(
        "DIST: GAUSSIAN\n\
         FIELDS_INFO: {fields}\n\
         CL_PREFIX: {prefix}\n\
         LRANGE: 2 8\n\
         NSIDE: 4\n",
        fields = dir.child("fields.dat").path().display(),
        prefix = dir.path().join("cl-").display(),
    );

    let strict = dir.child("strict.config");
    strict.write_str(&base).unwrap();
    skysim()
        .arg("simulate")
        .arg(strict.path())
        .assert()
        .failure()
        .stderr(str::contains("no spectrum for pair"));

    let map_out = dir.child("maps.dat");
    let lenient = dir.child("lenient.config");
    lenient
        .write_str(&format!(
            "{base}ALLOW_MISS_CL: 1\nMINDIAG_FRAC: 0.01\nMAP_OUT: {}\n",
            map_out.path().display()
        ))
        .unwrap();
    skysim().arg("simulate").arg(lenient.path()).assert().success();
    assert!(map_out.path().is_file());
}

#[test]
fn fields_subcommand_lists_the_registry() {
    let dir = TempDir::new().unwrap();
    dir.child("fields.dat").write_str(FIELDS_TWO_DENSITY).unwrap();

    skysim()
        .arg("fields")
        .arg(dir.child("fields.dat").path())
        .assert()
        .success()
        .stdout(str::contains("f1z2").and(str::contains("density")));
}

#[test]
fn lognormal_end_to_end_with_catalogue() {
    let dir = TempDir::new().unwrap();
    let maps = dir.child("maps.dat");
    let catalog = dir.child("catalog.dat");
    let config = write_run(
        &dir,
        &format!(
            "MAP_OUT: {}\nOBSMAP_OUT: {}\nCATALOG_OUT: {}\nPOISSON: 1\nSELEC_SCALE: 5.0\n",
            maps.path().display(),
            dir.child("obs.dat").path().display(),
            catalog.path().display(),
        ),
    );

    skysim()
        .arg("simulate")
        .arg(&config)
        .arg("DIST=LOGNORMAL")
        .assert()
        .success();

    assert!(maps.path().is_file());
    let catalog_text = std::fs::read_to_string(catalog.path()).unwrap();
    assert!(catalog_text.starts_with("# f z theta phi redshift count"));
    assert!(catalog_text.lines().count() > 1);
}

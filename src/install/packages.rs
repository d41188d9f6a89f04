//! Library package batch installation.
//!
//! One incompatible or temporarily unavailable package must not prevent the
//! other N−1 from installing, so the flow is batch-then-isolate-retry:
//! install the whole declared set in one call, verify against the installed
//! index, retry each missing package individually, and verify again. Every
//! declared package ends with an explicit outcome.
//!
//! The installed-package index — not the package manager's exit code — is
//! the authority throughout.

use crate::catalog::{PackageManagerKind, PackageSet};
use crate::envstore::grant_world_access;
use crate::error::BasecampError;
use crate::install::{PackageOutcome, PackageSetOutcome};
use crate::logs::SetupLog;
use crate::resolve::Resolution;
use crate::shell::{run, Invocation, RunOptions};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Wait ceiling for a batch package-manager call.
const BATCH_TIMEOUT_SECS: u64 = 2400;

/// Wait ceiling for a single-package retry.
const SINGLE_TIMEOUT_SECS: u64 = 600;

/// CRAN mirror used for all package installs.
const CRAN_REPO: &str = "https://cloud.r-project.org";

/// Install a declared package set, recording an outcome per package.
///
/// The runtime component is a hard precondition: without it every package
/// is `SkippedMissingRuntime`.
pub fn install_package_set(
    set: &PackageSet,
    runtime: &Resolution,
    install_dir: &Path,
    log: &SetupLog,
) -> PackageSetOutcome {
    log.section(&format!("Packages: {} ({} declared)", set.name, set.packages.len()));

    let Some(runtime_path) = runtime.path() else {
        log.info(&format!(
            "Skipping {} packages: runtime component '{}' is not available",
            set.name, set.runtime
        ));
        return PackageSetOutcome {
            set: set.name.clone(),
            packages: set
                .packages
                .iter()
                .map(|p| (p.clone(), PackageOutcome::SkippedMissingRuntime))
                .collect(),
        };
    };

    let library = set
        .library_subdir
        .as_ref()
        .map(|sub| install_dir.join(sub));

    if let Some(lib) = &library {
        if let Err(e) = fs::create_dir_all(lib) {
            log.error(&format!("could not create library dir {}: {e}", lib.display()));
        } else if let Err(e) = grant_world_access(lib) {
            log.error(&format!("access grant on {} failed: {e}", lib.display()));
        }
    }

    // Pre-verify so a fully provisioned machine re-runs with zero installs.
    let already = installed_index(set, runtime_path, library.as_deref(), log);
    let to_install: Vec<String> = set
        .packages
        .iter()
        .filter(|p| !already.contains(p.as_str()))
        .cloned()
        .collect();

    if to_install.is_empty() {
        log.info(&format!("All {} packages already installed", set.name));
        return PackageSetOutcome {
            set: set.name.clone(),
            packages: set
                .packages
                .iter()
                .map(|p| (p.clone(), PackageOutcome::Installed))
                .collect(),
        };
    }

    // Batch install everything missing in one call.
    let batch = batch_invocation(set, runtime_path, library.as_deref(), &to_install);
    log.info(&format!("Batch install: {}", batch.display()));
    match run(&batch, &RunOptions::with_timeout(BATCH_TIMEOUT_SECS)) {
        Ok(result) => {
            log.transcript(&result.combined_output());
            if !result.success {
                log.error(&format!(
                    "Batch install for {} exited with {:?}; verifying anyway",
                    set.name, result.exit_code
                ));
            }
        }
        Err(e) => log.error(&format!("Batch install for {} failed to run: {e}", set.name)),
    }

    // Verify, then retry the missing individually.
    let installed = installed_index(set, runtime_path, library.as_deref(), log);
    let missing: Vec<&String> = set
        .packages
        .iter()
        .filter(|p| !installed.contains(p.as_str()))
        .collect();

    if !missing.is_empty() {
        log.info(&format!(
            "{} of {} packages missing after batch; retrying individually: {}",
            missing.len(),
            set.packages.len(),
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));

        for package in &missing {
            let single = single_invocation(set, runtime_path, library.as_deref(), package);
            log.info(&format!("Retrying package '{package}'"));
            match run(&single, &RunOptions::with_timeout(SINGLE_TIMEOUT_SECS)) {
                Ok(result) => {
                    log.transcript(&result.combined_output());
                    if !result.success {
                        log.error(&format!(
                            "Retry of '{package}' exited with {:?}",
                            result.exit_code
                        ));
                    }
                }
                Err(e) => log.error(&format!("Retry of '{package}' failed to run: {e}")),
            }
        }
    }

    // Final verification decides every outcome.
    let final_index = installed_index(set, runtime_path, library.as_deref(), log);
    let packages: Vec<(String, PackageOutcome)> = set
        .packages
        .iter()
        .map(|p| {
            let outcome = if final_index.contains(p.as_str()) {
                PackageOutcome::Installed
            } else {
                let reason = "not present in installed index after retry".to_string();
                let err = BasecampError::PackageInstallFailed {
                    package: p.clone(),
                    message: reason.clone(),
                };
                log.error(&err.to_string());
                PackageOutcome::Failed { reason }
            };
            (p.clone(), outcome)
        })
        .collect();

    let outcome = PackageSetOutcome {
        set: set.name.clone(),
        packages,
    };
    log.info(&format!("{}: {}", set.name, outcome.summary()));
    outcome
}

/// The batch install invocation for the missing subset of a set.
pub fn batch_invocation(
    set: &PackageSet,
    runtime: &Path,
    library: Option<&Path>,
    packages: &[String],
) -> Invocation {
    match set.kind {
        PackageManagerKind::Cran => {
            let expr = cran_install_expr(packages, library);
            Invocation::new(runtime, &["-e", &expr])
        }
        PackageManagerKind::TexLive => {
            let mut args = vec!["install".to_string()];
            args.extend(packages.iter().cloned());
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            Invocation::new(runtime, &arg_refs)
        }
    }
}

/// The single-package retry invocation.
pub fn single_invocation(
    set: &PackageSet,
    runtime: &Path,
    library: Option<&Path>,
    package: &str,
) -> Invocation {
    match set.kind {
        PackageManagerKind::Cran => {
            let expr = cran_install_expr(std::slice::from_ref(&package.to_string()), library);
            Invocation::new(runtime, &["-e", &expr])
        }
        PackageManagerKind::TexLive => Invocation::new(runtime, &["install", package]),
    }
}

/// The `install.packages` expression for a list of CRAN packages.
///
/// Binary artifacts are preferred where CRAN publishes them, so no local
/// compiler toolchain is needed.
fn cran_install_expr(packages: &[String], library: Option<&Path>) -> String {
    let quoted: Vec<String> = packages.iter().map(|p| format!("\"{p}\"")).collect();
    let lib_clause = library
        .map(|l| format!(", lib='{}'", l.display()))
        .unwrap_or_default();
    let type_clause = if cfg!(windows) { ", type='binary'" } else { "" };
    format!(
        "install.packages(c({}){}, repos='{}'{})",
        quoted.join(", "),
        lib_clause,
        CRAN_REPO,
        type_clause
    )
}

/// Query the installed-package index for a set.
///
/// CRAN: the private library's subdirectories carrying a `DESCRIPTION`
/// file — the same ground truth `installed.packages()` reports.
/// TeX Live: `tlmgr list --only-installed` parsed.
pub fn installed_index(
    set: &PackageSet,
    runtime: &Path,
    library: Option<&Path>,
    log: &SetupLog,
) -> HashSet<String> {
    match set.kind {
        PackageManagerKind::Cran => library.map(cran_library_index).unwrap_or_default(),
        PackageManagerKind::TexLive => {
            let invocation = Invocation::new(runtime, &["list", "--only-installed"]);
            match run(&invocation, &RunOptions::with_timeout(SINGLE_TIMEOUT_SECS)) {
                Ok(result) => parse_tlmgr_list(&result.stdout),
                Err(e) => {
                    log.error(&format!("tlmgr list failed: {e}"));
                    HashSet::new()
                }
            }
        }
    }
}

fn cran_library_index(library: &Path) -> HashSet<String> {
    let Ok(entries) = fs::read_dir(library) else {
        return HashSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join("DESCRIPTION").is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

/// Parse `tlmgr list --only-installed` output lines like
/// `i koma-script: A bundle of versatile classes and packages`.
fn parse_tlmgr_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("i ")?;
            let name = rest.split(':').next()?.trim();
            // Architecture-specific entries like `koma-script.x86_64-linux`
            // count as their base package.
            let base = name.split('.').next().unwrap_or(name);
            if base.is_empty() {
                None
            } else {
                Some(base.to_string())
            }
        })
        .collect()
}

/// The private library directory a set publishes, if any.
pub fn library_dir(set: &PackageSet, install_dir: &Path) -> Option<PathBuf> {
    set.library_subdir.as_ref().map(|sub| install_dir.join(sub))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_log(temp: &TempDir) -> SetupLog {
        SetupLog::open(&temp.path().join("logs")).unwrap()
    }

    fn cran_set(packages: &[&str]) -> PackageSet {
        PackageSet {
            name: "cran".to_string(),
            runtime: "r".to_string(),
            kind: PackageManagerKind::Cran,
            library_subdir: Some("r-library".to_string()),
            packages: packages.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A fake Rscript: extracts double-quoted package names from the `-e`
    /// expression and installs them as library subdirs. Packages listed in
    /// the REFUSE file are skipped once, then allowed (simulating a flaky
    /// mirror that recovers on retry).
    #[cfg(unix)]
    fn fake_rscript(dir: &Path, lib: &Path, refuse_once: Option<&str>) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("Rscript");
        fs::create_dir_all(dir).unwrap();
        let marker = dir.join("refused.marker");
        let refuse = refuse_once.unwrap_or("");
        fs::write(
            &script,
            format!(
                r#"#!/bin/sh
expr="$2"
for p in $(printf '%s' "$expr" | grep -o '"[^"]*"' | tr -d '"'); do
  if [ "$p" = "{refuse}" ] && [ ! -f "{marker}" ]; then
    touch "{marker}"
    continue
  fi
  mkdir -p "{lib}/$p"
  printf 'Package: %s\n' "$p" > "{lib}/$p/DESCRIPTION"
done
"#,
                refuse = refuse,
                marker = marker.display(),
                lib = lib.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn present(path: &Path) -> Resolution {
        Resolution::Present {
            path: path.to_path_buf(),
            version: None,
        }
    }

    #[test]
    fn missing_runtime_skips_every_package() {
        let temp = TempDir::new().unwrap();
        let log = setup_log(&temp);
        let set = cran_set(&["readr", "dplyr", "fmsb"]);

        let outcome = install_package_set(&set, &Resolution::Absent, temp.path(), &log);

        assert_eq!(outcome.total(), 3);
        assert_eq!(outcome.installed_count(), 0);
        assert!(outcome
            .packages
            .iter()
            .all(|(_, o)| matches!(o, PackageOutcome::SkippedMissingRuntime)));
    }

    #[cfg(unix)]
    #[test]
    fn batch_installs_full_set() {
        let temp = TempDir::new().unwrap();
        let install_dir = temp.path().join("lab");
        let lib = install_dir.join("r-library");
        let rscript = fake_rscript(&temp.path().join("rt"), &lib, None);
        let log = setup_log(&temp);

        let set = cran_set(&["readr", "dplyr", "fmsb"]);
        let outcome = install_package_set(&set, &present(&rscript), &install_dir, &log);

        assert!(outcome.all_installed());
        assert_eq!(outcome.summary(), "Installed: 3/3");
        assert!(lib.join("readr/DESCRIPTION").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn one_flaky_package_recovers_on_individual_retry() {
        let temp = TempDir::new().unwrap();
        let install_dir = temp.path().join("lab");
        let lib = install_dir.join("r-library");
        let rscript = fake_rscript(&temp.path().join("rt"), &lib, Some("fmsb"));
        let log = setup_log(&temp);

        let set = cran_set(&["readr", "dplyr", "fmsb"]);
        let outcome = install_package_set(&set, &present(&rscript), &install_dir, &log);

        // The flaky package recovered; nothing else was affected.
        assert!(outcome.all_installed());
        assert_eq!(outcome.summary(), "Installed: 3/3");

        let progress = fs::read_to_string(log.progress_path()).unwrap();
        assert!(progress.contains("retrying individually: fmsb"));
    }

    #[cfg(unix)]
    #[test]
    fn unrecoverable_package_is_failed_without_poisoning_batch() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let install_dir = temp.path().join("lab");
        let lib = install_dir.join("r-library");
        let dir = temp.path().join("rt");

        // This runtime never installs "fmsb".
        let script = dir.join("Rscript");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            &script,
            format!(
                r#"#!/bin/sh
expr="$2"
for p in $(printf '%s' "$expr" | grep -o '"[^"]*"' | tr -d '"'); do
  [ "$p" = "fmsb" ] && continue
  mkdir -p "{lib}/$p"
  printf 'Package: %s\n' "$p" > "{lib}/$p/DESCRIPTION"
done
"#,
                lib = lib.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let log = setup_log(&temp);
        let set = cran_set(&["readr", "fmsb", "dplyr"]);
        let outcome = install_package_set(&set, &present(&script), &install_dir, &log);

        assert_eq!(outcome.installed_count(), 2);
        assert_eq!(outcome.summary(), "Installed: 2/3");
        let fmsb = outcome
            .packages
            .iter()
            .find(|(name, _)| name == "fmsb")
            .unwrap();
        assert!(matches!(fmsb.1, PackageOutcome::Failed { .. }));
        // Other packages unaffected.
        assert!(outcome
            .packages
            .iter()
            .filter(|(name, _)| name != "fmsb")
            .all(|(_, o)| o.is_installed()));
    }

    #[test]
    fn fully_installed_set_runs_no_package_manager() {
        let temp = TempDir::new().unwrap();
        let install_dir = temp.path().join("lab");
        let lib = install_dir.join("r-library");
        for pkg in ["readr", "dplyr"] {
            fs::create_dir_all(lib.join(pkg)).unwrap();
            fs::write(lib.join(pkg).join("DESCRIPTION"), "Package\n").unwrap();
        }
        let log = setup_log(&temp);

        // The runtime binary does not even exist; pre-verification must
        // short-circuit before any invocation.
        let set = cran_set(&["readr", "dplyr"]);
        let outcome =
            install_package_set(&set, &present(Path::new("/nonexistent/Rscript")), &install_dir, &log);

        assert!(outcome.all_installed());
        let progress = fs::read_to_string(log.progress_path()).unwrap();
        assert!(progress.contains("already installed"));
    }

    #[test]
    fn cran_expr_quotes_packages_and_library() {
        let expr = cran_install_expr(
            &["readr".to_string(), "dplyr".to_string()],
            Some(Path::new("/opt/lab/r-library")),
        );
        assert!(expr.contains(r#"c("readr", "dplyr")"#));
        assert!(expr.contains("lib='/opt/lab/r-library'"));
        assert!(expr.contains("repos='https://cloud.r-project.org'"));
    }

    #[test]
    fn texlive_batch_invocation_lists_packages() {
        let set = PackageSet {
            name: "texlive".to_string(),
            runtime: "tinytex".to_string(),
            kind: PackageManagerKind::TexLive,
            library_subdir: None,
            packages: vec!["koma-script".to_string(), "caption".to_string()],
        };
        let inv = batch_invocation(&set, Path::new("/opt/tlmgr"), None, &set.packages);
        assert_eq!(inv.args, vec!["install", "koma-script", "caption"]);
    }

    #[test]
    fn texlive_single_invocation_one_package() {
        let set = PackageSet {
            name: "texlive".to_string(),
            runtime: "tinytex".to_string(),
            kind: PackageManagerKind::TexLive,
            library_subdir: None,
            packages: vec![],
        };
        let inv = single_invocation(&set, Path::new("/opt/tlmgr"), None, "zref");
        assert_eq!(inv.args, vec!["install", "zref"]);
    }

    #[test]
    fn parse_tlmgr_list_extracts_names() {
        let output = "i caption: Customising captions in floating environments\n\
                      i koma-script: A bundle of versatile classes and packages\n\
                      i koma-script.x86_64-linux: binary files of koma-script\n\
                      not-an-entry\n";
        let index = parse_tlmgr_list(output);
        assert!(index.contains("caption"));
        assert!(index.contains("koma-script"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn cran_index_requires_description_file() {
        let temp = TempDir::new().unwrap();
        let lib = temp.path().join("r-library");
        fs::create_dir_all(lib.join("readr")).unwrap();
        fs::write(lib.join("readr/DESCRIPTION"), "Package: readr\n").unwrap();
        // A bare directory is not an installed package.
        fs::create_dir_all(lib.join("00LOCK-dplyr")).unwrap();

        let index = cran_library_index(&lib);
        assert!(index.contains("readr"));
        assert!(!index.contains("00LOCK-dplyr"));
    }

    #[test]
    fn cran_index_missing_library_is_empty() {
        let index = cran_library_index(Path::new("/nonexistent/lib"));
        assert!(index.is_empty());
    }

    #[test]
    fn library_dir_joins_subdir() {
        let set = cran_set(&[]);
        assert_eq!(
            library_dir(&set, Path::new("/opt/lab")),
            Some(PathBuf::from("/opt/lab/r-library"))
        );
    }
}

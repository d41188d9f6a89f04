//! Requirements report generation.
//!
//! The report is the contract the primary application's startup guard
//! parses: one line per component, a sub-section per package set, and a
//! single trailing `RESULT: PASS|FAIL` verdict.
//!
//! Every line is derived from a fresh re-probe of the machine — never from
//! the install steps' own bookkeeping. An installer that believed it
//! succeeded contributes nothing here; only what is actually on disk counts.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::install::packages::{installed_index, library_dir};
use crate::logs::SetupLog;
use crate::resolve::Resolver;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// Freshly probed status of one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub name: String,
    pub satisfied: bool,
    pub detail: String,
}

/// Freshly probed status of one package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageReport {
    pub name: String,
    pub installed: bool,
}

/// One package set's sub-section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReport {
    pub set: String,
    pub packages: Vec<PackageReport>,
}

impl SetReport {
    fn installed_count(&self) -> usize {
        self.packages.iter().filter(|p| p.installed).count()
    }
}

/// The full requirements check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementsReport {
    /// Render timestamp, fixed at probe time.
    pub generated_at: String,
    pub components: Vec<ComponentReport>,
    pub package_sets: Vec<SetReport>,
}

impl RequirementsReport {
    /// Re-probe every component and every declared package.
    pub fn probe(
        catalog: &Catalog,
        install_dir: &Path,
        resolver: &Resolver,
        log: &SetupLog,
    ) -> Self {
        let components = catalog
            .components
            .iter()
            .map(|spec| {
                let resolution = resolver.resolve(&spec.probe);
                ComponentReport {
                    name: spec.name.clone(),
                    satisfied: resolution.satisfies(spec.minimum_version.as_ref()),
                    detail: resolution.detail(),
                }
            })
            .collect();

        let package_sets = catalog
            .package_sets
            .iter()
            .map(|set| {
                let runtime = catalog
                    .component(&set.runtime)
                    .map(|spec| resolver.resolve(&spec.probe));
                let index = runtime
                    .as_ref()
                    .and_then(|r| r.path())
                    .map(|path| {
                        installed_index(set, path, library_dir(set, install_dir).as_deref(), log)
                    })
                    .unwrap_or_default();

                SetReport {
                    set: set.name.clone(),
                    packages: set
                        .packages
                        .iter()
                        .map(|p| PackageReport {
                            name: p.clone(),
                            installed: index.contains(p.as_str()),
                        })
                        .collect(),
                }
            })
            .collect();

        Self {
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            components,
            package_sets,
        }
    }

    /// PASS only when every component and every package passed.
    pub fn overall_pass(&self) -> bool {
        self.components.iter().all(|c| c.satisfied)
            && self
                .package_sets
                .iter()
                .all(|s| s.packages.iter().all(|p| p.installed))
    }

    /// Render the fixed-format report text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Basecamp requirements check  {}", self.generated_at);

        for component in &self.components {
            let _ = writeln!(
                out,
                "[{}] {} : {}",
                status(component.satisfied),
                component.name,
                component.detail
            );
        }

        for set in &self.package_sets {
            let _ = writeln!(out, "Packages ({}):", set.set);
            for package in &set.packages {
                let _ = writeln!(out, "[{}] {}", status(package.installed), package.name);
            }
            let _ = writeln!(
                out,
                "Installed: {}/{}",
                set.installed_count(),
                set.packages.len()
            );
        }

        let _ = writeln!(
            out,
            "RESULT: {}",
            if self.overall_pass() { "PASS" } else { "FAIL" }
        );
        out
    }

    /// Write the rendered report, replacing any previous run's report.
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644));
        }
        Ok(())
    }
}

fn status(ok: bool) -> &'static str {
    if ok {
        "PASS"
    } else {
        "FAIL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report(all_pass: bool) -> RequirementsReport {
        RequirementsReport {
            generated_at: "2026-03-01 04:12:00".to_string(),
            components: vec![
                ComponentReport {
                    name: "r".to_string(),
                    satisfied: true,
                    detail: "4.4.1 at /usr/bin/Rscript".to_string(),
                },
                ComponentReport {
                    name: "quarto".to_string(),
                    satisfied: all_pass,
                    detail: if all_pass {
                        "1.5.57 at /opt/quarto/bin/quarto".to_string()
                    } else {
                        "not found".to_string()
                    },
                },
            ],
            package_sets: vec![SetReport {
                set: "cran".to_string(),
                packages: vec![
                    PackageReport {
                        name: "readr".to_string(),
                        installed: true,
                    },
                    PackageReport {
                        name: "fmsb".to_string(),
                        installed: all_pass,
                    },
                ],
            }],
        }
    }

    #[test]
    fn overall_pass_requires_everything() {
        assert!(sample_report(true).overall_pass());
        assert!(!sample_report(false).overall_pass());
    }

    #[test]
    fn render_pass_format() {
        insta::assert_snapshot!(sample_report(true).render(), @r###"
        Basecamp requirements check  2026-03-01 04:12:00
        [PASS] r : 4.4.1 at /usr/bin/Rscript
        [PASS] quarto : 1.5.57 at /opt/quarto/bin/quarto
        Packages (cran):
        [PASS] readr
        [PASS] fmsb
        Installed: 2/2
        RESULT: PASS
        "###);
    }

    #[test]
    fn render_fail_format() {
        insta::assert_snapshot!(sample_report(false).render(), @r###"
        Basecamp requirements check  2026-03-01 04:12:00
        [PASS] r : 4.4.1 at /usr/bin/Rscript
        [FAIL] quarto : not found
        Packages (cran):
        [PASS] readr
        [FAIL] fmsb
        Installed: 1/2
        RESULT: FAIL
        "###);
    }

    #[test]
    fn verdict_is_last_line_and_parseable() {
        let rendered = sample_report(false).render();
        let last = rendered.lines().last().unwrap();
        assert_eq!(last, "RESULT: FAIL");
    }

    #[test]
    fn write_replaces_previous_report() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("requirements_check.log");

        sample_report(false).write(&path).unwrap();
        sample_report(true).write(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("RESULT: PASS\n"));
        assert_eq!(content.matches("Basecamp requirements check").count(), 1);
    }

    #[test]
    fn empty_package_set_renders_zero_summary() {
        let mut report = sample_report(true);
        report.package_sets.push(SetReport {
            set: "texlive".to_string(),
            packages: vec![],
        });
        let rendered = report.render();
        assert!(rendered.contains("Packages (texlive):\nInstalled: 0/0"));
        // An empty set cannot fail the verdict.
        assert!(report.overall_pass());
    }

    #[test]
    fn report_serializes_round_trip() {
        let report = sample_report(true);
        let json = serde_json::to_string(&report).unwrap();
        let parsed: RequirementsReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.generated_at, report.generated_at);
        assert_eq!(parsed.components.len(), 2);
    }
}

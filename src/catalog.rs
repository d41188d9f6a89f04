//! Compiled-in provisioning declarations.
//!
//! Everything the orchestrator provisions is declared here: the three
//! toolchain components in dependency order, and the two library package
//! sets. Nothing is user-configurable at invocation time; the only runtime
//! input is the install directory.
//!
//! Candidate paths and URLs are ordered most-likely-first. Extending
//! coverage to a new install layout or mirror is a data change in this file.

use crate::resolve::{ProbePlan, ProbeStrategy, Version, VersionQuery};
use std::path::PathBuf;

/// Default wait ceiling for an unattended installer run.
const INSTALL_TIMEOUT_SECS: u64 = 1800;

/// How to execute a component's installer unattended.
#[derive(Debug, Clone)]
pub enum InstallMethod {
    /// Run the downloaded artifact itself with silent flags.
    RunArtifact { args: Vec<String> },

    /// Run the downloaded artifact through another program
    /// (`msiexec /i <artifact> /qn`, `dpkg -i <artifact>`).
    RunWith {
        program: PathBuf,
        args_before: Vec<String>,
        args_after: Vec<String>,
    },

    /// Install through an already-provisioned component
    /// (`quarto install tinytex --no-prompt`). No artifact download.
    ViaComponent { component: String, args: Vec<String> },
}

/// A third-party runtime or engine the toolchain needs.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Short name used in outcomes and the report (`r`, `quarto`, `tinytex`).
    pub name: String,
    /// Display name for log lines.
    pub display: String,
    /// Minimum acceptable version; `None` means latest-discovered policy.
    pub minimum_version: Option<Version>,
    /// How to find an existing install.
    pub probe: ProbePlan,
    /// Extra layout variants probed only after an install attempt, for
    /// layouts that differ by product version.
    pub layout_variants: Vec<ProbeStrategy>,
    /// Installer artifact URLs in priority order (empty for `ViaComponent`).
    pub urls: Vec<String>,
    /// File name for the downloaded artifact.
    pub artifact_name: String,
    /// Pinned artifact digest, when the mirror publishes one.
    pub expected_sha256: Option<String>,
    /// Unattended execution recipe.
    pub install: InstallMethod,
    /// Wait ceiling for the installer run, in seconds.
    pub install_timeout_secs: u64,
    /// Components that must be satisfied before this one installs.
    pub requires: Vec<String>,
}

/// Which package manager installs a package set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManagerKind {
    /// CRAN packages via `Rscript`, into a private library directory.
    Cran,
    /// TeX Live packages via `tlmgr`.
    TexLive,
}

/// A declared set of library packages.
#[derive(Debug, Clone)]
pub struct PackageSet {
    /// Set name used in the report sub-section (`cran`, `texlive`).
    pub name: String,
    /// Component whose binary performs the install; a hard precondition.
    pub runtime: String,
    pub kind: PackageManagerKind,
    /// Private library directory, relative to the install dir (CRAN only).
    pub library_subdir: Option<String>,
    /// Declared package names. Order is for log readability only.
    pub packages: Vec<String>,
}

/// The full compiled-in catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Components in declared dependency order.
    pub components: Vec<ComponentSpec>,
    pub package_sets: Vec<PackageSet>,
}

impl Catalog {
    /// The production catalog: R, Quarto, TinyTeX, CRAN + TeX Live packages.
    pub fn new() -> Self {
        Self {
            components: vec![r_component(), quarto_component(), tinytex_component()],
            package_sets: vec![cran_packages(), texlive_packages()],
        }
    }

    /// Look up a component by name.
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn r_component() -> ComponentSpec {
    let strategies = if cfg!(windows) {
        vec![
            ProbeStrategy::SearchPath,
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from(r"C:\Program Files\R"),
                prefix: "R-".to_string(),
                subpath: PathBuf::from(r"bin\Rscript.exe"),
            },
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from(r"C:\Program Files\R"),
                prefix: "R-".to_string(),
                subpath: PathBuf::from(r"bin\x64\Rscript.exe"),
            },
        ]
    } else {
        vec![
            ProbeStrategy::SearchPath,
            ProbeStrategy::FixedDirs(vec![
                PathBuf::from("/usr/bin"),
                PathBuf::from("/usr/local/bin"),
            ]),
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from("/opt/R"),
                prefix: String::new(),
                subpath: PathBuf::from("bin/Rscript"),
            },
        ]
    };

    let (urls, artifact_name, install) = if cfg!(windows) {
        (
            vec![
                "https://cran.r-project.org/bin/windows/base/R-4.4.1-win.exe".to_string(),
                "https://cloud.r-project.org/bin/windows/base/R-4.4.1-win.exe".to_string(),
                "https://cran.rstudio.com/bin/windows/base/R-4.4.1-win.exe".to_string(),
            ],
            "R-4.4.1-win.exe".to_string(),
            InstallMethod::RunArtifact {
                args: vec![
                    "/VERYSILENT".to_string(),
                    "/SUPPRESSMSGBOXES".to_string(),
                    "/NORESTART".to_string(),
                ],
            },
        )
    } else {
        (
            vec![
                "https://cdn.posit.co/r/ubuntu-2204/pkgs/r-4.4.1_1_amd64.deb".to_string(),
                "https://cdn.rstudio.com/r/ubuntu-2204/pkgs/r-4.4.1_1_amd64.deb".to_string(),
            ],
            "r-4.4.1_amd64.deb".to_string(),
            InstallMethod::RunWith {
                program: PathBuf::from("apt-get"),
                args_before: vec![
                    "install".to_string(),
                    "-y".to_string(),
                    "--fix-broken".to_string(),
                ],
                args_after: vec![],
            },
        )
    };

    ComponentSpec {
        name: "r".to_string(),
        display: "R".to_string(),
        minimum_version: Version::parse("4.3.0"),
        probe: ProbePlan {
            binary: "Rscript".to_string(),
            strategies,
            version_query: Some(VersionQuery {
                args: vec!["--version".to_string()],
                pattern: r"version (\d+\.\d+\.\d+)".to_string(),
            }),
        },
        layout_variants: if cfg!(windows) {
            vec![ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from(r"C:\Program Files\R"),
                prefix: "R-".to_string(),
                subpath: PathBuf::from(r"bin\i386\Rscript.exe"),
            }]
        } else {
            vec![ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from("/opt/R"),
                prefix: String::new(),
                subpath: PathBuf::from("lib/R/bin/Rscript"),
            }]
        },
        urls,
        artifact_name,
        expected_sha256: None,
        install,
        install_timeout_secs: INSTALL_TIMEOUT_SECS,
        requires: vec![],
    }
}

fn quarto_component() -> ComponentSpec {
    let strategies = if cfg!(windows) {
        vec![
            ProbeStrategy::SearchPath,
            ProbeStrategy::FixedDirs(vec![
                PathBuf::from(r"C:\Program Files\Quarto\bin"),
                PathBuf::from(r"C:\Program Files (x86)\Quarto\bin"),
            ]),
        ]
    } else {
        vec![
            ProbeStrategy::SearchPath,
            ProbeStrategy::FixedDirs(vec![
                PathBuf::from("/opt/quarto/bin"),
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/lib/quarto/bin"),
            ]),
        ]
    };

    let (urls, artifact_name, install) = if cfg!(windows) {
        (
            vec![
                "https://github.com/quarto-dev/quarto-cli/releases/download/v1.5.57/quarto-1.5.57-win.msi".to_string(),
                "https://quarto.org/download/latest/quarto-win.msi".to_string(),
            ],
            "quarto-1.5.57-win.msi".to_string(),
            InstallMethod::RunWith {
                program: PathBuf::from("msiexec"),
                args_before: vec!["/i".to_string()],
                args_after: vec!["/qn".to_string(), "/norestart".to_string()],
            },
        )
    } else {
        (
            vec![
                "https://github.com/quarto-dev/quarto-cli/releases/download/v1.5.57/quarto-1.5.57-linux-amd64.deb".to_string(),
                "https://quarto.org/download/latest/quarto-linux-amd64.deb".to_string(),
            ],
            "quarto-1.5.57-linux-amd64.deb".to_string(),
            InstallMethod::RunWith {
                program: PathBuf::from("dpkg"),
                args_before: vec!["-i".to_string()],
                args_after: vec![],
            },
        )
    };

    ComponentSpec {
        name: "quarto".to_string(),
        display: "Quarto".to_string(),
        minimum_version: Version::parse("1.4.0"),
        probe: ProbePlan {
            binary: "quarto".to_string(),
            strategies,
            version_query: Some(VersionQuery {
                args: vec!["--version".to_string()],
                pattern: r"(\d+\.\d+\.\d+)".to_string(),
            }),
        },
        layout_variants: vec![],
        urls,
        artifact_name,
        expected_sha256: None,
        install,
        install_timeout_secs: INSTALL_TIMEOUT_SECS,
        requires: vec![],
    }
}

fn tinytex_component() -> ComponentSpec {
    // TinyTeX installs under the invoking account's profile, and the
    // tlmgr location moves with the TeX Live release and architecture.
    let strategies = if cfg!(windows) {
        vec![
            ProbeStrategy::SearchPath,
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from(r"C:\ProgramData\TinyTeX\bin"),
                prefix: String::new(),
                subpath: PathBuf::from("tlmgr.bat"),
            },
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from(r"C:\Windows\System32\config\systemprofile\AppData\Roaming\TinyTeX\bin"),
                prefix: String::new(),
                subpath: PathBuf::from("tlmgr.bat"),
            },
        ]
    } else {
        vec![
            ProbeStrategy::SearchPath,
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from("/opt/TinyTeX/bin"),
                prefix: String::new(),
                subpath: PathBuf::from("tlmgr"),
            },
            ProbeStrategy::VersionedSubdir {
                parent: PathBuf::from("/root/.TinyTeX/bin"),
                prefix: String::new(),
                subpath: PathBuf::from("tlmgr"),
            },
        ]
    };

    ComponentSpec {
        name: "tinytex".to_string(),
        display: "TinyTeX".to_string(),
        minimum_version: None,
        probe: ProbePlan {
            binary: "tlmgr".to_string(),
            strategies,
            version_query: Some(VersionQuery {
                args: vec!["--version".to_string()],
                pattern: r"TeX Live.*version (\d+)".to_string(),
            }),
        },
        layout_variants: vec![],
        urls: vec![],
        artifact_name: String::new(),
        expected_sha256: None,
        install: InstallMethod::ViaComponent {
            component: "quarto".to_string(),
            args: vec![
                "install".to_string(),
                "tinytex".to_string(),
                "--no-prompt".to_string(),
                "--update-path".to_string(),
            ],
        },
        install_timeout_secs: INSTALL_TIMEOUT_SECS,
        requires: vec!["quarto".to_string()],
    }
}

fn cran_packages() -> PackageSet {
    PackageSet {
        name: "cran".to_string(),
        runtime: "r".to_string(),
        kind: PackageManagerKind::Cran,
        library_subdir: Some("r-library".to_string()),
        packages: [
            "readr", "dplyr", "tidyr", "stringr", "purrr", "tibble", "forcats", "lubridate",
            "ggplot2", "scales", "fmsb", "jsonlite", "knitr", "rmarkdown",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

fn texlive_packages() -> PackageSet {
    PackageSet {
        name: "texlive".to_string(),
        runtime: "tinytex".to_string(),
        kind: PackageManagerKind::TexLive,
        library_subdir: None,
        packages: [
            "koma-script",
            "caption",
            "fancyhdr",
            "geometry",
            "fontawesome5",
            "tcolorbox",
            "environ",
            "pdfcol",
            "tikzfill",
            "mdframed",
            "zref",
            "needspace",
            "bookmark",
            "footmisc",
            "multirow",
            "wrapfig",
            "colortbl",
            "titling",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

//! Component location probing.
//!
//! Each component declares an ordered list of [`ProbeStrategy`] values; the
//! [`Resolver`] tries them in sequence and stops at the first hit. Adding a
//! new install layout is a data change in the catalog, not a new branch here.
//!
//! Probing is a normal pre-condition check: "absent" is a result, not an
//! error, and probing has no side effects beyond running a version query.

use crate::resolve::version::{extract_version, Version};
use crate::shell::{is_executable, run, Invocation, RunOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Wait ceiling for a version query child process.
const VERSION_QUERY_TIMEOUT_SECS: u64 = 20;

/// One way a component's binary might be found on this machine.
#[derive(Debug, Clone)]
pub enum ProbeStrategy {
    /// The process search path, checked first.
    SearchPath,

    /// A fixed list of conventional install directories.
    FixedDirs(Vec<PathBuf>),

    /// A scan under a known parent for entries whose name starts with a
    /// prefix, newest version first. Covers layouts that move with the
    /// product version (`R-4.4.1/`, TinyTeX `bin/<arch>/`).
    VersionedSubdir {
        parent: PathBuf,
        prefix: String,
        /// Path from the matched entry down to the binary.
        subpath: PathBuf,
    },
}

/// How to ask a located binary for its version.
#[derive(Debug, Clone)]
pub struct VersionQuery {
    /// Arguments passed to the binary (e.g. `["--version"]`).
    pub args: Vec<String>,
    /// Regex whose first capture group is the dotted version.
    pub pattern: String,
}

/// What the resolver knows about a component after probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// No candidate path exists.
    Absent,

    /// A candidate exists; version is `None` when the query produced no
    /// parseable version ("present, version unknown").
    Present {
        path: PathBuf,
        version: Option<Version>,
    },
}

impl Resolution {
    /// Whether any candidate was found.
    pub fn is_present(&self) -> bool {
        matches!(self, Resolution::Present { .. })
    }

    /// The located binary path, if present.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Present { path, .. } => Some(path),
            Resolution::Absent => None,
        }
    }

    /// The extracted version, if present and parseable.
    pub fn version(&self) -> Option<&Version> {
        match self {
            Resolution::Present { version, .. } => version.as_ref(),
            Resolution::Absent => None,
        }
    }

    /// Whether this resolution satisfies a minimum-version requirement.
    ///
    /// With no minimum (latest-discovered policy) any presence satisfies.
    /// A present binary whose version could not be extracted also satisfies:
    /// treating "version unknown" as stale would re-install on every run and
    /// break idempotent re-entry.
    pub fn satisfies(&self, minimum: Option<&Version>) -> bool {
        match self {
            Resolution::Absent => false,
            Resolution::Present { version, .. } => match (minimum, version) {
                (None, _) | (_, None) => true,
                (Some(min), Some(found)) => found.satisfies(min),
            },
        }
    }

    /// Human-readable detail for log lines and the requirements report.
    pub fn detail(&self) -> String {
        match self {
            Resolution::Absent => "not found".to_string(),
            Resolution::Present {
                path,
                version: Some(v),
            } => format!("{} at {}", v, path.display()),
            Resolution::Present {
                path,
                version: None,
            } => format!("version unknown at {}", path.display()),
        }
    }
}

/// The probe plan for one component: what binary to look for, where, and
/// how to ask it for its version.
#[derive(Debug, Clone)]
pub struct ProbePlan {
    /// Binary name, without platform extension.
    pub binary: String,
    /// Ordered strategies; first hit wins.
    pub strategies: Vec<ProbeStrategy>,
    /// Version query, or `None` for presence-only components.
    pub version_query: Option<VersionQuery>,
}

/// Parse the system PATH environment variable into a list of directories.
pub fn parse_system_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default()
}

/// Candidate file names for a binary on this platform.
fn candidate_names(binary: &str) -> Vec<String> {
    if cfg!(windows) {
        vec![
            format!("{binary}.exe"),
            format!("{binary}.bat"),
            format!("{binary}.cmd"),
            binary.to_string(),
        ]
    } else {
        vec![binary.to_string()]
    }
}

/// Find a binary by iterating over directory entries.
///
/// Returns the first match that exists and is executable. Does NOT use the
/// `which` command — its behavior varies across systems and it is sometimes
/// a shell builtin with inconsistent error handling.
pub fn find_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        for name in candidate_names(binary) {
            let candidate = dir.join(&name);
            if candidate.is_file() && is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

/// Scan `parent` for entries named `<prefix>*`, newest version first,
/// returning the first entry whose `subpath` exists and is executable.
fn find_versioned_subdir(parent: &Path, prefix: &str, subpath: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(parent).ok()?;

    let mut matches: Vec<(Option<Version>, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix))
        })
        .map(|p| {
            let version = p
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Version::parse(n.trim_start_matches(prefix).trim_start_matches('-')));
            (version, p)
        })
        .collect();

    // Newest parseable version first; unversioned entries last.
    matches.sort_by(|(va, pa), (vb, pb)| match (va, vb) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => pb.cmp(pa),
    });

    for (_, entry) in matches {
        let candidate = entry.join(subpath);
        if candidate.is_file() && is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Locates installed components by trying probe strategies in order.
///
/// The resolver carries the extra directories published to the machine-wide
/// environment store during this run, so a component installed two steps ago
/// is visible without restarting the process.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    extra_dirs: Vec<PathBuf>,
}

impl Resolver {
    /// A resolver over the current process search path only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add directories to search before the process search path.
    ///
    /// Duplicates are ignored.
    pub fn add_dirs(&mut self, dirs: impl IntoIterator<Item = PathBuf>) {
        for dir in dirs {
            if !self.extra_dirs.contains(&dir) {
                self.extra_dirs.push(dir);
            }
        }
    }

    /// The directories a `SearchPath` probe will consult, in order.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.extra_dirs.clone();
        dirs.extend(parse_system_path());
        dirs
    }

    /// Find the first candidate path for a plan, without a version query.
    pub fn locate(&self, plan: &ProbePlan) -> Option<PathBuf> {
        for strategy in &plan.strategies {
            let hit = match strategy {
                ProbeStrategy::SearchPath => find_in_dirs(&plan.binary, &self.search_dirs()),
                ProbeStrategy::FixedDirs(dirs) => find_in_dirs(&plan.binary, dirs),
                ProbeStrategy::VersionedSubdir {
                    parent,
                    prefix,
                    subpath,
                } => find_versioned_subdir(parent, prefix, subpath),
            };
            if hit.is_some() {
                return hit;
            }
        }
        None
    }

    /// Probe a plan fully: first candidate path plus extracted version.
    pub fn resolve(&self, plan: &ProbePlan) -> Resolution {
        let Some(path) = self.locate(plan) else {
            return Resolution::Absent;
        };

        let version = plan.version_query.as_ref().and_then(|query| {
            let args: Vec<&str> = query.args.iter().map(|s| s.as_str()).collect();
            let invocation = Invocation::new(&path, &args);
            run(
                &invocation,
                &RunOptions::with_timeout(VERSION_QUERY_TIMEOUT_SECS),
            )
            .ok()
            .and_then(|result| extract_version(&result.combined_output(), &query.pattern))
        });

        Resolution::Present { path, version }
    }
}

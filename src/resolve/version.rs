//! Version parsing, extraction, and comparison.
//!
//! Component versions come from running a candidate binary with its
//! version-query argument (`Rscript --version`, `quarto --version`,
//! `tlmgr --version`) and applying a per-component regex to the output.
//! Tools disagree about where the version lives (stdout vs stderr, leading
//! banner text), so extraction scans the combined output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A dotted numeric version, compared component by component.
///
/// Non-numeric trailing parts (`4.4.1-beta`) are ignored past the first
/// non-parsing component; a longer version with equal leading components
/// is considered newer (`1.2.1` > `1.2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    parts: Vec<u32>,
    raw: String,
}

impl Version {
    /// Parse a version string like `4.4.1`.
    ///
    /// Returns `None` if no leading numeric component can be parsed.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let parts: Vec<u32> = trimmed
            .split('.')
            .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
            .take_while(|p| !p.is_empty())
            .filter_map(|p| p.parse().ok())
            .collect();

        if parts.is_empty() {
            return None;
        }

        Some(Self {
            parts,
            raw: trimmed.to_string(),
        })
    }

    /// The original string this version was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether this version satisfies `minimum` (i.e. `self >= minimum`).
    pub fn satisfies(&self, minimum: &Version) -> bool {
        self >= minimum
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.parts.iter().zip(other.parts.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", rendered.join("."))
    }
}

/// Extract a version from tool output using a component-specific pattern.
///
/// The pattern's first capture group must match the dotted version. Returns
/// `None` if the pattern doesn't match or the capture doesn't parse — the
/// caller treats that as "present, version unknown", not an error.
pub fn extract_version(output: &str, pattern: &str) -> Option<Version> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(output)?;
    let captured = caps.get(1)?.as_str();
    Version::parse(captured)
}

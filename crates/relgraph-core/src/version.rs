//! Version precedence.
//!
//! Versions are compared by semantic-versioning precedence: numeric
//! major/minor/patch, then pre-release (a pre-release sorts before its
//! release). Build metadata is ignored. When any version in a compared set is
//! not valid semver, the whole set is ordered by byte-wise string comparison
//! and results computed from it are flagged approximate.

use std::cmp::Ordering;

use semver::{Prerelease, Version};

use crate::error::VersionParseError;

/// Parse a version string as semver.
///
/// A leading `v` and surrounding whitespace are accepted; `1` and `1.2` are
/// padded to three components.
pub fn parse_version(input: &str) -> Result<Version, VersionParseError> {
    let trimmed = input.trim();
    let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if let Ok(version) = Version::parse(body) {
        return Ok(version);
    }

    let (core, rest) = match body.find(&['-', '+'][..]) {
        Some(idx) => body.split_at(idx),
        None => (body, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    let numeric = !parts.is_empty()
        && parts.len() < 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if numeric {
        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        padded.push_str(rest);
        if let Ok(version) = Version::parse(&padded) {
            return Ok(version);
        }
    }
    Err(VersionParseError::new(input, "not a semantic version"))
}

fn precedence_key(v: &Version) -> (u64, u64, u64, &Prerelease) {
    (v.major, v.minor, v.patch, &v.pre)
}

/// Compare two parsed versions by precedence, ignoring build metadata.
pub fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    precedence_key(a).cmp(&precedence_key(b))
}

/// Ordering mode for a set of version strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Semantic,
    /// At least one version is not semver; byte order is used throughout.
    Lexicographic,
}

impl Precedence {
    pub fn for_versions<'a>(versions: impl IntoIterator<Item = &'a str>) -> Self {
        if versions
            .into_iter()
            .all(|v| parse_version(v).is_ok())
        {
            Precedence::Semantic
        } else {
            Precedence::Lexicographic
        }
    }

    pub fn is_approximate(self) -> bool {
        self == Precedence::Lexicographic
    }

    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Precedence::Semantic => match (parse_version(a), parse_version(b)) {
                (Ok(a), Ok(b)) => cmp_precedence(&a, &b),
                _ => a.as_bytes().cmp(b.as_bytes()),
            },
            Precedence::Lexicographic => a.as_bytes().cmp(b.as_bytes()),
        }
    }
}

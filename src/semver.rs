//! Semantic version values used by the semver matchers.
//!
//! Ordering follows semver precedence with two local rules shared by all SDKs: pre-release
//! components that parse as integers compare numerically (so `01` equals `1`), and build metadata is
//! ignored entirely, including for equality.
use std::{cmp::Ordering, fmt, hash::Hash, str::FromStr};

use crate::error::SemverParseError;

const METADATA_DELIMITER: char = '+';
const PRE_RELEASE_DELIMITER: char = '-';
const VALUE_DELIMITER: char = '.';

/// A parsed `major.minor.patch[-prerelease][+metadata]` version.
#[derive(Debug, Clone)]
pub struct Semver {
    major: i64,
    minor: i64,
    patch: i64,
    pre_release: Vec<String>,
    metadata: Option<String>,
    /// `major.minor.patch[-prerelease]` with numeric pre-release components normalized. Used for
    /// equality and hashing.
    version: String,
}

impl Semver {
    /// Parse a version string, failing with [`SemverParseError::InvalidFormat`].
    pub fn parse(input: &str) -> Result<Semver, SemverParseError> {
        let invalid = || SemverParseError::InvalidFormat(input.to_owned());

        let (without_metadata, metadata) = match input.split_once(METADATA_DELIMITER) {
            Some((_, "")) => return Err(invalid()),
            Some((rest, metadata)) => (rest, Some(metadata.to_owned())),
            None => (input, None),
        };

        let (core, pre_release) = match without_metadata.split_once(PRE_RELEASE_DELIMITER) {
            Some((_, "")) => return Err(invalid()),
            Some((core, pre_release)) => {
                let components: Vec<String> = pre_release
                    .split(VALUE_DELIMITER)
                    .map(str::to_owned)
                    .collect();
                if components.iter().any(String::is_empty) {
                    return Err(invalid());
                }
                (core, components)
            }
            None => (without_metadata, Vec::new()),
        };

        let parts: Vec<&str> = core.split(VALUE_DELIMITER).collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(invalid());
        };
        let major: i64 = major.parse().map_err(|_| invalid())?;
        let minor: i64 = minor.parse().map_err(|_| invalid())?;
        let patch: i64 = patch.parse().map_err(|_| invalid())?;

        let version = normalize(major, minor, patch, &pre_release);

        Ok(Semver {
            major,
            minor,
            patch,
            pre_release,
            metadata,
            version,
        })
    }

    /// Normalized version string, without build metadata.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Build metadata, if any. Not taken into account for comparisons.
    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// Whether the version has no pre-release components.
    pub fn is_stable(&self) -> bool {
        self.pre_release.is_empty()
    }
}

fn normalize(major: i64, minor: i64, patch: i64, pre_release: &[String]) -> String {
    let mut version = format!("{major}.{minor}.{patch}");
    if !pre_release.is_empty() {
        let components: Vec<String> = pre_release
            .iter()
            .map(|c| match c.parse::<i64>() {
                Ok(n) => n.to_string(),
                Err(_) => c.clone(),
            })
            .collect();
        version.push(PRE_RELEASE_DELIMITER);
        version.push_str(&components.join("."));
    }
    version
}

fn compare_components(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl FromStr for Semver {
    type Err = SemverParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Semver::parse(s)
    }
}

impl PartialEq for Semver {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for Semver {}

impl Hash for Semver {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.version.hash(state);
    }
}

impl PartialOrd for Semver {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Semver {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.version == other.version {
            return Ordering::Equal;
        }

        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (self.is_stable(), other.is_stable()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => self
                    .pre_release
                    .iter()
                    .zip(&other.pre_release)
                    .map(|(a, b)| compare_components(a, b))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or_else(|| self.pre_release.len().cmp(&other.pre_release.len())),
            })
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version)?;
        if let Some(metadata) = &self.metadata {
            write!(f, "{METADATA_DELIMITER}{metadata}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Semver;

    fn v(s: &str) -> Semver {
        Semver::parse(s).unwrap()
    }

    #[test]
    fn orders_release_versions() {
        assert!(v("1.2.3") < v("1.2.4"));
        assert!(v("1.2.4") < v("1.3.0"));
        assert!(v("1.3.0") < v("2.0.0"));
        assert!(v("1.10.0") > v("1.9.9"));
    }

    #[test]
    fn orders_pre_releases() {
        assert!(v("1.0.0-alpha") < v("1.0.0-alpha.1"));
        assert!(v("1.0.0-alpha.1") < v("1.0.0-beta"));
        assert!(v("1.0.0-beta") < v("1.0.0"));
        assert!(v("1.0.0-beta.2") < v("1.0.0-beta.11"));
        assert!(v("1.0.0-1") < v("1.0.0-alpha"));
        assert!(v("1.0.0-rc.1") < v("1.0.0-rc.1.1"));
    }

    #[test]
    fn ignores_metadata() {
        assert_eq!(v("1.2.3+build.5"), v("1.2.3"));
        assert_eq!(v("1.2.3-rc.1+abc"), v("1.2.3-rc.1+def"));
        assert_eq!(v("1.2.3+build.5").metadata(), Some("build.5"));
        assert_eq!(v("1.2.3+build.5").to_string(), "1.2.3+build.5");
    }

    #[test]
    fn normalizes_numeric_pre_release_components() {
        assert_eq!(v("1.0.0-rc.01"), v("1.0.0-rc.1"));
        assert_eq!(v("1.0.0-rc.01").version(), "1.0.0-rc.1");
    }

    #[test]
    fn rejects_malformed_versions() {
        for input in [
            "1.2", "1.2.3-", "1.2.3+", "1.2.3-rc..1", "1.2.3.4", "a.b.c", "", "1.2.x",
        ] {
            assert!(Semver::parse(input).is_err(), "{input:?} should not parse");
        }
    }
}

use crate::error::{ContractDbError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A contract version: `major.minor.patch[-prerelease][+build]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: String,
    pub build: String,
}

impl Version {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || ContractDbError::InvalidVersion(format!("Invalid version: {input}"));

        let (rest, build) = match input.split_once('+') {
            Some((rest, build)) => (rest, build.to_string()),
            None => (input, String::new()),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) => (core, pre.to_string()),
            None => (rest, String::new()),
        };

        let mut parts = core.split('.');
        let mut next = || -> Result<u64> {
            match parts.next() {
                // Partial versions such as "1" or "1.2" fill the rest with zeroes
                None => Ok(0),
                Some(p) => p.parse::<u64>().map_err(|_| invalid()),
            }
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() || core.is_empty() {
            return Err(invalid());
        }

        Ok(Version {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }
}

impl Default for Version {
    fn default() -> Self {
        Version {
            major: 1,
            minor: 0,
            patch: 0,
            prerelease: String::new(),
            build: String::new(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease.is_empty() {
            write!(f, "-{}", self.prerelease)?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.prerelease.is_empty(), other.prerelease.is_empty()) {
                // A release sorts after any of its prereleases
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => self.prerelease.cmp(&other.prerelease),
            })
            .then_with(|| self.build.cmp(&other.build))
    }
}

/// The version part of a `slug@version` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRef {
    Exact(Version),
    Latest,
}

/// Split a `slug@version` reference. The version is mandatory and may be
/// `latest`.
pub fn parse_reference(reference: &str) -> Result<(String, VersionRef)> {
    let (slug, version) = match reference.split_once('@') {
        Some((slug, version)) if !version.is_empty() => (slug, version),
        _ => {
            return Err(ContractDbError::InvalidVersion(format!(
                "No version reference: {reference}"
            )))
        }
    };

    if slug.is_empty() {
        return Err(ContractDbError::InvalidSlug("Slug is undefined".into()));
    }

    let version = if version == "latest" {
        VersionRef::Latest
    } else {
        VersionRef::Exact(Version::parse(version)?)
    };

    Ok((slug.to_string(), version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_version() {
        let v = Version::parse("2.3.4-beta.1+build5").unwrap();
        assert_eq!(v.major, 2);
        assert_eq!(v.minor, 3);
        assert_eq!(v.patch, 4);
        assert_eq!(v.prerelease, "beta.1");
        assert_eq!(v.build, "build5");
        assert_eq!(v.to_string(), "2.3.4-beta.1+build5");
    }

    #[test]
    fn test_parse_partial_version() {
        assert_eq!(Version::parse("1").unwrap().to_string(), "1.0.0");
        assert_eq!(Version::parse("1.2").unwrap().to_string(), "1.2.0");
    }

    #[test]
    fn test_invalid_versions() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("a.b.c").is_err());
        assert!(Version::parse("1.2.3.4").is_err());
    }

    #[test]
    fn test_ordering() {
        let a = Version::parse("1.0.0-alpha").unwrap();
        let b = Version::parse("1.0.0").unwrap();
        let c = Version::parse("1.10.0").unwrap();
        let d = Version::parse("1.9.9").unwrap();
        assert!(a < b);
        assert!(b < d);
        assert!(d < c);
    }

    #[test]
    fn test_parse_reference() {
        let (slug, version) = parse_reference("user@1.0.0").unwrap();
        assert_eq!(slug, "user");
        assert_eq!(version, VersionRef::Exact(Version::default()));

        let (_, latest) = parse_reference("user@latest").unwrap();
        assert_eq!(latest, VersionRef::Latest);

        assert!(matches!(
            parse_reference("user"),
            Err(ContractDbError::InvalidVersion(_))
        ));
        assert!(matches!(
            parse_reference("@1.0.0"),
            Err(ContractDbError::InvalidSlug(_))
        ));
    }
}

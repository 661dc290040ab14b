//! Semantic version handling for tavern packages.
//!
//! [`Version`] is a semver triple plus optional pre-release and build
//! identifiers. Ordering is strict semver: numeric components compare
//! numerically and a pre-release sorts *below* its release (`1.0.0-alpha <
//! 1.0.0`). Equality and hashing ignore build metadata, so `1.0.0+a` and
//! `1.0.0+b` name the same version everywhere the solver and lockfile are
//! concerned.
//!
//! Component grammar (identifier syntax, leading-zero rules) is delegated to
//! the `semver` crate; this module owns ordering and the operations the
//! constraint algebra needs. See [`constraints`] for ranges and constraint
//! sets.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use anyhow::Result;
use semver::{BuildMetadata, Prerelease};
use serde::{Deserialize, Serialize};

use crate::core::TavernError;

pub mod constraints;

pub use constraints::{VersionConstraint, VersionRange};

/// A parsed semantic version.
#[derive(Debug, Clone)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Pre-release identifiers, empty for a release version.
    pub pre: Prerelease,
    /// Build metadata. Ignored by equality, ordering, and hashing.
    pub build: BuildMetadata,
}

impl Version {
    /// Construct a release version with no pre-release or build identifiers.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Prerelease::EMPTY,
            build: BuildMetadata::EMPTY,
        }
    }

    /// Parse a version string per the semver grammar.
    ///
    /// # Errors
    ///
    /// Returns [`TavernError::ParseError`] when `text` is not a valid
    /// semantic version.
    pub fn parse(text: &str) -> Result<Self> {
        let parsed = semver::Version::parse(text.trim()).map_err(|e| TavernError::ParseError {
            subject: format!("version \"{text}\""),
            reason: e.to_string(),
        })?;
        Ok(Self {
            major: parsed.major,
            minor: parsed.minor,
            patch: parsed.patch,
            pre: parsed.pre,
            build: parsed.build,
        })
    }

    /// Whether this version carries pre-release identifiers.
    #[must_use]
    pub fn is_pre_release(&self) -> bool {
        !self.pre.is_empty()
    }

    /// The smallest version that is a breaking change from this one.
    ///
    /// This is the exclusive upper bound of a caret constraint: the first
    /// non-zero component is incremented, so `^1.2.3` means `<2.0.0` and
    /// `^0.1.2` means `<0.2.0`.
    #[must_use]
    pub fn next_breaking(&self) -> Self {
        if self.major > 0 {
            Self::new(self.major + 1, 0, 0)
        } else if self.minor > 0 {
            Self::new(0, self.minor + 1, 0)
        } else {
            Self::new(0, 0, self.patch + 1)
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.major == other.major
            && self.minor == other.minor
            && self.patch == other.patch
            && self.pre == other.pre
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.patch.hash(state);
        self.pre.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            // semver::Prerelease orders the empty pre-release above any
            // non-empty one, which is exactly the release-above-pre rule.
            .then_with(|| self.pre.cmp(&other.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

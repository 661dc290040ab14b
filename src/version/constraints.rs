//! Version constraint algebra: ranges, unions, intersection.
//!
//! A [`VersionRange`] is an interval over [`Version`]s with independently
//! inclusive or exclusive endpoints, unbounded in either direction. A
//! [`VersionConstraint`] is the closed union type over ranges: the empty
//! constraint, a single range (`any` is the doubly-unbounded range), or a
//! normalized union of disjoint ranges.
//!
//! The solver leans on three guarantees provided here:
//! - `intersect` is total, commutative, and associative,
//! - `allows` is monotone under refinement: intersecting never allows a
//!   version the inputs disallowed,
//! - unions are normalized to a minimal sorted list of disjoint,
//!   non-adjacent ranges, so equality is structural.
//!
//! # Constraint syntax
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `any` | every version |
//! | `1.2.3` | exactly 1.2.3 |
//! | `^1.2.3` | `>=1.2.3` and less than the next breaking version (`2.0.0`) |
//! | `>=1.0.0`, `>1.0.0`, `<=2.0.0`, `<2.0.0`, `=1.2.3` | comparisons |
//! | `>=1.0.0 <2.0.0` | space-separated conjunction (intersection) |

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::TavernError;
use crate::version::Version;

/// A contiguous interval of versions.
///
/// Constructed ranges are never empty: [`VersionRange::new`] returns `None`
/// for an inverted or vacuous interval, and the constraint operations
/// represent emptiness as [`VersionConstraint::Empty`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    /// Lower bound, `None` for unbounded below.
    pub min: Option<Version>,
    /// Upper bound, `None` for unbounded above.
    pub max: Option<Version>,
    /// Whether the lower bound itself is allowed.
    pub include_min: bool,
    /// Whether the upper bound itself is allowed.
    pub include_max: bool,
}

impl VersionRange {
    /// The range allowing every version.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            min: None,
            max: None,
            include_min: false,
            include_max: false,
        }
    }

    /// The range allowing exactly one version.
    #[must_use]
    pub fn exact(version: Version) -> Self {
        Self {
            min: Some(version.clone()),
            max: Some(version),
            include_min: true,
            include_max: true,
        }
    }

    /// Build a range from bounds, or `None` when the interval is empty
    /// (inverted bounds, or equal bounds not both inclusive).
    #[must_use]
    pub fn new(
        min: Option<Version>,
        include_min: bool,
        max: Option<Version>,
        include_max: bool,
    ) -> Option<Self> {
        if let (Some(lo), Some(hi)) = (&min, &max) {
            match lo.cmp(hi) {
                Ordering::Greater => return None,
                Ordering::Equal if !(include_min && include_max) => return None,
                _ => {}
            }
        }
        Some(Self {
            min,
            max,
            include_min,
            include_max,
        })
    }

    /// Whether this range is unbounded on both ends.
    #[must_use]
    pub const fn is_any(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Whether `version` falls inside this range.
    #[must_use]
    pub fn allows(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            match version.cmp(min) {
                Ordering::Less => return false,
                Ordering::Equal if !self.include_min => return false,
                _ => {}
            }
        }
        if let Some(max) = &self.max {
            match version.cmp(max) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.include_max => return false,
                _ => {}
            }
        }
        true
    }

    /// Intersect two ranges, `None` when they are disjoint.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let (min, include_min) = match (&self.min, &other.min) {
            (None, None) => (None, false),
            (Some(a), None) => (Some(a.clone()), self.include_min),
            (None, Some(b)) => (Some(b.clone()), other.include_min),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Greater => (Some(a.clone()), self.include_min),
                Ordering::Less => (Some(b.clone()), other.include_min),
                Ordering::Equal => (Some(a.clone()), self.include_min && other.include_min),
            },
        };
        let (max, include_max) = match (&self.max, &other.max) {
            (None, None) => (None, false),
            (Some(a), None) => (Some(a.clone()), self.include_max),
            (None, Some(b)) => (Some(b.clone()), other.include_max),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => (Some(a.clone()), self.include_max),
                Ordering::Greater => (Some(b.clone()), other.include_max),
                Ordering::Equal => (Some(a.clone()), self.include_max && other.include_max),
            },
        };
        Self::new(min, include_min, max, include_max)
    }

    /// Whether `other` overlaps this range or starts exactly where it ends
    /// with at least one closed endpoint, so the two merge into one interval.
    ///
    /// Assumes `other`'s lower bound is not below this range's (the caller
    /// sorts first).
    fn touches(&self, other: &Self) -> bool {
        let Some(self_max) = &self.max else {
            return true;
        };
        let Some(other_min) = &other.min else {
            return true;
        };
        match other_min.cmp(self_max) {
            Ordering::Less => true,
            Ordering::Equal => self.include_max || other.include_min,
            Ordering::Greater => false,
        }
    }

    /// Merge with a touching range, keeping the looser bound on each end.
    fn merge(&self, other: &Self) -> Self {
        let (min, include_min) = match (&self.min, &other.min) {
            (None, _) | (_, None) => (None, false),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => (Some(a.clone()), self.include_min),
                Ordering::Greater => (Some(b.clone()), other.include_min),
                Ordering::Equal => (Some(a.clone()), self.include_min || other.include_min),
            },
        };
        let (max, include_max) = match (&self.max, &other.max) {
            (None, _) | (_, None) => (None, false),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Greater => (Some(a.clone()), self.include_max),
                Ordering::Less => (Some(b.clone()), other.include_max),
                Ordering::Equal => (Some(a.clone()), self.include_max || other.include_max),
            },
        };
        Self {
            min,
            max,
            include_min,
            include_max,
        }
    }

    /// Order by lower bound; unbounded first, and at equal versions an
    /// inclusive bound starts earlier than an exclusive one.
    fn compare_lower_bound(&self, other: &Self) -> Ordering {
        match (&self.min, &other.min) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a
                .cmp(b)
                .then_with(|| other.include_min.cmp(&self.include_min)),
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "any");
        }
        if let (Some(min), Some(max)) = (&self.min, &self.max)
            && min == max
            && self.include_min
            && self.include_max
        {
            return write!(f, "{min}");
        }
        let mut parts = Vec::with_capacity(2);
        if let Some(min) = &self.min {
            let op = if self.include_min { ">=" } else { ">" };
            parts.push(format!("{op}{min}"));
        }
        if let Some(max) = &self.max {
            let op = if self.include_max { "<=" } else { "<" };
            parts.push(format!("{op}{max}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// A set of allowed versions: nothing, one range, or a union of ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Allows no versions at all.
    Empty,
    /// Allows one contiguous interval. `any` is the doubly-unbounded range.
    Range(VersionRange),
    /// Allows two or more disjoint, non-adjacent ranges, sorted ascending.
    Union(Vec<VersionRange>),
}

impl VersionConstraint {
    /// The constraint allowing every version.
    #[must_use]
    pub const fn any() -> Self {
        Self::Range(VersionRange::any())
    }

    /// The constraint allowing exactly `version`.
    #[must_use]
    pub fn exact(version: Version) -> Self {
        Self::Range(VersionRange::exact(version))
    }

    /// Parse the constraint grammar described in the module docs.
    ///
    /// # Errors
    ///
    /// Returns [`TavernError::ParseError`] on an empty input, an unknown
    /// operator, or a malformed version component.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed == "any" {
            return Ok(Self::any());
        }
        let mut tokens = trimmed.split_whitespace();
        let first = tokens.next().ok_or_else(|| TavernError::ParseError {
            subject: format!("version constraint \"{text}\""),
            reason: "expected a version constraint".into(),
        })?;
        let mut constraint = Self::parse_single(first)?;
        for token in tokens {
            constraint = constraint.intersect(&Self::parse_single(token)?);
        }
        Ok(constraint)
    }

    fn parse_single(token: &str) -> Result<Self> {
        let range = if let Some(rest) = token.strip_prefix('^') {
            let min = Version::parse(rest)?;
            let max = min.next_breaking();
            VersionRange::new(Some(min), true, Some(max), false)
        } else if let Some(rest) = token.strip_prefix(">=") {
            VersionRange::new(Some(Version::parse(rest)?), true, None, false)
        } else if let Some(rest) = token.strip_prefix("<=") {
            VersionRange::new(None, false, Some(Version::parse(rest)?), true)
        } else if let Some(rest) = token.strip_prefix('>') {
            VersionRange::new(Some(Version::parse(rest)?), false, None, false)
        } else if let Some(rest) = token.strip_prefix('<') {
            VersionRange::new(None, false, Some(Version::parse(rest)?), false)
        } else if let Some(rest) = token.strip_prefix('=') {
            Some(VersionRange::exact(Version::parse(rest)?))
        } else {
            Some(VersionRange::exact(Version::parse(token)?))
        };
        let range = range.ok_or_else(|| TavernError::Internal {
            message: format!("single comparison \"{token}\" produced an empty range"),
        })?;
        Ok(Self::Range(range))
    }

    /// Whether no version satisfies this constraint.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Whether every version satisfies this constraint.
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Range(range) if range.is_any())
    }

    /// Whether `version` satisfies this constraint.
    #[must_use]
    pub fn allows(&self, version: &Version) -> bool {
        match self {
            Self::Empty => false,
            Self::Range(range) => range.allows(version),
            Self::Union(ranges) => ranges.iter().any(|range| range.allows(version)),
        }
    }

    fn ranges(&self) -> &[VersionRange] {
        match self {
            Self::Empty => &[],
            Self::Range(range) => std::slice::from_ref(range),
            Self::Union(ranges) => ranges,
        }
    }

    /// The versions allowed by both constraints.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut pieces = Vec::new();
        for a in self.ranges() {
            for b in other.ranges() {
                if let Some(piece) = a.intersect(b) {
                    pieces.push(piece);
                }
            }
        }
        Self::normalize(pieces)
    }

    /// The versions allowed by either constraint.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut pieces: Vec<VersionRange> = self.ranges().to_vec();
        pieces.extend(other.ranges().iter().cloned());
        Self::normalize(pieces)
    }

    /// Collapse an arbitrary list of ranges into canonical form: sorted by
    /// lower bound with every overlapping or adjacent pair merged.
    fn normalize(mut ranges: Vec<VersionRange>) -> Self {
        ranges.sort_by(VersionRange::compare_lower_bound);
        let mut merged: Vec<VersionRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.touches(&range) => *last = last.merge(&range),
                _ => merged.push(range),
            }
        }
        match merged.len() {
            0 => Self::Empty,
            1 => Self::Range(merged.into_iter().next().unwrap_or(VersionRange::any())),
            _ => Self::Union(merged),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "<empty>"),
            Self::Range(range) => write!(f, "{range}"),
            Self::Union(ranges) => {
                let parts: Vec<String> = ranges.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" or "))
            }
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

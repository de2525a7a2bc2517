//! Version ranges as intersections of half-open semver intervals.
//!
//! A range keeps one inclusive low bound and one exclusive high bound;
//! intersecting any number of `[lo, hi)` intervals yields another such
//! interval, so the pair is closed under the only composition we need.
//! Exclusive low bounds (`>x`) and inclusive high bounds (`<=x`) are
//! normalized using the semver successor: the smallest version ordered
//! after `x.y.z` is `x.y.(z+1)-0`.

use std::fmt;
use std::str::FromStr;

use semver::{Prerelease, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("empty version range expression")]
    Empty,

    #[error("bad version {0:?} in range: {1}")]
    BadVersion(String, String),

    #[error("unrecognized range token {0:?}")]
    BadToken(String),
}

/// Parse a possibly-partial version: `1`, `1.2` and `1.2.3` are all accepted,
/// missing components default to zero.
pub fn parse_lenient_version(s: &str) -> Result<(Version, usize), RangeError> {
    let bad = |s: &str, why: &str| RangeError::BadVersion(s.to_string(), why.to_string());
    if let Ok(v) = Version::parse(s) {
        return Ok((v, 3));
    }
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(bad(s, "expected up to three dot-separated components"));
    }
    let mut nums = [0u64; 3];
    for (i, p) in parts.iter().enumerate() {
        nums[i] = p
            .parse::<u64>()
            .map_err(|e| bad(s, &format!("component {p:?}: {e}")))?;
    }
    Ok((Version::new(nums[0], nums[1], nums[2]), parts.len()))
}

/// Smallest version strictly greater than `v`: `v.patch + 1` pre-release `0`.
fn successor(v: &Version) -> Version {
    let mut next = Version::new(v.major, v.minor, v.patch + 1);
    next.pre = Prerelease::new("0").unwrap();
    next
}

/// Exclusive upper bound for a caret requirement on `v` given how many
/// components were written: `^1.2` excludes `2.0.0-0` and up, `^0.2` excludes
/// `0.3.0-0` and up, `^0.0.3` excludes `0.0.4-0` and up.
fn caret_upper(v: &Version) -> Version {
    let mut hi = if v.major > 0 {
        Version::new(v.major + 1, 0, 0)
    } else if v.minor > 0 {
        Version::new(0, v.minor + 1, 0)
    } else {
        Version::new(0, 0, v.patch + 1)
    };
    hi.pre = Prerelease::new("0").unwrap();
    hi
}

fn tilde_upper(v: &Version, written: usize) -> Version {
    let mut hi = if written >= 2 {
        Version::new(v.major, v.minor + 1, 0)
    } else {
        Version::new(v.major + 1, 0, 0)
    };
    hi.pre = Prerelease::new("0").unwrap();
    hi
}

/// An intersection of half-open semver intervals, normalized to `[lo, hi)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    lo: Version,
    hi: Option<Version>,
}

impl VersionRange {
    /// The range admitting every version.
    pub fn any() -> Self {
        let mut lo = Version::new(0, 0, 0);
        lo.pre = Prerelease::new("0").unwrap();
        Self { lo, hi: None }
    }

    /// Exactly `v` (and its build-metadata equals).
    pub fn exact(v: &Version) -> Self {
        Self {
            lo: v.clone(),
            hi: Some(successor(v)),
        }
    }

    /// `[lo, hi)` with an optional upper bound.
    pub fn between(lo: Version, hi: Option<Version>) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, v: &Version) -> bool {
        if *v < self.lo {
            return false;
        }
        match &self.hi {
            Some(hi) => v < hi,
            None => true,
        }
    }

    /// True when no version can satisfy the range.
    pub fn is_empty(&self) -> bool {
        match &self.hi {
            Some(hi) => *hi <= self.lo,
            None => false,
        }
    }

    /// Intersect with another range. May produce an empty range.
    pub fn intersect(&self, other: &Self) -> Self {
        let lo = if self.lo >= other.lo {
            self.lo.clone()
        } else {
            other.lo.clone()
        };
        let hi = match (&self.hi, &other.hi) {
            (None, None) => None,
            (Some(h), None) | (None, Some(h)) => Some(h.clone()),
            (Some(a), Some(b)) => Some(if a <= b { a.clone() } else { b.clone() }),
        };
        Self { lo, hi }
    }

    /// True when the two ranges admit at least one common version boundary.
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Parse a range expression: whitespace- or comma-separated comparator
    /// tokens, all of which must hold.
    ///
    /// Tokens: `*`/`latest`, `=V`, `^V`, `~V`, `>=V`, `>V`, `<V`, `<=V`,
    /// and a bare partial version which acts as a tilde (`1.2` admits
    /// `>=1.2.0 <1.3.0`, `1.2.3` is exact).
    pub fn parse(expr: &str) -> Result<Self, RangeError> {
        let tokens: Vec<&str> = expr
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(RangeError::Empty);
        }

        let mut acc = Self::any();
        for tok in tokens {
            let one = Self::parse_token(tok)?;
            acc = acc.intersect(&one);
        }
        Ok(acc)
    }

    fn parse_token(tok: &str) -> Result<Self, RangeError> {
        if tok == "*" || tok == "latest" {
            return Ok(Self::any());
        }
        if let Some(rest) = tok.strip_prefix("^") {
            let (v, _) = parse_lenient_version(rest)?;
            return Ok(Self::between(v.clone(), Some(caret_upper(&v))));
        }
        if let Some(rest) = tok.strip_prefix("~") {
            let (v, written) = parse_lenient_version(rest)?;
            return Ok(Self::between(v.clone(), Some(tilde_upper(&v, written))));
        }
        if let Some(rest) = tok.strip_prefix(">=") {
            let (v, _) = parse_lenient_version(rest)?;
            return Ok(Self::between(v, None));
        }
        if let Some(rest) = tok.strip_prefix("<=") {
            let (v, _) = parse_lenient_version(rest)?;
            let hi = successor(&v);
            return Ok(Self::between(Self::any().lo, Some(hi)));
        }
        if let Some(rest) = tok.strip_prefix(">") {
            let (v, _) = parse_lenient_version(rest)?;
            return Ok(Self::between(successor(&v), None));
        }
        if let Some(rest) = tok.strip_prefix("<") {
            let (v, _) = parse_lenient_version(rest)?;
            return Ok(Self::between(Self::any().lo, Some(v)));
        }
        if let Some(rest) = tok.strip_prefix("=") {
            let (v, _) = parse_lenient_version(rest)?;
            return Ok(Self::exact(&v));
        }
        // Bare version: exact when fully written, tilde otherwise.
        match parse_lenient_version(tok) {
            Ok((v, 3)) => Ok(Self::exact(&v)),
            Ok((v, written)) => Ok(Self::between(v.clone(), Some(tilde_upper(&v, written)))),
            Err(_) => Err(RangeError::BadToken(tok.to_string())),
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let floor = Self::any().lo;
        match (&self.hi, self.lo == floor) {
            (None, true) => f.write_str("*"),
            (None, false) => write!(f, ">={}", self.lo),
            (Some(hi), true) => write!(f, "<{hi}"),
            (Some(hi), false) => write!(f, ">={} <{hi}", self.lo),
        }
    }
}

impl FromStr for VersionRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = RangeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VersionRange> for String {
    fn from(r: VersionRange) -> String {
        r.to_string()
    }
}

//! Version algebra: single versions, inclusive ranges and lists (unions).
//!
//! The comparison rules follow the source package ecosystem: versions are
//! dot/dash-separated components, numeric components compare numerically,
//! and a version *contains* any version it is a prefix of. A range `1.0:1.4`
//! therefore includes `1.4.9`, and the constraint `@1.2` admits `1.2.1`.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// One component of a version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Component {
    /// An alphabetic component such as `alpha` or `rc1`'s `rc`.
    Alpha(String),
    /// A numeric component. Numbers order after letters in the same slot,
    /// so `1.2alpha` precedes `1.2.0`.
    Num(u64),
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Num(a), Component::Num(b)) => a.cmp(b),
            (Component::Alpha(a), Component::Alpha(b)) => a.cmp(b),
            (Component::Alpha(_), Component::Num(_)) => Ordering::Less,
            (Component::Num(_), Component::Alpha(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single version identifier, e.g. `1.2.3` or `2.0-rc1`.
///
/// Equality and ordering are defined on the parsed components, so `1.2-rc1`
/// and `1.2.rc1` are the same version. The original spelling is kept for
/// display.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<Component>,
}

impl Version {
    /// Parses a version identifier. Separators are `.`, `-` and `_`;
    /// a digit/letter boundary also starts a new component.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut components = Vec::new();
        let mut chars = text.char_indices().peekable();
        if text.is_empty() {
            return Err(ParseError::new(text, "empty version", 0));
        }
        while let Some(&(offset, c)) = chars.peek() {
            if c == '.' || c == '-' || c == '_' {
                chars.next();
                continue;
            }
            if c.is_ascii_digit() {
                let mut value: u64 = 0;
                while let Some(&(_, d)) = chars.peek() {
                    if let Some(digit) = d.to_digit(10) {
                        value = value
                            .checked_mul(10)
                            .and_then(|v| v.checked_add(u64::from(digit)))
                            .ok_or_else(|| {
                                ParseError::new(text, "numeric version component overflows", offset)
                            })?;
                        chars.next();
                    } else {
                        break;
                    }
                }
                components.push(Component::Num(value));
            } else if c.is_ascii_alphabetic() {
                let mut word = String::new();
                while let Some(&(_, a)) = chars.peek() {
                    if a.is_ascii_alphabetic() {
                        word.push(a);
                        chars.next();
                    } else {
                        break;
                    }
                }
                components.push(Component::Alpha(word));
            } else {
                return Err(ParseError::new(
                    text,
                    format!("unexpected character `{c}` in version"),
                    offset,
                ));
            }
        }
        if components.is_empty() {
            return Err(ParseError::new(text, "empty version", 0));
        }
        Ok(Self {
            raw: text.to_string(),
            components,
        })
    }

    /// True if `self`'s components are a prefix of `other`'s. A version
    /// contains every version it is a prefix of: `1.2` contains `1.2.5`.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        self.components.len() <= other.components.len()
            && self.components == other.components[..self.components.len()]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.components.iter().zip(&other.components) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// An inclusive version range with optionally open ends: `lo:hi`, `:hi`,
/// `lo:` or `:`. A range with `lo == hi` is the single-version constraint
/// `@lo` and is displayed without the colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    pub lo: Option<Version>,
    pub hi: Option<Version>,
}

impl VersionRange {
    /// The range containing every version.
    pub fn any() -> Self {
        Self { lo: None, hi: None }
    }

    /// The constraint admitting exactly `v` and its prefix-extensions.
    pub fn single(v: Version) -> Self {
        Self {
            lo: Some(v.clone()),
            hi: Some(v),
        }
    }

    pub fn is_any(&self) -> bool {
        self.lo.is_none() && self.hi.is_none()
    }

    /// Whether `v` lies within the range. The upper bound is prefix
    /// containing: `1.0:1.4` contains `1.4.9`.
    pub fn contains(&self, v: &Version) -> bool {
        let lo_ok = self.lo.as_ref().map_or(true, |lo| v >= lo);
        let hi_ok = self
            .hi
            .as_ref()
            .map_or(true, |hi| v <= hi || hi.is_prefix_of(v));
        lo_ok && hi_ok
    }

    /// A range is inhabited unless its bounds are in the wrong order (a
    /// lower bound extending the upper bound, like `1.4.2:1.4`, is fine).
    fn is_inhabited(&self) -> bool {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) => lo <= hi || hi.is_prefix_of(lo),
            _ => true,
        }
    }

    /// The most specific range admitted by both, or `None` when disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let lo = match (&self.lo, &other.lo) {
            (Some(a), Some(b)) => Some(if a >= b { a.clone() } else { b.clone() }),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        };
        // For upper bounds the *extension* is the tighter constraint:
        // `:1.4.2` admits less than `:1.4`.
        let hi = match (&self.hi, &other.hi) {
            (Some(a), Some(b)) => Some(if a.is_prefix_of(b) {
                b.clone()
            } else if b.is_prefix_of(a) {
                a.clone()
            } else if a <= b {
                a.clone()
            } else {
                b.clone()
            }),
            (Some(a), None) => Some(a.clone()),
            (None, b) => b.clone(),
        };
        let range = Self { lo, hi };
        range.is_inhabited().then_some(range)
    }

    /// Whether the two ranges share at least one version.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.intersect(other).is_some()
    }

    /// The widest bounds covering both ranges. Only meaningful when they
    /// overlap; used for normalization.
    fn union_covering(&self, other: &Self) -> Self {
        let lo = match (&self.lo, &other.lo) {
            (Some(a), Some(b)) => Some(if a <= b { a.clone() } else { b.clone() }),
            _ => None,
        };
        let hi = match (&self.hi, &other.hi) {
            (Some(a), Some(b)) => Some(if a.is_prefix_of(b) {
                a.clone()
            } else if b.is_prefix_of(a) {
                b.clone()
            } else if a >= b {
                a.clone()
            } else {
                b.clone()
            }),
            _ => None,
        };
        Self { lo, hi }
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) if lo == hi => write!(f, "{lo}"),
            (Some(lo), Some(hi)) => write!(f, "{lo}:{hi}"),
            (Some(lo), None) => write!(f, "{lo}:"),
            (None, Some(hi)) => write!(f, ":{hi}"),
            (None, None) => write!(f, ":"),
        }
    }
}

/// An ordered union of version ranges, as written `1.0:1.2,2.0,3:`.
///
/// The list is kept normalized: ranges are sorted by lower bound and
/// overlapping ranges are merged, so structural equality is semantic
/// equality for the constraints produced by parsing and intersection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionList {
    ranges: Vec<VersionRange>,
}

impl Default for VersionList {
    fn default() -> Self {
        Self::any()
    }
}

impl VersionList {
    /// The unconstrained list.
    pub fn any() -> Self {
        Self {
            ranges: vec![VersionRange::any()],
        }
    }

    /// A list admitting exactly one version (and its prefix-extensions).
    pub fn single(v: Version) -> Self {
        Self {
            ranges: vec![VersionRange::single(v)],
        }
    }

    pub fn from_ranges(ranges: Vec<VersionRange>) -> Self {
        let mut list = Self { ranges };
        list.normalize();
        list
    }

    /// Parses the grammar's version-list syntax: comma-separated ranges.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut ranges = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            if let Some((lo, hi)) = part.split_once(':') {
                let lo = if lo.is_empty() {
                    None
                } else {
                    Some(Version::parse(lo)?)
                };
                let hi = if hi.is_empty() {
                    None
                } else {
                    Some(Version::parse(hi)?)
                };
                let range = VersionRange { lo, hi };
                if !range.is_inhabited() {
                    return Err(ParseError::new(text, format!("empty range `{part}`"), 0));
                }
                ranges.push(range);
            } else if part.is_empty() {
                return Err(ParseError::new(text, "empty version constraint", 0));
            } else {
                ranges.push(VersionRange::single(Version::parse(part)?));
            }
        }
        Ok(Self::from_ranges(ranges))
    }

    pub fn is_any(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].is_any()
    }

    /// Empty lists admit no version at all; they only arise from
    /// intersection and signal an unsatisfiable constraint.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// If the list pins exactly one version, returns it.
    pub fn as_single(&self) -> Option<&Version> {
        match self.ranges.as_slice() {
            [VersionRange {
                lo: Some(lo),
                hi: Some(hi),
            }] if lo == hi => Some(lo),
            _ => None,
        }
    }

    pub fn contains(&self, v: &Version) -> bool {
        self.ranges.iter().any(|r| r.contains(v))
    }

    /// The most specific constraint admitted by both lists. The result may
    /// be empty, meaning the constraints are disjoint.
    pub fn intersect(&self, other: &Self) -> Self {
        let ranges = self
            .ranges
            .iter()
            .cartesian_product(&other.ranges)
            .filter_map(|(a, b)| a.intersect(b))
            .collect();
        Self::from_ranges(ranges)
    }

    /// Subset check: every version admitted by `self` is admitted by
    /// `other`. Reflexive, and consistent with [`Self::intersect`].
    pub fn satisfies(&self, other: &Self) -> bool {
        self.intersect(other) == *self
    }

    fn normalize(&mut self) {
        self.ranges.sort_by(|a, b| {
            let lo = match (&a.lo, &b.lo) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(y),
            };
            lo.then_with(|| match (&a.hi, &b.hi) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => x.cmp(y),
            })
        });
        let mut merged: Vec<VersionRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.overlaps(&range) => {
                    *last = last.union_covering(&range);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }
}

impl Display for VersionList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "<none>");
        }
        write!(f, "{}", self.ranges.iter().format(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn vl(s: &str) -> VersionList {
        VersionList::parse(s).unwrap()
    }

    #[test]
    fn ordering() {
        assert!(v("1.2") < v("1.10"));
        assert!(v("1.2") < v("1.2.1"));
        assert!(v("1.2alpha") < v("1.2.0"));
        assert!(v("2.0-rc1") < v("2.0.0"));
        assert_eq!(v("1.2-rc1"), v("1.2.rc1"));
    }

    #[test]
    fn prefix_containment() {
        assert!(v("1.2").is_prefix_of(&v("1.2.5")));
        assert!(!v("1.2.5").is_prefix_of(&v("1.2")));
        assert!(vl("1.0:1.4").contains(&v("1.4.9")));
        assert!(vl("1.2").contains(&v("1.2.1")));
        assert!(!vl("1.0:1.4").contains(&v("1.5")));
    }

    #[test]
    fn open_ended_ranges() {
        assert!(vl(":1.0").contains(&v("0.9")));
        assert!(!vl(":1.0").contains(&v("1.1")));
        assert!(vl("2:").contains(&v("3.4")));
        assert!(vl(":").contains(&v("0")));
    }

    #[test]
    fn intersection() {
        let a = vl("1.0:1.2");
        let b = vl("1.1:2.0");
        assert_eq!(a.intersect(&b), vl("1.1:1.2"));

        let disjoint = vl("2:").intersect(&vl(":1.0"));
        assert!(disjoint.is_empty());

        // Extension of the upper bound tightens it.
        assert_eq!(vl(":1.4").intersect(&vl(":1.4.2")), vl(":1.4.2"));
    }

    #[test]
    fn satisfies_is_reflexive_and_subset() {
        let a = vl("1.1:1.2");
        assert!(a.satisfies(&a));
        assert!(a.satisfies(&vl("1.0:2.0")));
        assert!(!vl("1.0:2.0").satisfies(&a));
        assert!(vl("1.2").satisfies(&vl("1.0:1.2,2.0")));
    }

    #[test]
    fn list_normalization_merges_overlaps() {
        assert_eq!(vl("1.0:1.5,1.4:2.0"), vl("1.0:2.0"));
        assert_eq!(vl("2.0,1.0").to_string(), "1.0,2.0");
    }

    #[test]
    fn display_round_trip() {
        for text in [":", "1.2", "1.0:1.2", ":1.0", "2:", "1.0:1.2,2.0"] {
            assert_eq!(vl(text).to_string(), text);
        }
    }

    #[test]
    fn parse_errors() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1.2!").is_err());
        assert!(VersionList::parse("2:1").is_err());
        assert!(VersionList::parse("1.0,,2.0").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_version() -> impl Strategy<Value = Version> {
            proptest::collection::vec(0u64..20, 1..4).prop_map(|nums| {
                let text = nums
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(".");
                Version::parse(&text).unwrap()
            })
        }

        fn arb_list() -> impl Strategy<Value = VersionList> {
            proptest::collection::vec((arb_version(), arb_version()), 1..3).prop_map(|pairs| {
                let ranges = pairs
                    .into_iter()
                    .map(|(a, b)| {
                        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                        VersionRange {
                            lo: Some(lo),
                            hi: Some(hi),
                        }
                    })
                    .collect();
                VersionList::from_ranges(ranges)
            })
        }

        proptest! {
            #[test]
            fn intersection_is_a_subset(a in arb_list(), b in arb_list()) {
                let i = a.intersect(&b);
                prop_assert!(i.satisfies(&a));
                prop_assert!(i.satisfies(&b));
            }

            #[test]
            fn intersection_commutes(a in arb_list(), b in arb_list()) {
                prop_assert_eq!(a.intersect(&b), b.intersect(&a));
            }

            #[test]
            fn display_parses_back(a in arb_list()) {
                let parsed = VersionList::parse(&a.to_string()).unwrap();
                prop_assert_eq!(parsed, a);
            }
        }
    }
}

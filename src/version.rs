//! Versions, version ranges and version lists.
//!
//! A [`Version`] is split into alphanumeric components. Components compare
//! with the rule *alphabetic < numeric < development word*, and the
//! development words rank `develop > main > master > head > trunk`. A
//! version that is a component-prefix of another sorts first, so
//! `1.2 < 1.2.0 < 1.2.1`.
//!
//! Range upper bounds are *prefix inclusive*: `1.0:2.0` accepts `2.0.5`
//! but not `2.1`, and a bare `1.2` means `1.2:1.2`, i.e. any `1.2.x`.
//! `=1.2` pins exactly one version.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

const DEVELOP_WORDS: [&str; 5] = ["develop", "main", "master", "head", "trunk"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Component {
    Alpha(String),
    Numeric(u64),
    /// Development branch name; higher rank sorts later.
    Develop(u8),
}

/// A single package version such as `1.14.0`, `2.0rc1` or `develop`.
#[derive(Debug, Clone)]
pub struct Version {
    text: String,
    components: Vec<Component>,
}

impl Version {
    /// Parse a version string.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::new(s, 0, "empty version"));
        }
        let mut components = Vec::new();
        let bytes = s.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if c.is_ascii_digit() {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let n = s[start..i]
                    .parse::<u64>()
                    .map_err(|_| ParseError::new(s, start, "version component too large"))?;
                components.push(Component::Numeric(n));
            } else if c.is_ascii_alphabetic() {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let word = &s[start..i];
                match DEVELOP_WORDS.iter().position(|w| *w == word) {
                    Some(pos) => components.push(Component::Develop((DEVELOP_WORDS.len() - pos) as u8)),
                    None => components.push(Component::Alpha(word.to_string())),
                }
            } else if matches!(c, b'.' | b'-' | b'_') {
                let next = bytes.get(i + 1);
                if i == 0 || next.is_none_or(|n| matches!(n, b'.' | b'-' | b'_')) {
                    return Err(ParseError::new(s, i, "empty version component"));
                }
                i += 1;
            } else {
                return Err(ParseError::new(s, i, format!("invalid character `{}` in version", c as char)));
            }
        }
        if components.is_empty() {
            return Err(ParseError::new(s, 0, "version has no components"));
        }
        Ok(Self {
            text: s.to_string(),
            components,
        })
    }

    /// The version as written.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True for development-branch versions such as `develop` or `1.2-main`.
    pub fn is_develop(&self) -> bool {
        self.components
            .iter()
            .any(|c| matches!(c, Component::Develop(_)))
    }

    /// True when every component of `self` is a leading component of `other`.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        other.components.starts_with(&self.components)
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

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// `v` lies below the prefix-inclusive upper bound `hi`.
fn under_upper(hi: &Version, v: &Version) -> bool {
    v <= hi || hi.is_prefix_of(v)
}

/// Everything under upper bound `a` is also under `b`.
fn upper_within(a: &Version, b: &Version) -> bool {
    b.is_prefix_of(a) || (!a.is_prefix_of(b) && a < b)
}

/// A contiguous range `lo:hi`; `None` is an open end.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionRange {
    pub lo: Option<Version>,
    pub hi: Option<Version>,
}

impl VersionRange {
    /// The unbounded range `:`.
    pub fn any() -> Self {
        Self { lo: None, hi: None }
    }

    pub fn contains(&self, v: &Version) -> bool {
        self.lo.as_ref().is_none_or(|lo| lo <= v) && self.hi.as_ref().is_none_or(|hi| under_upper(hi, v))
    }

    pub fn is_empty(&self) -> bool {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) => !under_upper(hi, lo),
            _ => false,
        }
    }

    /// The overlap of two ranges, or `None` when they are disjoint.
    pub fn intersection(&self, other: &VersionRange) -> Option<VersionRange> {
        let lo = match (&self.lo, &other.lo) {
            (Some(a), Some(b)) => Some(a.max(b).clone()),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        let hi = match (&self.hi, &other.hi) {
            (Some(a), Some(b)) => Some(if upper_within(a, b) { a.clone() } else { b.clone() }),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        let range = VersionRange { lo, hi };
        (!range.is_empty()).then_some(range)
    }

    pub fn is_subset_of(&self, other: &VersionRange) -> bool {
        let lo_ok = match (&self.lo, &other.lo) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a >= b,
        };
        let hi_ok = match (&self.hi, &other.hi) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => upper_within(a, b),
        };
        lo_ok && hi_ok
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) if lo == hi => write!(f, "{lo}"),
            (lo, hi) => {
                if let Some(lo) = lo {
                    write!(f, "{lo}")?;
                }
                write!(f, ":")?;
                if let Some(hi) = hi {
                    write!(f, "{hi}")?;
                }
                Ok(())
            }
        }
    }
}

/// One member of a [`VersionList`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VersionItem {
    Exact(Version),
    Range(VersionRange),
}

impl VersionItem {
    pub fn contains(&self, v: &Version) -> bool {
        match self {
            VersionItem::Exact(e) => e == v,
            VersionItem::Range(r) => r.contains(v),
        }
    }

    fn intersection(&self, other: &VersionItem) -> Option<VersionItem> {
        match (self, other) {
            (VersionItem::Exact(a), VersionItem::Exact(b)) => (a == b).then(|| self.clone()),
            (VersionItem::Exact(a), VersionItem::Range(r)) | (VersionItem::Range(r), VersionItem::Exact(a)) => {
                r.contains(a).then(|| VersionItem::Exact(a.clone()))
            }
            (VersionItem::Range(a), VersionItem::Range(b)) => a.intersection(b).map(VersionItem::Range),
        }
    }

    fn is_subset_of(&self, other: &VersionItem) -> bool {
        match (self, other) {
            (VersionItem::Exact(a), other) => other.contains(a),
            (VersionItem::Range(_), VersionItem::Exact(_)) => false,
            (VersionItem::Range(a), VersionItem::Range(b)) => a.is_subset_of(b),
        }
    }
}

impl fmt::Display for VersionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionItem::Exact(v) => write!(f, "={v}"),
            VersionItem::Range(r) => write!(f, "{r}"),
        }
    }
}

/// A union of exact versions and ranges, e.g. `1.2:1.4,=1.6,2:`.
///
/// An empty list admits no version at all; [`VersionList::any`] admits all.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionList {
    items: Vec<VersionItem>,
}

impl Default for VersionList {
    fn default() -> Self {
        Self::any()
    }
}

impl VersionList {
    pub fn any() -> Self {
        Self {
            items: vec![VersionItem::Range(VersionRange::any())],
        }
    }

    /// A list holding exactly `v`.
    pub fn exact(v: Version) -> Self {
        Self {
            items: vec![VersionItem::Exact(v)],
        }
    }

    /// The range `v:v`, i.e. `v` and everything it prefixes.
    pub fn prefix(v: Version) -> Self {
        Self {
            items: vec![VersionItem::Range(VersionRange {
                lo: Some(v.clone()),
                hi: Some(v),
            })],
        }
    }

    pub fn from_items(items: impl IntoIterator<Item = VersionItem>) -> Self {
        let mut unique: Vec<VersionItem> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Self { items: unique }
    }

    /// Parse a comma-separated list such as `1.2:1.4,=1.6`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let mut items = Vec::new();
        let mut offset = 0;
        for part in s.split(',') {
            let item = part.trim();
            if item.is_empty() {
                return Err(ParseError::new(s, offset, "empty version in list"));
            }
            let parsed = if let Some(exact) = item.strip_prefix('=') {
                VersionItem::Exact(Version::parse(exact).map_err(|e| shift(e, s, offset + 1))?)
            } else if let Some((lo, hi)) = item.split_once(':') {
                let bound = |text: &str, at: usize| -> Result<Option<Version>, ParseError> {
                    if text.is_empty() {
                        Ok(None)
                    } else {
                        Version::parse(text).map(Some).map_err(|e| shift(e, s, at))
                    }
                };
                let range = VersionRange {
                    lo: bound(lo, offset)?,
                    hi: bound(hi, offset + lo.len() + 1)?,
                };
                if range.is_empty() {
                    return Err(ParseError::new(s, offset, format!("empty range `{item}`")));
                }
                VersionItem::Range(range)
            } else {
                let v = Version::parse(item).map_err(|e| shift(e, s, offset))?;
                VersionItem::Range(VersionRange {
                    lo: Some(v.clone()),
                    hi: Some(v),
                })
            };
            items.push(parsed);
            offset += part.len() + 1;
        }
        Ok(Self::from_items(items))
    }

    pub fn items(&self) -> &[VersionItem] {
        &self.items
    }

    /// True when this list admits every version.
    pub fn is_any(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i, VersionItem::Range(VersionRange { lo: None, hi: None })))
    }

    /// True when no version can satisfy this list.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, v: &Version) -> bool {
        self.items.iter().any(|i| i.contains(v))
    }

    /// The single exact version, when the list pins one.
    pub fn concrete(&self) -> Option<&Version> {
        match self.items.as_slice() {
            [VersionItem::Exact(v)] => Some(v),
            _ => None,
        }
    }

    pub fn intersection(&self, other: &VersionList) -> VersionList {
        if self.is_any() {
            return other.clone();
        }
        if other.is_any() {
            return self.clone();
        }
        let mut out = Vec::new();
        for a in &self.items {
            for b in &other.items {
                if let Some(i) = a.intersection(b) {
                    out.push(i);
                }
            }
        }
        Self::from_items(out)
    }

    pub fn intersects(&self, other: &VersionList) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Every version admitted by `self` is admitted by `other`.
    pub fn is_subset_of(&self, other: &VersionList) -> bool {
        other.is_any()
            || self
                .items
                .iter()
                .all(|a| other.items.iter().any(|b| a.is_subset_of(b)))
    }
}

fn shift(mut e: ParseError, input: &str, by: usize) -> ParseError {
    e.offset += by;
    e.input = input.to_string();
    e
}

impl fmt::Display for VersionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionList {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionList::parse(s)
    }
}

impl Serialize for VersionList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionList::parse(&s).map_err(serde::de::Error::custom)
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
    fn numeric_ordering() {
        assert!(v("1.2") < v("1.10"));
        assert!(v("1.2.3") < v("1.2.4"));
        assert!(v("2") > v("1.99.99"));
    }

    #[test]
    fn prefix_sorts_first() {
        assert!(v("1.2") < v("1.2.0"));
        assert!(v("1.2.0") < v("1.2.1"));
    }

    #[test]
    fn alpha_below_numeric() {
        assert!(v("1.2a") < v("1.2.1"));
        assert!(v("1.2rc1") < v("1.2.0"));
        assert!(v("1.2b") > v("1.2a"));
    }

    #[test]
    fn develop_words_rank_highest() {
        assert!(v("develop") > v("999.0"));
        assert!(v("develop") > v("main"));
        assert!(v("main") > v("master"));
        assert!(v("head") > v("trunk"));
        assert!(v("develop").is_develop());
        assert!(!v("1.0").is_develop());
    }

    #[test]
    fn separators_do_not_matter() {
        assert_eq!(v("1-2_3"), v("1.2.3"));
        assert_eq!(v("1-2_3").to_string(), "1-2_3");
    }

    #[test]
    fn invalid_characters_rejected() {
        assert!(Version::parse("1.2+3").is_err());
        assert!(Version::parse("").is_err());
        assert!(Version::parse("...").is_err());
        assert!(Version::parse("1..2").is_err());
        assert!(Version::parse("1.2.").is_err());
        assert!(Version::parse("-1").is_err());
    }

    #[test]
    fn bare_version_is_prefix_range() {
        let l = vl("1.2");
        assert!(l.contains(&v("1.2")));
        assert!(l.contains(&v("1.2.7")));
        assert!(!l.contains(&v("1.3")));
        assert!(!l.contains(&v("1.1")));
    }

    #[test]
    fn exact_pins_one_version() {
        let l = vl("=1.2");
        assert!(l.contains(&v("1.2")));
        assert!(!l.contains(&v("1.2.1")));
        assert_eq!(l.concrete(), Some(&v("1.2")));
        assert_eq!(vl("1.2").concrete(), None);
    }

    #[test]
    fn range_upper_bound_is_prefix_inclusive() {
        let l = vl("1.0:2.0");
        assert!(l.contains(&v("1.0")));
        assert!(l.contains(&v("1.5")));
        assert!(l.contains(&v("2.0")));
        assert!(l.contains(&v("2.0.5")));
        assert!(!l.contains(&v("2.1")));
        assert!(!l.contains(&v("0.9")));
    }

    #[test]
    fn open_ranges() {
        assert!(vl("2:").contains(&v("100")));
        assert!(!vl("2:").contains(&v("1.9")));
        assert!(vl(":2").contains(&v("0.1")));
        assert!(vl(":").is_any());
        assert!(vl(":").contains(&v("develop")));
    }

    #[test]
    fn overlapping_ranges_intersect() {
        let i = vl("1.0:1.5").intersection(&vl("1.2:2.0"));
        assert_eq!(i.to_string(), "1.2:1.5");
        assert!(i.contains(&v("1.5")));
        assert!(!i.contains(&v("1.1")));
    }

    #[test]
    fn disjoint_ranges_do_not_intersect() {
        assert!(!vl("1.0").intersects(&vl("2.0:")));
        assert!(vl("1.0:1.4").intersection(&vl("1.5:")).is_empty());
    }

    #[test]
    fn nested_prefix_upper_bound_keeps_the_tighter() {
        let i = vl(":1.5").intersection(&vl(":1.5.3"));
        assert_eq!(i.to_string(), ":1.5.3");
    }

    #[test]
    fn exact_intersects_range() {
        assert_eq!(vl("=1.4").intersection(&vl("1:2")).to_string(), "=1.4");
        assert!(vl("=3").intersection(&vl("1:2")).is_empty());
    }

    #[test]
    fn list_union_semantics() {
        let l = vl("1.2:1.4,=1.6");
        assert!(l.contains(&v("1.3")));
        assert!(l.contains(&v("1.6")));
        assert!(!l.contains(&v("1.5")));
        assert_eq!(l.to_string(), "1.2:1.4,=1.6");
    }

    #[test]
    fn subset_checks() {
        assert!(vl("=1.3").is_subset_of(&vl("1.2:1.4")));
        assert!(vl("1.2.1:1.2.5").is_subset_of(&vl("1.2")));
        assert!(!vl("1.2:").is_subset_of(&vl("1.2:2")));
        assert!(vl("1.2:1.4").is_subset_of(&vl(":")));
    }

    #[test]
    fn empty_range_rejected_by_parser() {
        assert!(VersionList::parse("2.0:1.0").is_err());
        assert!(VersionList::parse("1.0,,2.0").is_err());
        assert!(VersionList::parse("1.5.3:1.5").is_ok());
    }

    #[test]
    fn serde_as_string() {
        let l: VersionList = serde_json::from_str("\"1.0:2.0\"").unwrap();
        assert_eq!(serde_json::to_string(&l).unwrap(), "\"1.0:2.0\"");
    }
}

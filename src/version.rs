//! Version ordering and dependency requirements.
//!
//! Catalog versions are free-form dotted strings ("2.1", "2.1.0-beta3",
//! "2024.1"). They are ordered segment-wise: split on `.`, then each
//! segment on digit/non-digit boundaries; two numeric pieces compare
//! numerically, anything else compares lexicographically. This is not
//! semver, and deliberately so: catalogs predate it and carry versions
//! semver would reject.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error, Result};

/// Comparators allowed in dependency expressions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Comparator {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
}

impl Comparator {
    fn evaluate(self, ordering: Ordering) -> bool {
        match self {
            Self::Less => ordering == Ordering::Less,
            Self::LessEqual => ordering != Ordering::Greater,
            Self::Equal => ordering == Ordering::Equal,
            Self::GreaterEqual => ordering != Ordering::Less,
            Self::Greater => ordering == Ordering::Greater,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Equal => "=",
            Self::GreaterEqual => ">=",
            Self::Greater => ">",
        })
    }
}

/// A comparator plus a version, e.g. `>=1.2`. Absence of a comparator in
/// the source text means equality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRequirement {
    pub comparator: Comparator,
    pub version: String,
}

impl VersionRequirement {
    pub fn matches(&self, version: &str) -> bool {
        self.comparator
            .evaluate(compare_version(version, &self.version))
    }
}

impl FromStr for VersionRequirement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (comparator, rest) = if let Some(rest) = s.strip_prefix("<=") {
            (Comparator::LessEqual, rest)
        } else if let Some(rest) = s.strip_prefix(">=") {
            (Comparator::GreaterEqual, rest)
        } else if let Some(rest) = s.strip_prefix("==") {
            (Comparator::Equal, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (Comparator::Less, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (Comparator::Greater, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (Comparator::Equal, rest)
        } else {
            (Comparator::Equal, s)
        };
        if rest.is_empty() {
            bail!("empty version in requirement '{}'", s);
        }
        Ok(Self {
            comparator,
            version: rest.to_owned(),
        })
    }
}

impl fmt::Display for VersionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparator, self.version)
    }
}

/// One entry of a package's dependency list: a component name and an
/// optional version requirement, written `name` or `name-REQ` where REQ may
/// start with a comparator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub requirement: Option<VersionRequirement>,
}

impl Dependency {
    /// Whether `version` (of an installed component named `self.name`)
    /// satisfies this dependency.
    pub fn satisfied_by(&self, version: &str) -> bool {
        match &self.requirement {
            Some(req) => req.matches(version),
            None => true,
        }
    }
}

impl FromStr for Dependency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("empty dependency expression");
        }
        // The separator is the first '-' directly followed by a comparator
        // or a digit; names themselves may contain dashes.
        let split = s.char_indices().find(|&(i, c)| {
            c == '-'
                && s[i + 1..]
                    .chars()
                    .next()
                    .map(|n| n.is_ascii_digit() || matches!(n, '<' | '=' | '>'))
                    .unwrap_or(false)
        });
        match split {
            Some((i, _)) => Ok(Self {
                name: s[..i].to_owned(),
                requirement: Some(s[i + 1..].parse()?),
            }),
            None => Ok(Self {
                name: s.to_owned(),
                requirement: None,
            }),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.requirement {
            Some(req) => write!(f, "{}-{}", self.name, req),
            None => f.write_str(&self.name),
        }
    }
}

/// Total order over version strings. Splits on `.`, then on digit
/// boundaries inside each segment; numeric pieces compare as integers,
/// mixed or textual pieces compare lexicographically; the version that runs
/// out of pieces first is the lesser one.
pub fn compare_version(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.').flat_map(split_numeric_runs);
    let mut right = b.split('.').flat_map(split_numeric_runs);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// `version_matches("1.2", ">=1.0")`. A requirement without a comparator
/// means equality; `==` is accepted as a spelling of `=`.
pub fn version_matches(version: &str, requirement: &str) -> bool {
    match requirement.parse::<VersionRequirement>() {
        Ok(req) => req.matches(version),
        Err(_) => false,
    }
}

fn split_numeric_runs(segment: &str) -> impl Iterator<Item = &str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut prev_digit = None;
    for (i, c) in segment.char_indices() {
        let digit = c.is_ascii_digit();
        if let Some(p) = prev_digit {
            if p != digit {
                pieces.push(&segment[start..i]);
                start = i;
            }
        }
        prev_digit = Some(digit);
    }
    if start < segment.len() {
        pieces.push(&segment[start..]);
    }
    pieces.into_iter()
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use proptest::prelude::*;

    use super::{compare_version, version_matches, Comparator, Dependency};

    #[test]
    fn numeric_segments_compare_numerically() {
        assert_eq!(compare_version("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_version("2.0", "10.0"), Ordering::Less);
        assert_eq!(compare_version("1.0.0", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn shorter_version_is_lesser() {
        assert_eq!(compare_version("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_version("1.0.1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn textual_pieces_compare_lexicographically() {
        assert_eq!(compare_version("1.0alpha", "1.0beta"), Ordering::Less);
        assert_eq!(compare_version("1.0beta2", "1.0beta10"), Ordering::Less);
    }

    #[test]
    fn comparators_parse_and_evaluate() {
        assert!(version_matches("1.2", ">=1.0"));
        assert!(version_matches("1.2", "==1.2"));
        assert!(version_matches("1.2", "1.2"));
        assert!(!version_matches("1.2", "<1.2"));
        assert!(version_matches("1.1.9", "<=1.2"));
        assert!(!version_matches("2.0", "=1.9"));
    }

    #[test]
    fn dependency_expression_splits_on_version_dash() {
        let bare: Dependency = "org.x.sdk".parse().unwrap();
        assert_eq!(bare.name, "org.x.sdk");
        assert!(bare.requirement.is_none());
        assert!(bare.satisfied_by("0.0.1"));

        let pinned: Dependency = "org.x.base-2.0".parse().unwrap();
        assert_eq!(pinned.name, "org.x.base");
        let req = pinned.requirement.as_ref().unwrap();
        assert_eq!(req.comparator, Comparator::Equal);
        assert!(pinned.satisfied_by("2.0"));
        assert!(!pinned.satisfied_by("1.9"));

        let ranged: Dependency = "org.x-tools->=1.2".parse().unwrap();
        assert_eq!(ranged.name, "org.x-tools");
        assert!(ranged.satisfied_by("1.3"));
        assert!(!ranged.satisfied_by("1.1"));
    }

    fn version_strategy() -> impl Strategy<Value = String> {
        proptest::collection::vec(0u32..30, 1..4)
            .prop_map(|parts| parts.iter().map(u32::to_string).collect::<Vec<_>>().join("."))
    }

    proptest! {
        #[test]
        fn order_is_antisymmetric(a in version_strategy(), b in version_strategy()) {
            prop_assert_eq!(compare_version(&a, &b), compare_version(&b, &a).reverse());
        }

        #[test]
        fn order_is_transitive(
            a in version_strategy(),
            b in version_strategy(),
            c in version_strategy(),
        ) {
            let mut versions = vec![a, b, c];
            versions.sort_by(|l, r| compare_version(l, r));
            prop_assert!(compare_version(&versions[0], &versions[2]) != Ordering::Greater);
        }

        #[test]
        fn every_version_matches_its_own_equality(v in version_strategy()) {
            let constraint = format!("={}", v);
            prop_assert!(version_matches(&v, &constraint));
        }
    }
}

//! Migration version keys and target resolution.
//!
//! A [`VersionKey`] is a dotted sequence of non-negative integers compared
//! lexicographically with zero-padding, so `1.0` and `1` are equal. The
//! `latest`/`current` sentinels live in [`Target`] because they only gain a
//! concrete value once the resolver output or the metadata store is known.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{MilepostError, Result};

/// A parsed migration version, supporting dotted numeric segments (e.g., "1.2.3").
#[derive(Debug, Clone)]
pub struct VersionKey {
    pub segments: Vec<u64>,
    pub raw: String,
}

impl VersionKey {
    /// Parse a version string like `"1.2.3"` into segments.
    ///
    /// Rejects empty input, empty segments and anything that is not a
    /// non-negative integer.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(MilepostError::InvalidVersion(
                "version string is empty".to_string(),
            ));
        }

        let segments: std::result::Result<Vec<u64>, _> =
            raw.split('.').map(|s| s.parse::<u64>()).collect();

        let segments = segments.map_err(|e| {
            MilepostError::InvalidVersion(format!("invalid segment in '{}': {}", raw, e))
        })?;

        Ok(VersionKey {
            segments,
            raw: raw.to_string(),
        })
    }

    /// Canonical form: segments with trailing zeros stripped, joined by dots.
    ///
    /// Two keys are equal iff their canonical forms are equal, so `1.0` and
    /// `1` both canonicalize to `"1"`.
    pub fn canonical(&self) -> String {
        let trimmed = self.canonical_segments();
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(".")
        }
    }

    fn canonical_segments(&self) -> &[u64] {
        let mut len = self.segments.len();
        while len > 0 && self.segments[len - 1] == 0 {
            len -= 1;
        }
        &self.segments[..len]
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let max_len = self.segments.len().max(other.segments.len());
        for i in 0..max_len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionKey {}

impl Hash for VersionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must agree with Eq: hash the zero-trimmed segments.
        self.canonical_segments().hash(state);
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Serialize for VersionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// The version up to which migrate should apply pending migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The greatest resolved version.
    Latest,
    /// The greatest successfully applied version.
    Current,
    /// A literal version.
    Version(VersionKey),
}

impl Default for Target {
    fn default() -> Self {
        Target::Latest
    }
}

impl FromStr for Target {
    type Err = MilepostError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" => Ok(Target::Latest),
            "current" => Ok(Target::Current),
            _ => Ok(Target::Version(VersionKey::parse(s)?)),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Latest => write!(f, "latest"),
            Target::Current => write!(f, "current"),
            Target::Version(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        let v = VersionKey::parse("1").unwrap();
        assert_eq!(v.segments, vec![1]);

        let v = VersionKey::parse("2.0.3").unwrap();
        assert_eq!(v.segments, vec![2, 0, 3]);
    }

    #[test]
    fn test_version_parse_errors() {
        assert!(VersionKey::parse("").is_err());
        assert!(VersionKey::parse("abc").is_err());
        assert!(VersionKey::parse("1..2").is_err());
        assert!(VersionKey::parse("-1").is_err());
        assert!(VersionKey::parse("1.-2").is_err());
    }

    #[test]
    fn test_version_ordering() {
        let v1 = VersionKey::parse("1").unwrap();
        let v2 = VersionKey::parse("2").unwrap();
        let v1_9 = VersionKey::parse("1.9").unwrap();
        let v1_10 = VersionKey::parse("1.10").unwrap();
        let v1_2 = VersionKey::parse("1.2").unwrap();

        assert!(v1 < v2);
        assert!(v1_9 < v1_10); // Numeric, not string comparison
        assert!(v1_2 < v1_9);
    }

    #[test]
    fn test_version_equality_by_canonical_form() {
        let v1 = VersionKey::parse("1").unwrap();
        let v1_0 = VersionKey::parse("1.0").unwrap();
        let v1_0_0 = VersionKey::parse("1.0.0").unwrap();

        assert_eq!(v1, v1_0);
        assert_eq!(v1_0, v1_0_0);
        assert_eq!(v1.canonical(), "1");
        assert_eq!(v1_0_0.canonical(), "1");
        assert_eq!(VersionKey::parse("1.0.2").unwrap().canonical(), "1.0.2");
    }

    #[test]
    fn test_version_hash_agrees_with_eq() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(VersionKey::parse("1.0").unwrap());
        assert!(set.contains(&VersionKey::parse("1").unwrap()));
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("latest".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("CURRENT".parse::<Target>().unwrap(), Target::Current);
        assert_eq!(
            "1.2".parse::<Target>().unwrap(),
            Target::Version(VersionKey::parse("1.2").unwrap())
        );
        assert!("not-a-version".parse::<Target>().is_err());
    }
}

//! Path-like keys identifying state instances.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, CoreResult};

/// Separator between location segments in the string form.
pub const SEPARATOR: char = '/';

/// An ordered sequence of path segments, e.g. `project/store/name`.
///
/// A location is both the identity of a state instance and its persistence
/// key: all segments but the last form the storage namespace, the last
/// segment is the key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    segments: Vec<String>,
}

impl Location {
    /// Build a location from segments.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidLocation`] if there are no segments, or a
    /// segment is empty or contains the separator or a null byte.
    pub fn new<I, S>(segments: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(CoreError::InvalidLocation("location has no segments".into()));
        }
        for segment in &segments {
            if segment.is_empty() || segment.contains(SEPARATOR) || segment.contains('\0') {
                return Err(CoreError::InvalidLocation(format!(
                    "invalid segment {segment:?}"
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Borrow the segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Storage namespace: every segment but the last, joined.
    ///
    /// A single-segment location lives in the root namespace `"/"`.
    #[must_use]
    pub fn namespace(&self) -> String {
        match self.segments.split_last() {
            Some((_, parents)) if !parents.is_empty() => parents.join("/"),
            _ => SEPARATOR.to_string(),
        }
    }

    /// Storage key: the last segment.
    #[must_use]
    pub fn key(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    /// Append a segment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidLocation`] if the segment is invalid.
    pub fn child(&self, segment: impl Into<String>) -> CoreResult<Self> {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    /// Whether `prefix` is a leading run of this location's segments.
    #[must_use]
    pub fn starts_with(&self, prefix: &Location) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for Location {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::new(s.split(SEPARATOR))
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let loc: Location = "proj/s/x".parse().unwrap();
        assert_eq!(loc.segments(), ["proj", "s", "x"]);
        assert_eq!(loc.to_string(), "proj/s/x");
    }

    #[test]
    fn test_namespace_and_key() {
        let loc: Location = "proj/s/x".parse().unwrap();
        assert_eq!(loc.namespace(), "proj/s");
        assert_eq!(loc.key(), "x");

        let single: Location = "settings".parse().unwrap();
        assert_eq!(single.namespace(), "/");
        assert_eq!(single.key(), "settings");
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!("".parse::<Location>().is_err());
        assert!("a//b".parse::<Location>().is_err());
        assert!(Location::new(Vec::<String>::new()).is_err());
        assert!(Location::new(["a/b"]).is_err());
    }

    #[test]
    fn test_child_and_prefix() {
        let prefix: Location = "proj/s".parse().unwrap();
        let child = prefix.child("x").unwrap();
        assert!(child.starts_with(&prefix));
        assert!(!prefix.starts_with(&child));
    }

    #[test]
    fn test_serde_as_string() {
        let loc: Location = "a/b".parse().unwrap();
        assert_eq!(serde_json::to_string(&loc).unwrap(), r#""a/b""#);
        let back: Location = serde_json::from_str(r#""a/b""#).unwrap();
        assert_eq!(back, loc);
    }
}

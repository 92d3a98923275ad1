//! Hierarchical permission tokens.
//!
//! Permissions are dot-delimited paths such as `core.user.list`. The last
//! segment may be the wildcard `*`, meaning "this path and everything beneath
//! it":
//! - `core.user.list` - exact permission
//! - `core.*` - everything under `core`, including `core` itself
//! - `jabber.*` - everything in an application's namespace
//! - `*` - everything
//!
//! Parsing tokenizes the string once; matching compares segments, never raw
//! string prefixes, so `core.user.*` does not cover `core.userx`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{PermissionError, PermissionResult};

/// Separator between permission segments.
pub const SEPARATOR: char = '.';

/// The wildcard segment.
pub const WILDCARD: &str = "*";

/// One segment of a permission path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A literal path segment.
    Exact(String),
    /// Trailing wildcard covering the prefix and everything beneath it.
    Wildcard,
}

/// A parsed, validated permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    raw: String,
    segments: Vec<Segment>,
}

impl Permission {
    /// Parse a permission string.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidPermission`] if the string is empty,
    /// has an empty segment, uses characters outside `[A-Za-z0-9_-]`, or puts
    /// a wildcard anywhere but the final segment.
    pub fn new(raw: impl Into<String>) -> PermissionResult<Self> {
        let raw = raw.into();
        let invalid = |reason: &str| PermissionError::InvalidPermission {
            permission: raw.clone(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("permission is empty"));
        }

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = parts.len().saturating_sub(1);
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(invalid("empty segment"));
            }
            if *part == WILDCARD {
                if i != last {
                    return Err(invalid("wildcard is only allowed as the last segment"));
                }
                segments.push(Segment::Wildcard);
                continue;
            }
            if !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(invalid("segments may only contain letters, digits, '_' and '-'"));
            }
            segments.push(Segment::Exact((*part).to_string()));
        }

        Ok(Self { raw, segments })
    }

    /// Build a wildcard permission covering everything under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not a valid permission prefix.
    pub fn namespace(root: &str) -> PermissionResult<Self> {
        Self::new(format!("{root}{SEPARATOR}{WILDCARD}"))
    }

    /// The original permission string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the final segment is a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard))
    }

    /// The literal segments before any trailing wildcard.
    #[must_use]
    pub fn prefix(&self) -> &[Segment] {
        if self.is_wildcard() {
            &self.segments[..self.segments.len().saturating_sub(1)]
        } else {
            &self.segments
        }
    }

    /// The first segment (the namespace root), if it is literal.
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Exact(s)) => Some(s),
            _ => None,
        }
    }

    /// Check whether holding `self` satisfies the requirement `required`.
    ///
    /// `self` covers `required` when they are equal, or when `self` ends in a
    /// wildcard and the literal prefix of `required` starts with the literal
    /// prefix of `self`. A wildcard requirement is therefore only covered by
    /// an equal or broader wildcard.
    #[must_use]
    pub fn covers(&self, required: &Self) -> bool {
        if self.raw == required.raw {
            return true;
        }
        if !self.is_wildcard() {
            return false;
        }
        required.prefix().starts_with(self.prefix())
    }
}

impl PartialEq for Permission {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Permission {}

impl Hash for Permission {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for Permission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Permission {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Permission {
    type Error = PermissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Permission {
    type Error = PermissionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Permission {
        Permission::new(s).unwrap()
    }

    #[test]
    fn test_parse_exact() {
        let perm = p("core.user.list");
        assert!(!perm.is_wildcard());
        assert_eq!(perm.segments().len(), 3);
        assert_eq!(perm.root(), Some("core"));
    }

    #[test]
    fn test_parse_wildcard() {
        let perm = p("core.*");
        assert!(perm.is_wildcard());
        assert_eq!(perm.prefix(), &[Segment::Exact("core".to_string())]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Permission::new("").is_err());
        assert!(Permission::new("core..user").is_err());
        assert!(Permission::new("core.").is_err());
        assert!(Permission::new("core.*.list").is_err());
        assert!(Permission::new("core.us*er").is_err());
        assert!(Permission::new("core user").is_err());
    }

    #[test]
    fn test_covers_segment_aligned() {
        assert!(p("core.*").covers(&p("core.user.permission.list")));
        assert!(p("core.*").covers(&p("core")));
        assert!(!p("core.user").covers(&p("core.users")));
        assert!(!p("core.user.*").covers(&p("core.userx")));
        assert!(!p("core.user.*").covers(&p("core.userx.list")));
    }

    #[test]
    fn test_covers_wildcard_requirement() {
        assert!(p("core.*").covers(&p("core.user.*")));
        assert!(!p("core.user.*").covers(&p("core.*")));
        assert!(p("jabber.*").covers(&p("jabber.*")));
    }

    #[test]
    fn test_bare_wildcard_covers_everything() {
        assert!(p("*").covers(&p("core.user.list")));
        assert!(p("*").covers(&p("jabber.*")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&p("core.key.list.all")).unwrap();
        assert_eq!(json, "\"core.key.list.all\"");

        let parsed: Permission = serde_json::from_str("\"jabber.*\"").unwrap();
        assert!(parsed.is_wildcard());

        assert!(serde_json::from_str::<Permission>("\"bad..perm\"").is_err());
    }
}

//! Core identifier types used throughout the subsystem.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a shard in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a new shard id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the shard id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A fully qualified `db.collection` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Create a namespace from database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a `db.collection` string. The collection part may itself
    /// contain dots; the split happens at the first one.
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::InvalidNamespace(ns.to_string())),
        }
    }

    /// The database name.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// The collection name.
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parse() {
        let nss = Namespace::parse("app.users").unwrap();
        assert_eq!(nss.db(), "app");
        assert_eq!(nss.coll(), "users");
        assert_eq!(nss.to_string(), "app.users");
    }

    #[test]
    fn test_namespace_parse_nested_collection() {
        let nss = Namespace::parse("app.system.profile").unwrap();
        assert_eq!(nss.db(), "app");
        assert_eq!(nss.coll(), "system.profile");
    }

    #[test]
    fn test_namespace_parse_invalid() {
        assert!(Namespace::parse("noseparator").is_err());
        assert!(Namespace::parse(".coll").is_err());
        assert!(Namespace::parse("db.").is_err());
    }

    #[test]
    fn test_shard_id_display() {
        let shard = ShardId::from("shard0001");
        assert_eq!(shard.to_string(), "shard0001");
        assert_eq!(shard.as_str(), "shard0001");
    }
}

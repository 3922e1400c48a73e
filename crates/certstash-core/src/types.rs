//! Typed identifiers and object metadata shared across certstash crates.
//!
//! Identifiers are newtype wrappers around `String` so they cannot be
//! mixed up with keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier using UUID v4.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Return the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Identity written into lock records. One per provisioned storage.
    OwnerId
);

/// Server-assigned metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object location as reported by the store (no leading `/`).
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
    /// Entity tag, used for conditional replace.
    pub e_tag: Option<String>,
}

/// An object body together with its metadata.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: bytes::Bytes,
    pub info: ObjectInfo,
}

/// One entry produced by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    /// A leaf object.
    Object(ObjectInfo),
    /// A common prefix (directory) in a delimited listing, without the
    /// trailing `/`.
    Prefix(String),
}

impl ListEntry {
    /// The store location of the entry.
    pub fn key(&self) -> &str {
        match self {
            Self::Object(info) => &info.key,
            Self::Prefix(prefix) => prefix,
        }
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalPut {
    /// The object was written; carries the new entity tag when the store
    /// reports one.
    Written(Option<String>),
    /// The precondition failed and nothing was written.
    Conflict,
}

/// Metadata the cert manager consumes for a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Physical key.
    pub key: String,
    /// Last modification time, absent for empty directories.
    pub modified: Option<DateTime<Utc>>,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// True iff the key ends in `/`, i.e. names a directory-like grouping.
    pub is_terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generate_unique() {
        let a = OwnerId::generate();
        let b = OwnerId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = OwnerId::new("0b4f3c52-6c1e-4a55-9c3a-8f1d2e0b7a10");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0b4f3c52-6c1e-4a55-9c3a-8f1d2e0b7a10\"");
        let back: OwnerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_list_entry_key() {
        let prefix = ListEntry::Prefix("acme/x/y".to_string());
        assert_eq!(prefix.key(), "acme/x/y");

        let object = ListEntry::Object(ObjectInfo {
            key: "acme/x/1".to_string(),
            size: 3,
            last_modified: Utc::now(),
            e_tag: None,
        });
        assert_eq!(object.key(), "acme/x/1");
    }

    #[test]
    fn test_key_info_default_is_absent() {
        let info = KeyInfo::default();
        assert!(info.key.is_empty());
        assert!(info.modified.is_none());
        assert_eq!(info.size, 0);
        assert!(!info.is_terminal);
    }
}

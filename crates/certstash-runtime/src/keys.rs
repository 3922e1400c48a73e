//! Logical to physical key mapping.
//!
//! The cert manager addresses everything with logical keys such as
//! `certificates/acme-v02/example.com/example.com.crt`. In the bucket they
//! live at `<prefix>/<logical key>`. The mapping is plain concatenation:
//! nothing is trimmed or collapsed, so an empty prefix yields a leading `/`.

/// Suffix of lock record keys.
pub const LOCK_SUFFIX: &str = ".lock";

/// Maps logical keys to physical keys and listed locations back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    prefix: String,
    /// The prefix as the object store reports it in listings.
    root: String,
}

impl KeyMapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let root = prefix.trim_matches('/').to_string();
        Self { prefix, root }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `prefix + "/" + key`.
    pub fn physical(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    /// Physical key of the lock record guarding `key`.
    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{LOCK_SUFFIX}", self.physical(key))
    }

    /// Logical key for a location returned by the object store.
    ///
    /// Locations outside the prefix are returned unchanged.
    pub fn logical(&self, location: &str) -> String {
        if self.root.is_empty() {
            return location.to_string();
        }
        location
            .strip_prefix(&self.root)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(location)
            .to_string()
    }
}

/// Whether a listed location is a lock record rather than stored data.
pub fn is_lock_record(location: &str) -> bool {
    location.ends_with(LOCK_SUFFIX)
}

/// A terminal key names a directory-like grouping with no value of its own.
pub fn is_terminal(physical: &str) -> bool {
    physical.ends_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_concatenates() {
        let keys = KeyMapper::new("acme");
        assert_eq!(
            keys.physical("sites/example.com/cert.pem"),
            "acme/sites/example.com/cert.pem"
        );
        assert_eq!(keys.physical("dir/"), "acme/dir/");
    }

    #[test]
    fn test_empty_prefix_keeps_leading_separator() {
        let keys = KeyMapper::new("");
        assert_eq!(keys.physical("a/b"), "/a/b");
        assert_eq!(keys.logical("a/b"), "a/b");
    }

    #[test]
    fn test_no_normalization() {
        let keys = KeyMapper::new("acme");
        assert_eq!(keys.physical("/a"), "acme//a");
        assert_eq!(keys.physical("a//b"), "acme/a//b");
    }

    #[test]
    fn test_lock_key() {
        let keys = KeyMapper::new("acme");
        assert_eq!(keys.lock_key("sites/example.com"), "acme/sites/example.com.lock");
    }

    #[test]
    fn test_logical_strips_prefix() {
        let keys = KeyMapper::new("tenants/acme");
        assert_eq!(keys.logical("tenants/acme/x/1"), "x/1");
        assert_eq!(keys.logical("tenants/acmexyz/1"), "tenants/acmexyz/1");
        assert_eq!(keys.logical("elsewhere/1"), "elsewhere/1");
    }

    #[test]
    fn test_lock_record_locations() {
        let keys = KeyMapper::new("acme");
        assert!(is_lock_record(&keys.lock_key("sites/example.com")));
        assert!(!is_lock_record("acme/sites/example.com/cert.pem"));
    }

    #[test]
    fn test_terminal() {
        assert!(is_terminal("acme/x/"));
        assert!(!is_terminal("acme/x"));
    }
}

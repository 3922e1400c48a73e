//! Unified error type for certstash.
//!
//! All errors are represented by [`CertStashError`], using `thiserror` for
//! the definitions. Library code never uses `unwrap()`; every fallible
//! operation returns `Result<T, CertStashError>`.
//!
//! The cert manager needs exactly one distinction from this type:
//! [`CertStashError::NotFound`] versus everything else. Use
//! [`CertStashError::is_not_found`] rather than matching on messages.

use thiserror::Error;

/// The unified error type for all certstash operations.
#[derive(Error, Debug)]
pub enum CertStashError {
    /// The requested key does not exist in the object store.
    #[error("Not found: {key}")]
    NotFound {
        /// The physical key that was not found.
        key: String,
    },

    /// An object store request failed (network, auth, 5xx, signature).
    #[error("Storage error: {message}")]
    Storage {
        /// Operation name and physical key of the failed request.
        message: String,
        /// The underlying client error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The caller cancelled the operation's context.
    #[error("{operation} cancelled: {key}")]
    Cancelled {
        /// The operation that was aborted.
        operation: String,
        /// The physical key the operation was working on.
        key: String,
    },

    /// The operation's deadline passed before it completed.
    #[error("{operation} deadline exceeded: {key}")]
    DeadlineExceeded {
        /// The operation that was aborted.
        operation: String,
        /// The physical key the operation was working on.
        key: String,
    },

    /// Invalid or incomplete configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A key cannot be used for the requested operation.
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey {
        /// The offending physical key.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// A lock record or other payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl CertStashError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True if the key does not exist. This is the only classification the
    /// cert manager relies on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if the caller's context ended (cancellation or deadline).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }
}

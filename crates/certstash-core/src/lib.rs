//! certstash core types, traits, configuration, and errors.
//!
//! This crate provides the building blocks shared by the certstash crates:
//! the [`StorageBackend`] trait over object storage, the cert manager's
//! [`CertStorage`] / [`Locker`] contract, the cancellation [`Context`],
//! configuration resolution and the unified error type.

pub mod certstore;
pub mod config;
pub mod context;
pub mod error;
pub mod storage;
pub mod types;

pub use certstore::{CertStorage, Locker};
pub use config::{S3Options, S3Settings};
pub use context::Context;
pub use error::CertStashError;
pub use storage::StorageBackend;
pub use types::*;

/// Convenience Result type using [`CertStashError`].
pub type Result<T> = std::result::Result<T, CertStashError>;

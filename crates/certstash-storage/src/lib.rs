//! Object storage backend for certstash.
//!
//! This crate provides [`S3Backend`], the concrete implementation of the
//! [`StorageBackend`](certstash_core::StorageBackend) trait over any
//! S3-compatible endpoint, with an in-memory variant for development and
//! tests.
//!
//! Besides plain `put`/`get`/`head`/`delete`/`list` it exposes the two
//! conditional writes the distributed lock protocol needs.

pub mod s3;

pub use s3::S3Backend;

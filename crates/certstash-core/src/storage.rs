//! The StorageBackend trait: the object store operations certstash needs.
//!
//! This is the S3 client seam. The façade and the lock coordinator only ever
//! talk to object storage through it; the production implementation is
//! `S3Backend` in `certstash-storage`. Keys handed to a backend are physical
//! keys; the backend turns them into store locations.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::types::{ConditionalPut, ListEntry, ObjectInfo, StoredObject};
use crate::Result;

/// The object store interface used by certstash.
///
/// Implementations must be `Send + Sync` so one handle can be shared by all
/// concurrent operations. Errors are surfaced verbatim apart from two
/// classifications: a missing key is [`CertStashError::NotFound`], and a
/// failed precondition on a conditional write is reported as
/// [`ConditionalPut::Conflict`] instead of an error.
///
/// [`CertStashError::NotFound`]: crate::error::CertStashError::NotFound
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write an object, replacing any existing one. Returns the new entity tag.
    async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>>;

    /// Read an object fully into memory.
    async fn get(&self, key: &str) -> Result<StoredObject>;

    /// Fetch an object's metadata.
    async fn head(&self, key: &str) -> Result<ObjectInfo>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List entries below `prefix`.
    ///
    /// With `recursive` every descendant object is produced; without it only
    /// immediate children, with subdirectories collapsed into
    /// [`ListEntry::Prefix`]. The stream is finite and cannot be restarted.
    fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<ListEntry>>;

    /// Create an object only if nothing exists at `key` (`If-None-Match: *`).
    ///
    /// Returns [`ConditionalPut::Conflict`] when the key already existed.
    /// This is the atomic step the lock protocol is built on.
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<ConditionalPut>;

    /// Replace an object only if its entity tag still equals `e_tag`
    /// (`If-Match`).
    ///
    /// Returns [`ConditionalPut::Conflict`] when the object changed or
    /// disappeared in the meantime.
    async fn put_if_match(&self, key: &str, data: Bytes, e_tag: &str) -> Result<ConditionalPut>;

    /// Check that the bucket is reachable with the configured credentials.
    async fn probe(&self, prefix: &str) -> Result<()>;
}

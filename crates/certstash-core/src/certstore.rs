//! The certificate manager's storage contract.
//!
//! A cert manager persists account keys, certificates, private keys and
//! OCSP staples through [`CertStorage`], and serializes issuance and renewal
//! through [`Locker`]. Keys are logical, slash-separated paths owned by the
//! cert manager; implementations map them onto their backing store.

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::types::KeyInfo;
use crate::Result;

/// Exclusive, cross-process locking by name.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until this instance exclusively holds `name`, or the context
    /// ends.
    async fn lock(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Release `name`. Release failures are not reported; a lock that could
    /// not be removed expires after the staleness window.
    async fn unlock(&self, ctx: &Context, name: &str) -> Result<()>;
}

/// Key/value storage with filesystem-like listing and metadata.
#[async_trait]
pub trait CertStorage: Locker {
    /// Write `value` at `key`, replacing any previous value.
    async fn store(&self, ctx: &Context, key: &str, value: Bytes) -> Result<()>;

    /// Read the value at `key`.
    ///
    /// A missing key fails with [`CertStashError::NotFound`]; callers rely on
    /// that to tell absence apart from transport failures.
    ///
    /// [`CertStashError::NotFound`]: crate::error::CertStashError::NotFound
    async fn load(&self, ctx: &Context, key: &str) -> Result<Bytes>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<()>;

    /// Best-effort existence hint: any failure reads as `false`.
    async fn exists(&self, ctx: &Context, key: &str) -> bool;

    /// Keys below `prefix`, sorted.
    async fn list(&self, ctx: &Context, prefix: &str, recursive: bool) -> Result<Vec<String>>;

    /// Metadata for `key`.
    async fn stat(&self, ctx: &Context, key: &str) -> Result<KeyInfo>;

    /// Human-readable location of `key`, for logs.
    fn filename(&self, key: &str) -> String;
}

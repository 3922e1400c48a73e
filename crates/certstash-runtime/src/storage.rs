//! The S3 storage façade handed to the cert manager.
//!
//! [`S3Storage`] implements [`CertStorage`] and [`Locker`] on top of any
//! [`StorageBackend`]. Logical keys are mapped under the configured prefix,
//! every request honours the caller's [`Context`], and locks are delegated
//! to a [`LockCoordinator`] sharing the same backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use certstash_core::certstore::{CertStorage, Locker};
use certstash_core::config::S3Settings;
use certstash_core::context::Context;
use certstash_core::error::CertStashError;
use certstash_core::storage::StorageBackend;
use certstash_core::types::{KeyInfo, ListEntry, OwnerId};
use certstash_core::Result;
use certstash_storage::S3Backend;

use crate::keys::{is_lock_record, is_terminal, KeyMapper};
use crate::lock::LockCoordinator;

/// Certificate storage in one S3 bucket, below one prefix.
///
/// Built once by [`S3Storage::provision`] and then shared freely; all
/// operations take `&self`.
pub struct S3Storage {
    host: String,
    bucket: String,
    keys: KeyMapper,
    backend: Arc<dyn StorageBackend>,
    locks: LockCoordinator,
}

impl S3Storage {
    /// Connect to the bucket described by `settings`.
    ///
    /// Fails with [`CertStashError::Config`] when the settings are invalid,
    /// the client cannot be built, or the bucket is unreachable.
    pub async fn provision(settings: S3Settings) -> Result<Self> {
        settings.validate()?;
        let backend = S3Backend::new(&settings)?;
        Self::with_backend(settings, Arc::new(backend)).await
    }

    /// Provision over an existing backend, e.g. an in-memory bucket.
    pub async fn with_backend(settings: S3Settings, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        settings.validate()?;
        backend.probe(&settings.prefix).await.map_err(|e| {
            CertStashError::config(format!(
                "Bucket {} on {} is not usable: {e}",
                settings.bucket, settings.host
            ))
        })?;

        let owner = OwnerId::generate();
        let locks = LockCoordinator::new(Arc::clone(&backend), owner, settings.lock);
        let storage = Self {
            host: settings.host,
            bucket: settings.bucket,
            keys: KeyMapper::new(settings.prefix),
            backend,
            locks,
        };

        info!(
            host = %storage.host,
            bucket = %storage.bucket,
            prefix = %storage.keys.prefix(),
            owner = %storage.owner(),
            "S3 storage provisioned"
        );
        Ok(storage)
    }

    /// Identity this storage writes into lock records.
    pub fn owner(&self) -> &OwnerId {
        self.locks.owner()
    }

    /// The key mapper in use.
    pub fn keys(&self) -> &KeyMapper {
        &self.keys
    }

    /// The lock coordinator in use.
    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Delete every object below a terminal key.
    async fn delete_tree(&self, ctx: &Context, physical: &str) -> Result<()> {
        let entries = self.backend.list(physical, true);
        let objects = collect(ctx, "delete", physical, entries).await?;
        for entry in &objects {
            ctx.run("delete", entry.key(), self.backend.delete(entry.key()))
                .await?;
        }
        debug!(key = %physical, deleted = objects.len(), "Deleted directory");
        Ok(())
    }

    /// Emulate metadata for a terminal key from a delimited listing.
    async fn stat_tree(&self, ctx: &Context, physical: &str) -> Result<KeyInfo> {
        let entries = self.backend.list(physical, false);
        let children = collect(ctx, "stat", physical, entries).await?;
        if children.is_empty() {
            return Err(CertStashError::NotFound {
                key: physical.to_string(),
            });
        }
        let modified: Option<DateTime<Utc>> = children
            .iter()
            .filter_map(|entry| match entry {
                ListEntry::Object(info) => Some(info.last_modified),
                ListEntry::Prefix(_) => None,
            })
            .max();
        Ok(KeyInfo {
            key: physical.to_string(),
            modified,
            size: 0,
            is_terminal: true,
        })
    }
}

/// Drain a listing, checking `ctx` between entries. Lock records are
/// coordination state, not data, and are left out.
async fn collect(
    ctx: &Context,
    operation: &str,
    physical: &str,
    mut entries: BoxStream<'static, Result<ListEntry>>,
) -> Result<Vec<ListEntry>> {
    let mut out = Vec::new();
    loop {
        let next = ctx
            .run(operation, physical, async { Ok(entries.next().await) })
            .await?;
        match next {
            Some(Ok(ListEntry::Object(info))) if is_lock_record(&info.key) => {}
            Some(entry) => out.push(entry?),
            None => return Ok(out),
        }
    }
}

impl fmt::Display for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S3Storage:{}:{}:{}", self.host, self.bucket, self.keys.prefix())
    }
}

impl fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Storage")
            .field("host", &self.host)
            .field("bucket", &self.bucket)
            .field("prefix", &self.keys.prefix())
            .field("owner", self.owner())
            .finish()
    }
}

#[async_trait]
impl Locker for S3Storage {
    #[instrument(skip(self, ctx), fields(key = %name))]
    async fn lock(&self, ctx: &Context, name: &str) -> Result<()> {
        self.locks.lock(ctx, &self.keys.lock_key(name)).await
    }

    #[instrument(skip(self, ctx), fields(key = %name))]
    async fn unlock(&self, ctx: &Context, name: &str) -> Result<()> {
        self.locks.unlock(ctx, &self.keys.lock_key(name)).await
    }
}

#[async_trait]
impl CertStorage for S3Storage {
    #[instrument(skip(self, ctx, value), fields(key = %key), err(level = "debug"))]
    async fn store(&self, ctx: &Context, key: &str, value: Bytes) -> Result<()> {
        let physical = self.keys.physical(key);
        if is_terminal(&physical) {
            return Err(CertStashError::invalid_key(
                physical,
                "cannot store a value at a directory key",
            ));
        }
        let size = value.len();
        ctx.run("store", &physical, self.backend.put(&physical, value))
            .await?;
        debug!(key = %physical, size, "Stored");
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(key = %key), err(level = "debug"))]
    async fn load(&self, ctx: &Context, key: &str) -> Result<Bytes> {
        let physical = self.keys.physical(key);
        if is_terminal(&physical) {
            return Err(CertStashError::NotFound { key: physical });
        }
        let object = ctx
            .run("load", &physical, self.backend.get(&physical))
            .await?;
        debug!(key = %physical, size = object.data.len(), "Loaded");
        Ok(object.data)
    }

    #[instrument(skip(self, ctx), fields(key = %key), err(level = "debug"))]
    async fn delete(&self, ctx: &Context, key: &str) -> Result<()> {
        let physical = self.keys.physical(key);
        if is_terminal(&physical) {
            return self.delete_tree(ctx, &physical).await;
        }
        ctx.run("delete", &physical, self.backend.delete(&physical))
            .await?;
        debug!(key = %physical, "Deleted");
        Ok(())
    }

    async fn exists(&self, ctx: &Context, key: &str) -> bool {
        let physical = self.keys.physical(key);
        if is_terminal(&physical) {
            return false;
        }
        match ctx.run("exists", &physical, self.backend.head(&physical)).await {
            Ok(_) => true,
            Err(e) => {
                debug!(key = %physical, error = %e, "Exists check negative");
                false
            }
        }
    }

    #[instrument(skip(self, ctx), fields(prefix = %prefix), err(level = "debug"))]
    async fn list(&self, ctx: &Context, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let physical = self.keys.physical(prefix);
        let entries = self.backend.list(&physical, recursive);
        let entries = collect(ctx, "list", &physical, entries).await?;

        let mut keys: Vec<String> = entries
            .iter()
            .map(|entry| match entry {
                ListEntry::Object(info) => self.keys.logical(&info.key),
                ListEntry::Prefix(dir) => format!("{}/", self.keys.logical(dir)),
            })
            .collect();
        keys.sort();
        debug!(prefix = %physical, recursive, count = keys.len(), "Listed");
        Ok(keys)
    }

    #[instrument(skip(self, ctx), fields(key = %key), err(level = "debug"))]
    async fn stat(&self, ctx: &Context, key: &str) -> Result<KeyInfo> {
        let physical = self.keys.physical(key);
        if is_terminal(&physical) {
            return self.stat_tree(ctx, &physical).await;
        }
        let info = ctx
            .run("stat", &physical, self.backend.head(&physical))
            .await?;
        debug!(key = %physical, size = info.size, "Stat");
        Ok(KeyInfo {
            key: physical,
            modified: Some(info.last_modified),
            size: info.size,
            is_terminal: false,
        })
    }

    fn filename(&self, key: &str) -> String {
        self.keys.physical(key)
    }
}

//! Shared fixtures for the integration suites: settings, an in-memory
//! bucket and a backend wrapper that injects transport failures and latency.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use certstash_core::config::{CredentialMode, LockSettings, S3Settings};
use certstash_core::error::CertStashError;
use certstash_core::storage::StorageBackend;
use certstash_core::types::{ConditionalPut, ListEntry, ObjectInfo, StoredObject};
use certstash_core::Result;
use certstash_runtime::S3Storage;
use certstash_storage::S3Backend;

/// Lock timings short enough for tests.
pub fn fast_locks() -> LockSettings {
    LockSettings {
        stale_after: Duration::from_millis(600),
        poll_interval: Duration::from_millis(50),
        refresh_interval: Duration::from_millis(150),
    }
}

pub fn settings(prefix: &str) -> S3Settings {
    S3Settings {
        host: "s3.local".to_string(),
        bucket: "certs".to_string(),
        access_id: "AKIDEXAMPLE".to_string(),
        secret_key: "wJalrXUtnFEMI".to_string(),
        prefix: prefix.to_string(),
        insecure: false,
        region: "us-east-1".to_string(),
        credentials: CredentialMode::Static,
        lock: fast_locks(),
    }
}

/// Provision a storage over `backend` with prefix `acme`.
pub async fn provision(backend: &Arc<FaultyBackend>) -> S3Storage {
    S3Storage::with_backend(settings("acme"), Arc::clone(backend) as Arc<dyn StorageBackend>)
        .await
        .expect("storage should provision")
}

/// A fresh in-memory bucket behind a fault injector.
pub fn bucket() -> Arc<FaultyBackend> {
    Arc::new(FaultyBackend::new(S3Backend::in_memory()))
}

/// Wraps a backend and fails or delays requests on demand.
pub struct FaultyBackend {
    inner: S3Backend,
    offline: AtomicBool,
    failures: AtomicUsize,
    latency_ms: AtomicU64,
    requests: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(inner: S3Backend) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    /// The wrapped backend, bypassing fault injection.
    pub fn inner(&self) -> &S3Backend {
        &self.inner
    }

    /// Fail every request until set back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` requests.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Delay every request.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Requests seen so far, including failed ones.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn injected(&self, operation: &str, key: &str) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed || self.offline.load(Ordering::SeqCst) {
            return Err(CertStashError::storage_msg(format!(
                "injected {operation} failure for {key}"
            )));
        }
        Ok(())
    }

    async fn enter(&self, operation: &str, key: &str) -> Result<()> {
        self.injected(operation, key)?;
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>> {
        self.enter("put", key).await?;
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.enter("get", key).await?;
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        self.enter("head", key).await?;
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter("delete", key).await?;
        self.inner.delete(key).await
    }

    fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<ListEntry>> {
        if let Err(e) = self.injected("list", prefix) {
            return stream::once(async move { Err(e) }).boxed();
        }
        self.inner.list(prefix, recursive)
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<ConditionalPut> {
        self.enter("put_if_not_exists", key).await?;
        self.inner.put_if_not_exists(key, data).await
    }

    async fn put_if_match(&self, key: &str, data: Bytes, e_tag: &str) -> Result<ConditionalPut> {
        self.enter("put_if_match", key).await?;
        self.inner.put_if_match(key, data, e_tag).await
    }

    async fn probe(&self, prefix: &str) -> Result<()> {
        self.enter("probe", prefix).await?;
        self.inner.probe(prefix).await
    }
}

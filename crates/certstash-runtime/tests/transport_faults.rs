//! Integration test: Transport failures.
//!
//! Failures of the object store must never read as "not found", must not
//! leak partial results, and must not wedge the lock protocol.

mod common;

use std::time::Duration;

use bytes::Bytes;

use certstash_core::{CertStashError, CertStorage, Context, Locker, StorageBackend};
use certstash_runtime::S3Storage;

#[tokio::test]
async fn test_unreachable_bucket_fails_provisioning() {
    let bucket = common::bucket();
    bucket.set_offline(true);
    let err = S3Storage::with_backend(common::settings("acme"), bucket.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, CertStashError::Config { .. }), "got {err}");
    assert!(err.to_string().contains("certs"));
}

#[tokio::test]
async fn test_load_failure_is_not_not_found() {
    let bucket = common::bucket();
    let storage = common::provision(&bucket).await;
    let ctx = Context::background();
    storage
        .store(&ctx, "sites/a/cert.pem", Bytes::from_static(b"pem"))
        .await
        .unwrap();

    bucket.set_offline(true);
    let err = storage.load(&ctx, "sites/a/cert.pem").await.unwrap_err();
    assert!(matches!(err, CertStashError::Storage { .. }), "got {err}");
    assert!(!err.is_not_found());

    let err = storage.stat(&ctx, "sites/a/cert.pem").await.unwrap_err();
    assert!(!err.is_not_found());

    // Exists is a hint and degrades to false
    assert!(!storage.exists(&ctx, "sites/a/cert.pem").await);

    bucket.set_offline(false);
    assert!(storage.exists(&ctx, "sites/a/cert.pem").await);
}

#[tokio::test]
async fn test_store_and_delete_report_failures() {
    let bucket = common::bucket();
    let storage = common::provision(&bucket).await;
    let ctx = Context::background();

    bucket.fail_next(1);
    assert!(storage
        .store(&ctx, "k", Bytes::from_static(b"v"))
        .await
        .is_err());
    assert!(!storage.exists(&ctx, "k").await);

    storage
        .store(&ctx, "k", Bytes::from_static(b"v"))
        .await
        .unwrap();
    bucket.fail_next(1);
    assert!(storage.delete(&ctx, "k").await.is_err());
    assert!(storage.exists(&ctx, "k").await);
}

#[tokio::test]
async fn test_list_failure_returns_error_not_partial() {
    let bucket = common::bucket();
    let storage = common::provision(&bucket).await;
    let ctx = Context::background();
    storage
        .store(&ctx, "x/1", Bytes::from_static(b"1"))
        .await
        .unwrap();

    bucket.fail_next(1);
    let err = storage.list(&ctx, "x", true).await.unwrap_err();
    assert!(matches!(err, CertStashError::Storage { .. }));

    assert_eq!(storage.list(&ctx, "x", true).await.unwrap(), vec!["x/1"]);
}

#[tokio::test]
async fn test_lock_retries_through_transient_failures() {
    let bucket = common::bucket();
    let storage = common::provision(&bucket).await;
    let ctx = Context::background().with_timeout(Duration::from_secs(5));

    bucket.fail_next(3);
    storage.lock(&ctx, "sites/flaky").await.unwrap();
    assert!(storage.locks().is_held("acme/sites/flaky.lock").await);
    storage.unlock(&ctx, "sites/flaky").await.unwrap();
}

#[tokio::test]
async fn test_lock_gives_up_on_invalid_key() {
    let bucket = common::bucket();
    let storage = common::provision(&bucket).await;
    let ctx = Context::background().with_timeout(Duration::from_secs(5));

    let err = storage.lock(&ctx, "a//b").await.unwrap_err();
    assert!(matches!(err, CertStashError::InvalidKey { .. }), "got {err}");
}

#[tokio::test]
async fn test_unlock_swallows_transport_failure() {
    let bucket = common::bucket();
    let a = common::provision(&bucket).await;
    let b = common::provision(&bucket).await;
    let ctx = Context::background();

    a.lock(&ctx, "renew").await.unwrap();
    bucket.set_offline(true);
    a.unlock(&ctx, "renew").await.unwrap();
    assert!(!a.locks().is_held("acme/renew.lock").await);
    bucket.set_offline(false);

    // The record was left behind and expires
    assert!(bucket.inner().head("acme/renew.lock").await.is_ok());
    let within = Context::background().with_timeout(Duration::from_secs(5));
    b.lock(&within, "renew").await.unwrap();
    b.unlock(&ctx, "renew").await.unwrap();
}

#[tokio::test]
async fn test_unlock_without_lock_is_ok() {
    let bucket = common::bucket();
    let storage = common::provision(&bucket).await;
    storage
        .unlock(&Context::background(), "never-locked")
        .await
        .unwrap();
}

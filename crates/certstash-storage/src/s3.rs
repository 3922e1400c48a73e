//! S3-compatible object storage backend.
//!
//! [`S3Backend`] implements the [`StorageBackend`] trait using the
//! `object_store` crate, supporting any S3-compatible endpoint: AWS S3,
//! MinIO, Ceph, Garage, etc.
//!
//! Conditional writes use `put_opts` with `PutMode::Create` (the
//! `If-None-Match: *` header) and `PutMode::Update` (`If-Match: <etag>`).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use tracing::{debug, instrument};

use certstash_core::config::{CredentialMode, S3Settings};
use certstash_core::error::CertStashError;
use certstash_core::storage::StorageBackend;
use certstash_core::types::{ConditionalPut, ListEntry, ObjectInfo, StoredObject};
use certstash_core::Result;

/// A [`StorageBackend`] backed by any S3-compatible object storage.
///
/// The handle is internally synchronized and shared by every operation of a
/// provisioned storage; it is never reconfigured after construction.
#[derive(Debug, Clone)]
pub struct S3Backend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl S3Backend {
    /// Create a new `S3Backend` from resolved settings.
    ///
    /// Requests are signed with AWS v4. With [`CredentialMode::Static`] the
    /// configured access key pair is used; with [`CredentialMode::Instance`]
    /// the client fetches instance role credentials itself.
    pub fn new(settings: &S3Settings) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(settings.endpoint())
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_allow_http(settings.insecure)
            .with_conditional_put(S3ConditionalPut::ETagMatch);

        if settings.credentials == CredentialMode::Static {
            builder = builder
                .with_access_key_id(&settings.access_id)
                .with_secret_access_key(&settings.secret_key);
        }

        let store = builder.build().map_err(|e| CertStashError::Config {
            message: format!(
                "Failed to create S3 client for {}/{}: {e}",
                settings.host, settings.bucket
            ),
        })?;

        debug!(
            host = %settings.host,
            bucket = %settings.bucket,
            secure = settings.secure(),
            "S3Backend initialised"
        );

        Ok(Self {
            store: Arc::new(store),
            bucket: settings.bucket.clone(),
        })
    }

    /// Wrap an already constructed object store.
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// A process-local in-memory bucket, for development and tests.
    ///
    /// Supports the same conditional writes as S3. Clones share the bucket.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemory::new()), "memory")
    }

    /// The bucket this backend writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Turn a physical key into a store location.
///
/// A leading or trailing `/` does not become part of the object name; empty
/// inner segments and `.`/`..` segments are rejected.
fn location(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).map_err(|e| CertStashError::invalid_key(key, e.to_string()))
}

fn object_info(meta: ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        key: meta.location.to_string(),
        size: meta.size,
        last_modified: meta.last_modified,
        e_tag: meta.e_tag,
    }
}

/// Translate a client error. Only a missing object gets its own kind.
fn classify(operation: &str, key: &str, err: object_store::Error) -> CertStashError {
    match err {
        object_store::Error::NotFound { .. } => CertStashError::NotFound {
            key: key.to_string(),
        },
        other => CertStashError::storage(format!("S3 {operation} failed for {key}"), other),
    }
}

/// `None` for the bucket root so listings are not scoped to an empty path.
fn list_prefix(location: ObjectPath) -> Option<ObjectPath> {
    if location.as_ref().is_empty() {
        None
    } else {
        Some(location)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>> {
        let path = location(key)?;
        let result = self
            .store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| CertStashError::storage(format!("S3 put failed for {key}"), e))?;
        Ok(result.e_tag)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<StoredObject> {
        let path = location(key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| classify("get", key, e))?;
        let info = object_info(result.meta.clone());
        // A body that vanishes mid-read is a transport failure, not absence.
        let data = result
            .bytes()
            .await
            .map_err(|e| CertStashError::storage(format!("S3 get bytes failed for {key}"), e))?;
        Ok(StoredObject { data, info })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let path = location(key)?;
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| classify("head", key, e))?;
        Ok(object_info(meta))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = location(key)?;
        // S3 delete is idempotent: a missing key is not an error
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(CertStashError::storage(format!("S3 delete failed for {key}"), e)),
        }
    }

    fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<ListEntry>> {
        let scope = match location(prefix) {
            Ok(path) => list_prefix(path),
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let store = Arc::clone(&self.store);
        let prefix = prefix.to_string();

        if recursive {
            return store
                .list(scope.as_ref())
                .map(move |item| {
                    item.map(|meta| ListEntry::Object(object_info(meta)))
                        .map_err(|e| {
                            CertStashError::storage(format!("S3 list failed for prefix {prefix}"), e)
                        })
                })
                .boxed();
        }

        stream::once(async move {
            let listing = store.list_with_delimiter(scope.as_ref()).await;
            match listing {
                Ok(listing) => listing
                    .common_prefixes
                    .into_iter()
                    .map(|p| Ok(ListEntry::Prefix(p.to_string())))
                    .chain(
                        listing
                            .objects
                            .into_iter()
                            .map(|meta| Ok(ListEntry::Object(object_info(meta)))),
                    )
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(CertStashError::storage(
                    format!("S3 list failed for prefix {prefix}"),
                    e,
                ))],
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<ConditionalPut> {
        let path = location(key)?;
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&path, PutPayload::from(data), opts)
            .await
        {
            Ok(result) => Ok(ConditionalPut::Written(result.e_tag)),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(ConditionalPut::Conflict),
            // Some S3-compatible stores return Precondition instead of AlreadyExists
            Err(object_store::Error::Precondition { .. }) => Ok(ConditionalPut::Conflict),
            Err(e) => Err(CertStashError::storage(
                format!("S3 conditional put failed for {key}"),
                e,
            )),
        }
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put_if_match(&self, key: &str, data: Bytes, e_tag: &str) -> Result<ConditionalPut> {
        let path = location(key)?;
        let opts = PutOptions {
            mode: PutMode::Update(UpdateVersion {
                e_tag: Some(e_tag.to_string()),
                version: None,
            }),
            ..Default::default()
        };
        match self
            .store
            .put_opts(&path, PutPayload::from(data), opts)
            .await
        {
            Ok(result) => Ok(ConditionalPut::Written(result.e_tag)),
            Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::NotFound { .. }) => Ok(ConditionalPut::Conflict),
            Err(e) => Err(CertStashError::storage(
                format!("S3 conditional replace failed for {key}"),
                e,
            )),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, prefix = %prefix))]
    async fn probe(&self, prefix: &str) -> Result<()> {
        let scope = list_prefix(location(prefix)?);
        self.store
            .list_with_delimiter(scope.as_ref())
            .await
            .map_err(|e| {
                CertStashError::storage(format!("S3 bucket {} is not reachable", self.bucket), e)
            })?;
        debug!("Bucket reachable");
        Ok(())
    }
}

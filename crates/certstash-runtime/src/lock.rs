//! Distributed lock coordinator over conditional object writes.
//!
//! A lock is a small JSON record at `<physical key>.lock`. Acquisition
//! creates it with `If-None-Match: *`; a record older than the staleness
//! window is taken over with `If-Match: <etag>`. While held, a keep-alive
//! task rewrites the record so its timestamp stays fresh. Within one process
//! callers for the same key first serialize on a local mutex, so only one
//! local task at a time talks to the object store about a given lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use certstash_core::config::LockSettings;
use certstash_core::context::{CancelHandle, Context};
use certstash_core::error::CertStashError;
use certstash_core::storage::StorageBackend;
use certstash_core::types::{ConditionalPut, OwnerId, StoredObject};
use certstash_core::Result;

/// First retry delay after a transport error during acquisition.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Lock record
// ---------------------------------------------------------------------------

/// The payload of a lock object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: OwnerId,
    pub acquired: DateTime<Utc>,
}

impl LockRecord {
    /// A record claiming the lock for `owner` as of now.
    pub fn new(owner: &OwnerId) -> Self {
        Self {
            owner: owner.clone(),
            acquired: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CertStashError::Serialization(e.to_string()))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| CertStashError::Serialization(e.to_string()))
    }

    /// Time since the record was written; zero for timestamps in the future.
    pub fn age(&self) -> Duration {
        age_of(self.acquired)
    }
}

fn age_of(at: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// LockCoordinator
// ---------------------------------------------------------------------------

/// Result of one acquisition attempt.
enum Attempt {
    Acquired(Option<String>),
    /// Someone else holds a fresh record.
    Busy { holder: Option<OwnerId> },
    /// The record changed between our steps; try again right away.
    Raced,
}

/// Background task keeping a held record fresh.
struct KeepAlive {
    cancel: CancelHandle,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lock keep-alive task failed");
        }
    }
}

/// A lock this instance holds.
struct HeldLock {
    guard: OwnedMutexGuard<()>,
    keep_alive: Option<KeepAlive>,
}

/// Provides `lock`/`unlock` on physical lock keys.
pub struct LockCoordinator {
    backend: Arc<dyn StorageBackend>,
    owner: OwnerId,
    settings: LockSettings,
    local: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    held: RwLock<HashMap<String, HeldLock>>,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn StorageBackend>, owner: OwnerId, settings: LockSettings) -> Self {
        Self {
            backend,
            owner,
            settings,
            local: RwLock::new(HashMap::new()),
            held: RwLock::new(HashMap::new()),
        }
    }

    /// The identity written into this coordinator's lock records.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Whether this instance currently holds `key`.
    pub async fn is_held(&self, key: &str) -> bool {
        self.held.read().await.contains_key(key)
    }

    /// Block until this instance holds `key` or `ctx` ends.
    pub async fn lock(&self, ctx: &Context, key: &str) -> Result<()> {
        let mutex = self.local_mutex(key).await;
        let guard = match ctx
            .run("lock", key, async move { Ok(mutex.lock_owned().await) })
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                self.forget_local(key).await;
                return Err(e);
            }
        };

        match self.acquire(ctx, key).await {
            Ok(e_tag) => {
                let keep_alive = self.spawn_keep_alive(key, e_tag);
                self.held.write().await.insert(
                    key.to_string(),
                    HeldLock {
                        guard,
                        keep_alive,
                    },
                );
                info!(key = %key, owner = %self.owner, "Lock acquired");
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.forget_local(key).await;
                debug!(key = %key, error = %e, "Lock acquisition aborted");
                Err(e)
            }
        }
    }

    /// Release `key`.
    ///
    /// Local state is always released. Failures removing the record are
    /// logged and swallowed since the staleness window frees it eventually;
    /// only a cancelled or expired `ctx` is reported.
    pub async fn unlock(&self, ctx: &Context, key: &str) -> Result<()> {
        if !self.held.read().await.contains_key(key) {
            warn!(key = %key, "Unlock of a lock this instance does not hold");
            return Ok(());
        }
        let Some(held) = self.held.write().await.remove(key) else {
            return Ok(());
        };

        if let Some(keep_alive) = held.keep_alive {
            keep_alive.stop().await;
        }

        let released = self.release_record(ctx, key).await;
        drop(held.guard);
        self.forget_local(key).await;

        match released {
            Ok(()) => {
                info!(key = %key, "Lock released");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to remove lock record; it will expire");
                Ok(())
            }
        }
    }

    /// Loop until the record is ours. Contention waits one jittered poll
    /// interval; transport errors back off exponentially up to it.
    async fn acquire(&self, ctx: &Context, key: &str) -> Result<Option<String>> {
        let first_backoff = INITIAL_BACKOFF.min(self.settings.poll_interval);
        let mut backoff = first_backoff;
        loop {
            ctx.check("lock", key)?;
            match self.try_acquire(ctx, key).await {
                Ok(Attempt::Acquired(e_tag)) => return Ok(e_tag),
                Ok(Attempt::Busy { holder }) => {
                    backoff = first_backoff;
                    let wait = self.poll_delay();
                    debug!(
                        key = %key,
                        holder = holder.as_ref().map(OwnerId::as_str).unwrap_or("unknown"),
                        wait_ms = wait.as_millis() as u64,
                        "Lock busy"
                    );
                    ctx.sleep("lock", key, wait).await?;
                }
                Ok(Attempt::Raced) => {}
                Err(e @ CertStashError::Storage { .. }) => {
                    warn!(
                        key = %key,
                        error = %e,
                        retry_ms = backoff.as_millis() as u64,
                        "Lock attempt failed, retrying"
                    );
                    ctx.sleep("lock", key, backoff).await?;
                    backoff = (backoff * 2).min(self.settings.poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_acquire(&self, ctx: &Context, key: &str) -> Result<Attempt> {
        let body = LockRecord::new(&self.owner).to_bytes()?;
        let created = ctx
            .run("lock", key, self.backend.put_if_not_exists(key, body.clone()))
            .await?;
        if let ConditionalPut::Written(e_tag) = created {
            return Ok(Attempt::Acquired(e_tag));
        }

        let existing = match ctx.run("lock", key, self.backend.get(key)).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => return Ok(Attempt::Raced),
            Err(e) => return Err(e),
        };
        let (holder, age) = self.inspect(key, &existing);

        // A leftover record of ours cannot be live: the local mutex is held.
        let ours = holder.as_ref() == Some(&self.owner);
        if !ours && age < self.settings.stale_after {
            return Ok(Attempt::Busy { holder });
        }

        let Some(e_tag) = existing.info.e_tag.as_deref() else {
            warn!(key = %key, "Lock record has no entity tag and cannot be reclaimed");
            return Ok(Attempt::Busy { holder });
        };
        match ctx
            .run("lock", key, self.backend.put_if_match(key, body, e_tag))
            .await?
        {
            ConditionalPut::Written(e_tag) => {
                info!(
                    key = %key,
                    previous = holder.as_ref().map(OwnerId::as_str).unwrap_or("unknown"),
                    age_secs = age.as_secs(),
                    "Reclaimed stale lock"
                );
                Ok(Attempt::Acquired(e_tag))
            }
            ConditionalPut::Conflict => Ok(Attempt::Raced),
        }
    }

    /// Holder and age of an existing record. Unreadable records are aged by
    /// their last-modified time.
    fn inspect(&self, key: &str, existing: &StoredObject) -> (Option<OwnerId>, Duration) {
        match LockRecord::from_slice(&existing.data) {
            Ok(record) => {
                let age = record.age();
                (Some(record.owner), age)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable lock record");
                (None, age_of(existing.info.last_modified))
            }
        }
    }

    /// Delete the record if it is ours and still fresh. A stale record may be
    /// in the middle of being reclaimed, so it is left alone.
    async fn release_record(&self, ctx: &Context, key: &str) -> Result<()> {
        let existing = match ctx.run("unlock", key, self.backend.get(key)).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                warn!(key = %key, "Lock record already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let (holder, age) = self.inspect(key, &existing);
        if holder.as_ref() != Some(&self.owner) {
            warn!(
                key = %key,
                holder = holder.as_ref().map(OwnerId::as_str).unwrap_or("unknown"),
                "Lock record belongs to another instance; not deleting"
            );
            return Ok(());
        }
        if age >= self.settings.stale_after {
            warn!(key = %key, age_secs = age.as_secs(), "Own lock record went stale; not deleting");
            return Ok(());
        }

        ctx.run("unlock", key, self.backend.delete(key)).await
    }

    fn spawn_keep_alive(&self, key: &str, e_tag: Option<String>) -> Option<KeepAlive> {
        let Some(e_tag) = e_tag else {
            warn!(key = %key, "Store returned no entity tag; lock record will not be refreshed");
            return None;
        };

        let (ctx, cancel) = Context::background().with_cancel();
        let refresher = Refresher {
            backend: Arc::clone(&self.backend),
            key: key.to_string(),
            owner: self.owner.clone(),
            interval: self.settings.refresh_interval,
        };
        let handle = tokio::spawn(async move { refresher.run(ctx, e_tag).await });
        Some(KeepAlive { cancel, handle })
    }

    /// Poll interval with ±20% jitter so contenders spread out.
    fn poll_delay(&self) -> Duration {
        let base = self.settings.poll_interval.as_millis() as u64;
        let spread = base / 5;
        let jitter = rand::rng().random_range(0..=spread * 2);
        Duration::from_millis(base - spread + jitter)
    }

    async fn local_mutex(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(mutex) = self.local.read().await.get(key) {
            return Arc::clone(mutex);
        }
        let mut local = self.local.write().await;
        Arc::clone(local.entry(key.to_string()).or_default())
    }

    /// Drop the local mutex for `key` once nobody holds or waits for it.
    async fn forget_local(&self, key: &str) {
        let mut local = self.local.write().await;
        if local.get(key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            local.remove(key);
        }
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        // Records are left to expire; only the refresh tasks are stopped.
        for (_, held) in self.held.get_mut().drain() {
            if let Some(keep_alive) = held.keep_alive {
                keep_alive.cancel.cancel();
                keep_alive.handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

struct Refresher {
    backend: Arc<dyn StorageBackend>,
    key: String,
    owner: OwnerId,
    interval: Duration,
}

impl Refresher {
    /// Rewrite the record every `interval` until cancelled or the record is
    /// lost to another instance.
    async fn run(self, ctx: Context, mut e_tag: String) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = ctx.done() => {
                    debug!(key = %self.key, "Lock keep-alive stopping");
                    return;
                }
            }

            let body = match LockRecord::new(&self.owner).to_bytes() {
                Ok(body) => body,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to encode lock record");
                    return;
                }
            };
            match self.backend.put_if_match(&self.key, body, &e_tag).await {
                Ok(ConditionalPut::Written(Some(next))) => {
                    debug!(key = %self.key, "Lock record refreshed");
                    e_tag = next;
                }
                Ok(ConditionalPut::Written(None)) => {
                    warn!(key = %self.key, "Store returned no entity tag; stopping keep-alive");
                    return;
                }
                Ok(ConditionalPut::Conflict) => {
                    warn!(key = %self.key, "Lock record was taken over; lock lost");
                    return;
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to refresh lock record");
                }
            }
        }
    }
}

//! Cancellation and deadline handle passed to every storage operation.
//!
//! A [`Context`] is cheap to clone. It ends when any of its cancel signals
//! fires or when its deadline passes, whichever comes first. Operations race
//! their I/O against [`Context::done`] and report [`CertStashError::Cancelled`]
//! or [`CertStashError::DeadlineExceeded`], never a not-found error.

use std::future::Future;
use std::time::Duration;

use futures::future::{select_all, FutureExt};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::CertStashError;
use crate::Result;

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Cancelled,
    DeadlineExceeded,
}

impl Done {
    /// Build the caller-visible error for an aborted operation.
    pub fn into_error(self, operation: &str, key: &str) -> CertStashError {
        match self {
            Self::Cancelled => CertStashError::Cancelled {
                operation: operation.to_string(),
                key: key.to_string(),
            },
            Self::DeadlineExceeded => CertStashError::DeadlineExceeded {
                operation: operation.to_string(),
                key: key.to_string(),
            },
        }
    }
}

/// Cancellation/deadline handle for storage operations.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Fires the cancel signal of the contexts derived from it.
///
/// Dropping the handle without calling [`CancelHandle::cancel`] never
/// cancels.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every context derived from this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that never ends.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that additionally ends when the returned handle
    /// is cancelled.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut child = self.clone();
        child.cancel.push(rx);
        (child, CancelHandle { tx })
    }

    /// Derive a context that ends after `timeout` at the latest.
    ///
    /// A timeout too large to represent adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a context that ends at `deadline` at the latest.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        child
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return why the context has ended, without waiting.
    pub fn ended(&self) -> Option<Done> {
        if self.cancel.iter().any(|rx| *rx.borrow()) {
            return Some(Done::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Done::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail with the matching error if the context has already ended.
    pub fn check(&self, operation: &str, key: &str) -> Result<()> {
        match self.ended() {
            Some(done) => Err(done.into_error(operation, key)),
            None => Ok(()),
        }
    }

    /// Wait until the context ends. Pending forever for [`Context::background`].
    pub async fn done(&self) -> Done {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = wait_for_any_cancel(&self.cancel) => Done::Cancelled,
            _ = deadline => Done::DeadlineExceeded,
        }
    }

    /// Run `fut` unless the context ends first.
    pub async fn run<T, F>(&self, operation: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation, key)?;
        tokio::select! {
            biased;
            done = self.done() => Err(done.into_error(operation, key)),
            result = fut => result,
        }
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, operation: &str, key: &str, duration: Duration) -> Result<()> {
        self.run(operation, key, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

/// Wait until any receiver signals `true`.
async fn wait_for_any_cancel(receivers: &[watch::Receiver<bool>]) {
    if receivers.is_empty() {
        return std::future::pending().await;
    }
    let waits = receivers
        .iter()
        .map(|rx| wait_for_cancel(rx.clone()).boxed())
        .collect::<Vec<_>>();
    select_all(waits).await;
}

/// Wait until the watch channel signals `true`.
async fn wait_for_cancel(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling.
            return std::future::pending().await;
        }
    }
}

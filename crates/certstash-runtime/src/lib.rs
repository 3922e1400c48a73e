//! certstash runtime: the S3 storage façade and the distributed lock
//! coordinator.
//!
//! [`S3Storage`] is the entry point. Provision it once from resolved
//! settings and hand it to the cert manager as its [`CertStorage`] and
//! [`Locker`].
//!
//! [`CertStorage`]: certstash_core::CertStorage
//! [`Locker`]: certstash_core::Locker

pub mod keys;
pub mod lock;
pub mod storage;

pub use keys::{KeyMapper, LOCK_SUFFIX};
pub use lock::{LockCoordinator, LockRecord};
pub use storage::S3Storage;

//! Cache store boundary: async get/set/remove over opaque bytes.
//!
//! The caching layer never owns the store; it only decides *when* to call it.
//! Two pieces live here:
//!
//! - [`CacheStore`]: the trait a backend implements. Single-key operations
//!   are assumed atomic; nothing is assumed across keys. Backends that can
//!   offer optimistic concurrency advertise it through
//!   [`CacheStore::supports_versioning`].
//! - [`StoreHandle`]: the shared, cloneable handle the interceptors use. Every
//!   call through it is bounded by the configured timeout and aborted as soon
//!   as the caller's [`CancellationToken`] fires.
//!
//! Backends: [`memory::MemoryStore`] (in-process) and, with the `redis`
//! feature, `redis::RedisStore`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;

/// Heap-allocated, `Send` future returned across trait-object seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased error from a store backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque optimistic-concurrency token. Changes on every successful write.
pub type Version = u64;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by a store call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),

    #[error("store {op} on `{key}` timed out after {after:?}")]
    Timeout {
        op: &'static str,
        key: String,
        after: Duration,
    },

    #[error("store {op} on `{key}` cancelled by caller")]
    Cancelled { op: &'static str, key: String },

    #[error("store does not support {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }
}

/// Per-entry write options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    /// The entry expires once it has not been read for this long.
    pub sliding_expiration: Duration,
}

impl EntryOptions {
    pub fn sliding(sliding_expiration: Duration) -> Self {
        Self { sliding_expiration }
    }

    /// The sliding window in whole seconds, rounded up and never below 1.
    pub fn ttl_secs(&self) -> u64 {
        let ttl = self.sliding_expiration;
        ttl.as_secs()
            .saturating_add(u64::from(ttl.subsec_nanos() > 0))
            .max(1)
    }
}

/// Result of [`CacheStore::compare_and_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Stored,
    /// Another writer changed (or removed, or created) the entry first.
    Conflict,
}

/// An async key-value store with sliding expiration.
///
/// Reads refresh the sliding window of the entry they hit. Removing an absent
/// key is not an error.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<()>>;

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// Whether [`get_versioned`](Self::get_versioned) and
    /// [`compare_and_set`](Self::compare_and_set) are available.
    fn supports_versioning(&self) -> bool {
        false
    }

    fn get_versioned<'a>(
        &'a self,
        _key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<(Bytes, Version)>>> {
        Box::pin(async { Err(StoreError::Unsupported("get_versioned")) })
    }

    /// Write `value` only if the entry's current version equals `expected`
    /// (`None` meaning "the entry must not exist").
    fn compare_and_set<'a>(
        &'a self,
        _key: &'a str,
        _expected: Option<Version>,
        _value: Bytes,
        _options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>> {
        Box::pin(async { Err(StoreError::Unsupported("compare_and_set")) })
    }
}

/// Shared handle to a [`CacheStore`] with a per-call timeout.
///
/// Every method takes the caller's [`CancellationToken`]; cancellation wins
/// over a concurrently completing store call.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("timeout", &self.timeout)
            .field("versioned", &self.inner.supports_versioning())
            .finish()
    }
}

impl StoreHandle {
    pub fn new(store: Arc<dyn CacheStore>, timeout: Duration) -> Self {
        Self {
            inner: store,
            timeout,
        }
    }

    pub fn supports_versioning(&self) -> bool {
        self.inner.supports_versioning()
    }

    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> StoreResult<Option<Bytes>> {
        self.guard("get", key, cancel, self.inner.get(key)).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        options: EntryOptions,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        self.guard("set", key, cancel, self.inner.set(key, value, options))
            .await
    }

    pub async fn remove(&self, key: &str, cancel: &CancellationToken) -> StoreResult<()> {
        self.guard("remove", key, cancel, self.inner.remove(key)).await
    }

    pub async fn get_versioned(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<(Bytes, Version)>> {
        self.guard("get_versioned", key, cancel, self.inner.get_versioned(key))
            .await
    }

    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Bytes,
        options: EntryOptions,
        cancel: &CancellationToken,
    ) -> StoreResult<CasOutcome> {
        let call = self.inner.compare_and_set(key, expected, value, options);
        self.guard("compare_and_set", key, cancel, call).await
    }

    async fn guard<T>(
        &self,
        op: &'static str,
        key: &str,
        cancel: &CancellationToken,
        call: BoxFuture<'_, StoreResult<T>>,
    ) -> StoreResult<T> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StoreError::Cancelled {
                op,
                key: key.to_owned(),
            }),
            res = tokio::time::timeout(self.timeout, call) => match res {
                Ok(out) => out,
                Err(_) => Err(StoreError::Timeout {
                    op,
                    key: key.to_owned(),
                    after: self.timeout,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Never completes; stands in for an unreachable backend.
    struct Hanging;

    impl CacheStore for Hanging {
        fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
            Box::pin(std::future::pending())
        }

        fn set<'a>(
            &'a self,
            _key: &'a str,
            _value: Bytes,
            _options: EntryOptions,
        ) -> BoxFuture<'a, StoreResult<()>> {
            Box::pin(std::future::pending())
        }

        fn remove<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
            Box::pin(std::future::pending())
        }
    }

    #[test]
    fn ttl_secs_rounds_up() {
        let secs = |ms| EntryOptions::sliding(Duration::from_millis(ms)).ttl_secs();
        assert_eq!(secs(0), 1);
        assert_eq!(secs(200), 1);
        assert_eq!(secs(1000), 1);
        assert_eq!(secs(1900), 2);
        assert_eq!(EntryOptions::sliding(Duration::MAX).ttl_secs(), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let handle = StoreHandle::new(Arc::new(Hanging), Duration::from_millis(50));
        let err = handle.get("k", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { op: "get", .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_call() {
        let handle = StoreHandle::new(Arc::new(Hanging), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = handle
            .set(
                "k",
                Bytes::from_static(b"v"),
                EntryOptions::sliding(Duration::from_secs(1)),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { op: "set", .. }));
    }

    #[tokio::test]
    async fn versioning_unsupported_by_default() {
        let handle = StoreHandle::new(Arc::new(Hanging), Duration::from_secs(1));
        assert!(!handle.supports_versioning());

        let err = handle
            .get_versioned("k", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported("get_versioned")));
    }
}

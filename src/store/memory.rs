//! In-process store with sliding expiration and version tokens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;
use tokio::time::Instant;

use super::{BoxFuture, CacheStore, CasOutcome, EntryOptions, StoreResult, Version};

#[derive(Debug)]
struct Entry {
    value: Bytes,
    sliding: Duration,
    // `None` when the window is too long to represent; the entry never expires.
    expires_at: Option<Instant>,
    version: Version,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn touch(&mut self, now: Instant) {
        self.expires_at = now.checked_add(self.sliding);
    }
}

/// A process-local [`CacheStore`].
///
/// Expired entries are dropped lazily when next touched, or eagerly through
/// [`purge_expired`](Self::purge_expired). Versions come from one counter per
/// store, so a removed-then-recreated key never reuses an old version.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bytes::Bytes;
/// use pipecache::store::{CacheStore, EntryOptions, MemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store
///     .set("k", Bytes::from_static(b"v"), EntryOptions::sliding(Duration::from_secs(60)))
///     .await
///     .unwrap();
/// assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` holds a live entry. Does not refresh its sliding window.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn bump(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read(&self, key: &str) -> Option<(Bytes, Version)> {
        let now = Instant::now();
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        entry.touch(now);
        Some((entry.value.clone(), entry.version))
    }

    fn entry(&self, value: Bytes, options: EntryOptions, now: Instant) -> Entry {
        Entry {
            value,
            sliding: options.sliding_expiration,
            expires_at: now.checked_add(options.sliding_expiration),
            version: self.bump(),
        }
    }

    fn swap(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Bytes,
        options: EntryOptions,
    ) -> CasOutcome {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            Slot::Occupied(mut slot) => {
                let current = Some(slot.get())
                    .filter(|e| !e.is_expired(now))
                    .map(|e| e.version);
                if current != expected {
                    return CasOutcome::Conflict;
                }
                slot.insert(self.entry(value, options, now));
            }
            Slot::Vacant(slot) => {
                if expected.is_some() {
                    return CasOutcome::Conflict;
                }
                slot.insert(self.entry(value, options, now));
            }
        }
        CasOutcome::Stored
    }
}

impl CacheStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
        Box::pin(async move { Ok(self.read(key).map(|(value, _)| value)) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let entry = self.entry(value, options, Instant::now());
            self.entries.insert(key.to_owned(), entry);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    fn get_versioned<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<(Bytes, Version)>>> {
        Box::pin(async move { Ok(self.read(key)) })
    }

    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<Version>,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>> {
        Box::pin(async move { Ok(self.swap(key, expected, value, options)) })
    }
}

//! Test double: a [`MemoryStore`] that counts calls and can be told to fail.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;

use super::{
    BoxFuture, CacheStore, CasOutcome, EntryOptions, MemoryStore, StoreError, StoreResult, Version,
};

#[derive(Debug, Default)]
pub(crate) struct RecordingStore {
    pub inner: MemoryStore,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub removes: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_removes: AtomicBool,
    // Reads never complete, as with an unreachable backend.
    pub hang_reads: AtomicBool,
    // Hides CAS so callers take the plain read-modify-write path.
    pub unversioned: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unversioned() -> Self {
        Self {
            unversioned: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
            + self.writes.load(Ordering::SeqCst)
            + self.removes.load(Ordering::SeqCst)
    }

    fn outage() -> StoreError {
        StoreError::backend("connection refused")
    }
}

impl CacheStore for RecordingStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hang_reads.load(Ordering::SeqCst) {
            return Box::pin(std::future::pending());
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::outage()) });
        }
        self.inner.get(key)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::outage()) });
        }
        self.inner.set(key, value, options)
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.fail_removes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::outage()) });
        }
        self.inner.remove(key)
    }

    fn supports_versioning(&self) -> bool {
        !self.unversioned
    }

    fn get_versioned<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<(Bytes, Version)>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hang_reads.load(Ordering::SeqCst) {
            return Box::pin(std::future::pending());
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::outage()) });
        }
        self.inner.get_versioned(key)
    }

    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<Version>,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::outage()) });
        }
        self.inner.compare_and_set(key, expected, value, options)
    }
}

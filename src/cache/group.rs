//! Group registry: which cache keys belong to which invalidation group.
//!
//! A group `G` is two ordinary store entries:
//!
//! | Key                          | Value                                      |
//! |------------------------------|--------------------------------------------|
//! | `G`                          | JSON array of member cache keys            |
//! | `G:sliding-expiration`       | JSON integer, largest member TTL (seconds) |
//!
//! Both entries are written with the group's largest sliding expiration as
//! their own TTL, so the bookkeeping outlives its longest-lived member.
//!
//! # Concurrency
//!
//! Registration is a read-modify-write over two keys. When the store supports
//! versioning each key is updated with compare-and-set and retried on conflict,
//! so concurrent registrations never drop each other's members. Without
//! versioning two concurrent registrations can read the same membership set
//! and the later write wins, losing the other member. The lost member's entry
//! then survives the next group invalidation and is served until its own TTL
//! lapses. No lock is taken to prevent this.
//!
//! Invalidation snapshots the membership set before removing anything. A
//! member registered after the snapshot is not removed by that invalidation.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{CasOutcome, EntryOptions, StoreError, StoreHandle, Version};

/// Suffix appended to a group key to form its max-expiration key.
pub const EXPIRATION_SUFFIX: &str = ":sliding-expiration";

/// Compare-and-set attempts per key before giving up.
pub const MAX_CAS_ATTEMPTS: usize = 8;

/// Errors produced by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt group bookkeeping at `{key}`: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("gave up updating `{key}` after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },
}

/// Group state after a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub members: BTreeSet<String>,
    pub max_expiration_secs: u64,
}

/// What a group invalidation actually touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Keys successfully removed, members first, then bookkeeping.
    pub removed: Vec<String>,
    /// Keys whose removal failed.
    pub failed: Vec<String>,
}

impl InvalidationReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Maintains invalidation groups on top of a shared store.
///
/// Holds no state of its own; cloning is cheap.
#[derive(Debug, Clone)]
pub struct GroupRegistry {
    store: StoreHandle,
}

/// Key holding the max sliding expiration of `group`.
pub fn expiration_key(group: &str) -> String {
    format!("{group}{EXPIRATION_SUFFIX}")
}

fn secs(ttl: Duration) -> u64 {
    EntryOptions::sliding(ttl).ttl_secs()
}

impl GroupRegistry {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Add `member` to `group` and raise the group's max expiration to
    /// `requested` if it is longer.
    pub async fn register_member(
        &self,
        group: &str,
        member: &str,
        requested: Duration,
        cancel: &CancellationToken,
    ) -> Result<Registration, RegistryError> {
        let registration = if self.store.supports_versioning() {
            self.register_versioned(group, member, secs(requested), cancel)
                .await?
        } else {
            self.register_unversioned(group, member, secs(requested), cancel)
                .await?
        };

        info!(
            group = %group,
            key = %member,
            members = registration.members.len(),
            max_expiration_secs = registration.max_expiration_secs,
            "cache group updated"
        );
        Ok(registration)
    }

    async fn register_versioned(
        &self,
        group: &str,
        member: &str,
        requested: u64,
        cancel: &CancellationToken,
    ) -> Result<Registration, RegistryError> {
        let exp_key = expiration_key(group);

        let mut max = None;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get_versioned(&exp_key, cancel).await?;
            let (prior, version) = split(current);
            let candidate = decode_expiration(&exp_key, prior.as_ref())
                .map_or(requested, |cur| cur.max(requested));

            if self
                .try_write(&exp_key, version, encode(&candidate)?, candidate, cancel)
                .await?
            {
                max = Some(candidate);
                break;
            }
            debug!(key = %exp_key, attempt, "cache group expiration write conflicted, retrying");
        }
        let max = max.ok_or_else(|| RegistryError::Contention {
            key: exp_key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get_versioned(group, cancel).await?;
            let (prior, version) = split(current);
            let mut members = decode_members(group, prior.as_ref());
            members.insert(member.to_owned());

            if self
                .try_write(group, version, encode(&members)?, max, cancel)
                .await?
            {
                return Ok(Registration {
                    members,
                    max_expiration_secs: max,
                });
            }
            debug!(group = %group, attempt, "cache group membership write conflicted, retrying");
        }

        Err(RegistryError::Contention {
            key: group.to_owned(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn try_write(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Bytes,
        ttl_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, RegistryError> {
        let options = EntryOptions::sliding(Duration::from_secs(ttl_secs));
        let outcome = self
            .store
            .compare_and_set(key, expected, value, options, cancel)
            .await?;
        Ok(outcome == CasOutcome::Stored)
    }

    // Plain read-modify-write; see the module docs for the lost-update window.
    async fn register_unversioned(
        &self,
        group: &str,
        member: &str,
        requested: u64,
        cancel: &CancellationToken,
    ) -> Result<Registration, RegistryError> {
        let exp_key = expiration_key(group);

        let prior = self.store.get(group, cancel).await?;
        let mut members = decode_members(group, prior.as_ref());
        members.insert(member.to_owned());

        let prior = self.store.get(&exp_key, cancel).await?;
        let max = decode_expiration(&exp_key, prior.as_ref())
            .map_or(requested, |cur| cur.max(requested));

        let options = EntryOptions::sliding(Duration::from_secs(max));
        self.store
            .set(group, encode(&members)?, options, cancel)
            .await?;
        self.store
            .set(&exp_key, encode(&max)?, options, cancel)
            .await?;

        Ok(Registration {
            members,
            max_expiration_secs: max,
        })
    }

    /// Remove every member of `group`, then the group's bookkeeping entries.
    ///
    /// Best effort: a failed removal is logged and recorded in the report but
    /// does not stop the remaining removals. An absent group is a no-op.
    pub async fn invalidate_group(
        &self,
        group: &str,
        cancel: &CancellationToken,
    ) -> InvalidationReport {
        let mut report = InvalidationReport::default();

        let members = match self.store.get(group, cancel).await {
            Ok(Some(raw)) => match serde_json::from_slice::<BTreeSet<String>>(&raw) {
                Ok(members) => members,
                Err(e) => {
                    error!(group = %group, error = %e, "corrupt cache group, dropping bookkeeping only");
                    BTreeSet::new()
                }
            },
            Ok(None) => {
                debug!(group = %group, "cache group absent, nothing to invalidate");
                return report;
            }
            Err(e) => {
                warn!(group = %group, error = %e, "failed to read cache group, skipping invalidation");
                report.failed.push(group.to_owned());
                return report;
            }
        };

        for key in &members {
            self.remove_logged(key, cancel, &mut report).await;
        }
        self.remove_logged(group, cancel, &mut report).await;
        self.remove_logged(&expiration_key(group), cancel, &mut report)
            .await;

        report
    }

    async fn remove_logged(
        &self,
        key: &str,
        cancel: &CancellationToken,
        report: &mut InvalidationReport,
    ) {
        match self.store.remove(key, cancel).await {
            Ok(()) => {
                info!(key = %key, "removed from cache");
                report.removed.push(key.to_owned());
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to remove cache entry");
                report.failed.push(key.to_owned());
            }
        }
    }

    /// Current members of `group`, or `None` if the group does not exist.
    pub async fn members(
        &self,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<BTreeSet<String>>, RegistryError> {
        match self.store.get(group, cancel).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| RegistryError::Codec {
                    key: group.to_owned(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Current max sliding expiration of `group`, in seconds.
    pub async fn max_expiration(
        &self,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, RegistryError> {
        let key = expiration_key(group);
        match self.store.get(&key, cancel).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| RegistryError::Codec { key, source }),
            None => Ok(None),
        }
    }
}

fn split(current: Option<(Bytes, Version)>) -> (Option<Bytes>, Option<Version>) {
    match current {
        Some((raw, version)) => (Some(raw), Some(version)),
        None => (None, None),
    }
}

// Corrupt bookkeeping is overwritten rather than propagated; the group simply
// restarts from this member.
fn decode_members(group: &str, raw: Option<&Bytes>) -> BTreeSet<String> {
    let Some(raw) = raw else {
        return BTreeSet::new();
    };
    serde_json::from_slice(raw).unwrap_or_else(|e| {
        warn!(group = %group, error = %e, "corrupt cache group membership, resetting");
        BTreeSet::new()
    })
}

fn decode_expiration(key: &str, raw: Option<&Bytes>) -> Option<u64> {
    let raw = raw?;
    serde_json::from_slice(raw)
        .map_err(|e| warn!(key = %key, error = %e, "corrupt cache group expiration, resetting"))
        .ok()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes, RegistryError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| RegistryError::Codec {
            key: String::new(),
            source,
        })
}

//! Request types and the two optional caching capabilities.
//!
//! A [`Request`] describes one operation sent through the pipeline. Whether it
//! participates in caching is declared by two independent capabilities:
//!
//! | Capability                                  | Declared by                     | Interceptor                  |
//! |---------------------------------------------|---------------------------------|------------------------------|
//! | read-cacheable                              | [`Request::cache_policy`]       | `CachingMiddleware`          |
//! | write-invalidating                          | [`Request::invalidation`]       | `CacheRemovingMiddleware`    |
//!
//! A request may declare either, both, or neither. Both policies use the
//! multi-group form: a list of group keys, possibly empty.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

/// An operation that can be sent through the pipeline.
///
/// The request itself must be serializable so the logging layer can record
/// it; the response must round-trip through JSON so the caching layer can
/// store and replay it.
///
/// # Examples
///
/// ```
/// use pipecache::request::{CachePolicy, Request};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct GetProducts {
///     page: u32,
/// }
///
/// impl Request for GetProducts {
///     type Response = Vec<String>;
///
///     fn cache_policy(&self) -> Option<CachePolicy> {
///         Some(CachePolicy::new(format!("GetProducts({})", self.page)).group("GetProducts"))
///     }
/// }
/// ```
pub trait Request: Serialize + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Name recorded by the logging layer. Defaults to the unqualified type
    /// name with any generic arguments dropped (`Page<a::B>` becomes `Page`).
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Read-cacheable capability. `None` means results are never cached.
    fn cache_policy(&self) -> Option<CachePolicy> {
        None
    }

    /// Write-invalidating capability. `None` means the request never
    /// removes cache entries.
    fn invalidation(&self) -> Option<InvalidationPolicy> {
        None
    }
}

/// How a read request's result is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Skip the cache entirely: no read, no write.
    pub bypass_cache: bool,
    /// Caller-computed key, unique per distinct query shape and parameters.
    pub cache_key: String,
    /// Invalidation groups this entry joins once populated.
    pub group_keys: Vec<String>,
    /// Sliding TTL; `None` falls back to the configured default.
    pub sliding_expiration: Option<Duration>,
}

impl CachePolicy {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            bypass_cache: false,
            cache_key: cache_key.into(),
            group_keys: Vec::new(),
            sliding_expiration: None,
        }
    }

    /// Adds an invalidation group.
    #[must_use]
    pub fn group(mut self, group_key: impl Into<String>) -> Self {
        self.group_keys.push(group_key.into());
        self
    }

    #[must_use]
    pub fn sliding_expiration(mut self, ttl: Duration) -> Self {
        self.sliding_expiration = Some(ttl);
        self
    }

    #[must_use]
    pub fn bypass(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }
}

/// Which cache entries a write request drops once it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPolicy {
    /// Leave the cache untouched, even though the write runs.
    pub bypass_cache: bool,
    /// A single specific entry to remove.
    pub cache_key: Option<String>,
    /// Groups to invalidate in full, in order.
    pub group_keys: Vec<String>,
}

impl InvalidationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group to invalidate.
    #[must_use]
    pub fn group(mut self, group_key: impl Into<String>) -> Self {
        self.group_keys.push(group_key.into());
        self
    }

    /// Also remove one specific key.
    #[must_use]
    pub fn key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    #[must_use]
    pub fn bypass(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }
}

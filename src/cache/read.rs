//! Cache-read interceptor: cache-aside around read requests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::group::GroupRegistry;
use crate::config::CacheSettings;
use crate::context::Context;
use crate::middleware::{BoxFuture, Middleware, Next, PipelineResult};
use crate::request::{CachePolicy, Request};
use crate::store::{EntryOptions, StoreHandle};

/// Serves cacheable requests from the store and populates it on a miss.
///
/// # Behavior
///
/// - Requests without a [`CachePolicy`], with `bypass_cache` set, or with an
///   empty key pass straight through; the store is not touched.
/// - **Hit**: the stored JSON is decoded into the response type and returned.
///   The downstream chain is **not** called.
/// - **Miss**: the chain runs, its response is stored under the request's
///   key with its sliding expiration (or the configured default), and the key
///   is registered with each of the request's groups.
///
/// Store failures on the read side count as a miss. Failures while writing
/// back are logged and swallowed: the computed response is always returned,
/// even if the caller cancels mid write-back.
#[derive(Debug, Clone)]
pub struct CachingMiddleware {
    store: StoreHandle,
    registry: GroupRegistry,
    default_sliding_expiration: Duration,
}

impl CachingMiddleware {
    pub fn new(store: StoreHandle, settings: &CacheSettings) -> Self {
        Self {
            registry: GroupRegistry::new(store.clone()),
            store,
            default_sliding_expiration: settings.default_sliding_expiration(),
        }
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    async fn execute<R: Request>(
        self,
        request: Arc<R>,
        ctx: Context,
        next: Next<R>,
    ) -> PipelineResult<R::Response> {
        let Some(policy) = request.cache_policy() else {
            return next.run(request, ctx).await;
        };
        if policy.bypass_cache {
            debug!(key = %policy.cache_key, "cache bypassed");
            return next.run(request, ctx).await;
        }
        if policy.cache_key.is_empty() {
            warn!(request = request.name(), "empty cache key, not caching");
            return next.run(request, ctx).await;
        }

        if let Some(hit) = self.lookup::<R::Response>(&policy.cache_key, &ctx).await {
            info!(key = %policy.cache_key, "fetched from cache");
            return Ok(hit);
        }

        let response = next.run(request, ctx.clone()).await?;
        match serde_json::to_vec(&response) {
            Ok(payload) => self.populate(&policy, Bytes::from(payload), &ctx).await,
            Err(e) => {
                error!(key = %policy.cache_key, error = %e, "failed to serialize response, not caching");
            }
        }
        Ok(response)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, ctx: &Context) -> Option<T> {
        let raw = match self.store.get(key, ctx.cancellation()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key = %key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, falling back to handler");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "cached payload unreadable, treating as miss");
                None
            }
        }
    }

    async fn populate(&self, policy: &CachePolicy, payload: Bytes, ctx: &Context) {
        let key = policy.cache_key.as_str();
        let ttl = policy
            .sliding_expiration
            .unwrap_or(self.default_sliding_expiration);

        let cancel = ctx.cancellation();
        if let Err(e) = self
            .store
            .set(key, payload, EntryOptions::sliding(ttl), cancel)
            .await
        {
            warn!(key = %key, error = %e, "cache write failed");
            return;
        }
        info!(key = %key, ttl_secs = ttl.as_secs(), "added to cache");

        for group in &policy.group_keys {
            if let Err(e) = self.registry.register_member(group, key, ttl, cancel).await {
                warn!(group = %group, key = %key, error = %e, "failed to register cache key with group");
            }
        }
    }
}

impl<R: Request> Middleware<R> for CachingMiddleware {
    fn handle(
        &self,
        request: Arc<R>,
        ctx: Context,
        next: Next<R>,
    ) -> BoxFuture<'static, PipelineResult<R::Response>> {
        Box::pin(self.clone().execute(request, ctx, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{BoxError, PipelineError, RequestHandler};
    use crate::store::testing::RecordingStore;
    use crate::store::CacheStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: u32,
        name: String,
    }

    #[derive(Serialize)]
    struct GetProducts {
        page: u32,
        bypass: bool,
        ttl: Option<Duration>,
    }

    impl GetProducts {
        fn page(page: u32) -> Self {
            Self {
                page,
                bypass: false,
                ttl: None,
            }
        }
    }

    impl Request for GetProducts {
        type Response = Vec<Product>;

        fn cache_policy(&self) -> Option<CachePolicy> {
            let mut policy = CachePolicy::new(format!("products(page={})", self.page))
                .group("GetProducts")
                .bypass(self.bypass);
            policy.sliding_expiration = self.ttl;
            Some(policy)
        }
    }

    struct Harness {
        store: Arc<RecordingStore>,
        caching: CachingMiddleware,
        calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_store(RecordingStore::new())
        }

        fn with_store(store: RecordingStore) -> Self {
            Self::with_settings(store, CacheSettings::new(600))
        }

        fn with_settings(store: RecordingStore, settings: CacheSettings) -> Self {
            let store = Arc::new(store);
            let handle = StoreHandle::new(store.clone(), Duration::from_secs(1));
            Self {
                caching: CachingMiddleware::new(handle, &settings),
                store,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn handler(&self) -> Arc<dyn RequestHandler<GetProducts>> {
            let calls = self.calls.clone();
            Arc::new(move |req: Arc<GetProducts>, _ctx: Context| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(vec![Product {
                        id: req.page,
                        name: format!("product-{}", req.page),
                    }])
                }
            })
        }

        async fn send(&self, req: GetProducts, ctx: Context) -> PipelineResult<Vec<Product>> {
            let chain: Vec<Arc<dyn Middleware<GetProducts>>> =
                vec![Arc::new(self.caching.clone())];
            Next::new(chain, self.handler()).run(Arc::new(req), ctx).await
        }

        fn handler_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn bypass_never_touches_store() {
        let h = Harness::new();
        for _ in 0..2 {
            let req = GetProducts {
                bypass: true,
                ..GetProducts::page(1)
            };
            h.send(req, Context::new()).await.unwrap();
        }

        assert_eq!(h.handler_calls(), 2);
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let h = Harness::new();

        let first = h.send(GetProducts::page(1), Context::new()).await.unwrap();
        let second = h.send(GetProducts::page(1), Context::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.handler_calls(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_miss_independently() {
        let h = Harness::new();
        h.send(GetProducts::page(1), Context::new()).await.unwrap();
        h.send(GetProducts::page(2), Context::new()).await.unwrap();
        assert_eq!(h.handler_calls(), 2);
    }

    #[tokio::test]
    async fn miss_registers_key_with_group() {
        let h = Harness::new();
        let cancel = CancellationToken::new();

        h.send(GetProducts::page(1), Context::new()).await.unwrap();

        let members = h
            .caching
            .registry()
            .members("GetProducts", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(members.contains("products(page=1)"));
        assert_eq!(
            h.caching.registry().max_expiration("GetProducts", &cancel).await.unwrap(),
            Some(600)
        );
    }

    #[tokio::test]
    async fn request_expiration_overrides_default() {
        let h = Harness::new();
        let req = GetProducts {
            ttl: Some(Duration::from_secs(30)),
            ..GetProducts::page(1)
        };
        h.send(req, Context::new()).await.unwrap();

        let max = h
            .caching
            .registry()
            .max_expiration("GetProducts", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(max, Some(30));
    }

    #[tokio::test]
    async fn read_outage_falls_back_to_handler() {
        let h = Harness::new();
        h.store.fail_reads.store(true, Ordering::SeqCst);

        let out = h.send(GetProducts::page(3), Context::new()).await.unwrap();

        assert_eq!(out[0].id, 3);
        assert_eq!(h.handler_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_falls_back_to_handler() {
        let h = Harness::new();
        h.store.hang_reads.store(true, Ordering::SeqCst);

        let out = h.send(GetProducts::page(6), Context::new()).await.unwrap();

        assert_eq!(out[0].id, 6);
        assert_eq!(h.handler_calls(), 1);
        assert!(h.store.inner.contains("products(page=6)"));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_default_expiration_is_cached() {
        let h = Harness::with_settings(RecordingStore::new(), CacheSettings::new(u64::MAX));

        h.send(GetProducts::page(1), Context::new()).await.unwrap();
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        h.send(GetProducts::page(1), Context::new()).await.unwrap();

        assert_eq!(h.handler_calls(), 1);
        assert_eq!(
            h.caching
                .registry()
                .max_expiration("GetProducts", &CancellationToken::new())
                .await
                .unwrap(),
            Some(u64::MAX)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_expiration_keeps_group_alive_as_long_as_member() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let req = GetProducts {
            ttl: Some(Duration::from_millis(1900)),
            ..GetProducts::page(1)
        };
        h.send(req, Context::new()).await.unwrap();

        tokio::time::advance(Duration::from_millis(1200)).await;

        assert!(h.store.inner.contains("products(page=1)"));
        assert!(h.store.inner.contains("GetProducts"));
        assert_eq!(
            h.caching.registry().max_expiration("GetProducts", &cancel).await.unwrap(),
            Some(2)
        );

        h.caching.registry().invalidate_group("GetProducts", &cancel).await;
        assert!(!h.store.inner.contains("products(page=1)"));
    }

    #[tokio::test]
    async fn write_outage_still_returns_response() {
        let h = Harness::new();
        h.store.fail_writes.store(true, Ordering::SeqCst);

        let out = h.send(GetProducts::page(4), Context::new()).await.unwrap();

        assert_eq!(out[0].id, 4);
        assert!(h.store.inner.is_empty());
    }

    #[tokio::test]
    async fn corrupt_payload_is_a_miss() {
        let h = Harness::new();
        h.store
            .inner
            .set(
                "products(page=1)",
                Bytes::from_static(b"{not json"),
                EntryOptions::sliding(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let out = h.send(GetProducts::page(1), Context::new()).await.unwrap();

        assert_eq!(out[0].id, 1);
        assert_eq!(h.handler_calls(), 1);
        // Overwritten with a good payload.
        h.send(GetProducts::page(1), Context::new()).await.unwrap();
        assert_eq!(h.handler_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_caller_still_gets_response() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = h
            .send(GetProducts::page(5), Context::new().with_cancellation(cancel))
            .await
            .unwrap();

        assert_eq!(out[0].id, 5);
        assert!(h.store.inner.is_empty());
    }

    #[tokio::test]
    async fn handler_failure_is_not_cached() {
        let h = Harness::new();
        let failing: Arc<dyn RequestHandler<GetProducts>> =
            Arc::new(|_req: Arc<GetProducts>, _ctx: Context| async {
                Err::<Vec<Product>, _>("database down")
            });
        let chain: Vec<Arc<dyn Middleware<GetProducts>>> = vec![Arc::new(h.caching.clone())];

        let err = Next::new(chain, failing)
            .run(Arc::new(GetProducts::page(1)), Context::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Handler(_)));
        assert!(h.store.inner.is_empty());
    }

    #[tokio::test]
    async fn unversioned_store_populates_group() {
        let h = Harness::with_store(RecordingStore::unversioned());
        h.send(GetProducts::page(1), Context::new()).await.unwrap();
        h.send(GetProducts::page(2), Context::new()).await.unwrap();

        let members = h
            .caching
            .registry()
            .members("GetProducts", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(members.len(), 2);
    }
}

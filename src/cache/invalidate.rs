//! Cache-invalidation interceptor: drops cache entries after a write succeeds.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::group::GroupRegistry;
use crate::context::Context;
use crate::middleware::{BoxFuture, Middleware, Next, PipelineResult};
use crate::request::Request;
use crate::store::StoreHandle;

/// Removes cache entries declared by a request's [`InvalidationPolicy`] once
/// the downstream chain has succeeded.
///
/// # Behavior
///
/// - No policy, or `bypass_cache` set: the chain runs and the cache is left
///   alone.
/// - The chain runs **first**. If it fails, the error propagates and nothing
///   is removed.
/// - Each listed group is invalidated in order (members, then bookkeeping),
///   then the single `cache_key`, if any, is removed.
///
/// Removal is best effort: failures are logged and never change the
/// response returned to the caller.
///
/// [`InvalidationPolicy`]: crate::request::InvalidationPolicy
#[derive(Debug, Clone)]
pub struct CacheRemovingMiddleware {
    store: StoreHandle,
    registry: GroupRegistry,
}

impl CacheRemovingMiddleware {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            registry: GroupRegistry::new(store.clone()),
            store,
        }
    }

    async fn execute<R: Request>(
        self,
        request: Arc<R>,
        ctx: Context,
        next: Next<R>,
    ) -> PipelineResult<R::Response> {
        let Some(policy) = request.invalidation() else {
            return next.run(request, ctx).await;
        };
        if policy.bypass_cache {
            debug!(request = request.name(), "cache invalidation bypassed");
            return next.run(request, ctx).await;
        }

        let response = next.run(request, ctx.clone()).await?;

        let cancel = ctx.cancellation();
        for group in &policy.group_keys {
            let report = self.registry.invalidate_group(group, cancel).await;
            if !report.failed.is_empty() {
                warn!(group = %group, failed = report.failed.len(), "cache group only partially invalidated");
            }
        }

        if let Some(key) = &policy.cache_key {
            match self.store.remove(key, cancel).await {
                Ok(()) => info!(key = %key, "removed from cache"),
                Err(e) => warn!(key = %key, error = %e, "failed to remove cache entry"),
            }
        }

        Ok(response)
    }
}

impl<R: Request> Middleware<R> for CacheRemovingMiddleware {
    fn handle(
        &self,
        request: Arc<R>,
        ctx: Context,
        next: Next<R>,
    ) -> BoxFuture<'static, PipelineResult<R::Response>> {
        Box::pin(self.clone().execute(request, ctx, next))
    }
}

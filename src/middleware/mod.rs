//! Middleware pipeline: composable before/after logic around a request handler.
//!
//! This module defines the core types for building an ordered middleware stack
//! over any [`Request`] type. Each middleware wraps the next layer, so it can
//! inspect the request, short-circuit with its own response, or act on the
//! response after the handler has run.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`RequestHandler`]: the terminal handler, usually an async closure.
//! - [`LoggerMiddleware`]: built-in invocation logger.
//!
//! The caching interceptors in [`crate::cache`] are middleware too.

use std::{future::Future, sync::Arc};

use thiserror::Error;
use tokio::time::Instant;

use crate::{context::Context, request::Request};

pub use crate::store::{BoxError, BoxFuture};

/// Errors surfaced to the caller of a pipeline.
///
/// Caching failures never appear here; only the handler's own failure or a
/// missing handler does.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no handler registered for `{request}`")]
    NoHandler { request: &'static str },

    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// The terminal step of a pipeline.
///
/// Any `Fn(Arc<R>, Context) -> impl Future<Output = Result<R::Response, E>>`
/// that is `Send + Sync + 'static` implements this trait through the blanket
/// impl below.
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    fn handle(
        &self,
        request: Arc<R>,
        ctx: Context,
    ) -> BoxFuture<'static, Result<R::Response, BoxError>>;
}

impl<R, T, F, E> RequestHandler<R> for T
where
    R: Request,
    T: Fn(Arc<R>, Context) -> F + Send + Sync + 'static,
    F: Future<Output = Result<R::Response, E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn handle(
        &self,
        request: Arc<R>,
        ctx: Context,
    ) -> BoxFuture<'static, Result<R::Response, BoxError>> {
        let fut = (self)(request, ctx);
        Box::pin(async move { fut.await.map_err(Into::into) })
    }
}

/// A cursor into the remaining middleware chain for a single invocation.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next<R: Request> {
    middlewares: Vec<Arc<dyn Middleware<R>>>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    handler: Arc<dyn RequestHandler<R>>,
}

impl<R: Request> Next<R> {
    /// Creates a cursor positioned at the start of `middlewares`, ending in `handler`.
    pub fn new(
        middlewares: Vec<Arc<dyn Middleware<R>>>,
        handler: Arc<dyn RequestHandler<R>>,
    ) -> Self {
        Self {
            middlewares,
            index: 0,
            handler,
        }
    }

    /// Invokes the next middleware, or the handler once the chain is exhausted.
    pub async fn run(mut self, request: Arc<R>, ctx: Context) -> PipelineResult<R::Response> {
        if self.index < self.middlewares.len() {
            let middleware = self.middlewares[self.index].clone();
            self.index += 1;
            middleware.handle(request, ctx, self).await
        } else {
            self.handler
                .handle(request, ctx)
                .await
                .map_err(PipelineError::Handler)
        }
    }
}

/// The core trait for all pipeline middleware.
///
/// Implementors receive the request, its [`Context`] and a [`Next`] cursor.
/// They may:
///
/// - **Pass through**: `next.run(request, ctx).await` without modification.
/// - **Short-circuit**: return a response without calling `next`.
/// - **Decorate**: call `next`, then act on the result before returning it.
///
/// # Contract
///
/// - Middleware is shared across Tokio tasks, so it must be `Send + Sync`.
/// - `handle` returns a `'static` future; clone whatever shared state the
///   future needs instead of borrowing `self`.
pub trait Middleware<R: Request>: Send + Sync {
    fn handle(
        &self,
        request: Arc<R>,
        ctx: Context,
        next: Next<R>,
    ) -> BoxFuture<'static, PipelineResult<R::Response>>;
}

/// Built-in middleware that logs each invocation.
///
/// Emits one `tracing::info!` event before the downstream chain runs, carrying
/// the request name, the serialized request and the acting user (`"?"` when
/// anonymous), and one after it completes with the elapsed time.
pub struct LoggerMiddleware;

impl<R: Request> Middleware<R> for LoggerMiddleware {
    fn handle(
        &self,
        request: Arc<R>,
        ctx: Context,
        next: Next<R>,
    ) -> BoxFuture<'static, PipelineResult<R::Response>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.name();
            let user = ctx.user().unwrap_or("?").to_owned();
            let payload = serde_json::to_string(request.as_ref())
                .unwrap_or_else(|e| format!("<unserializable: {e}>"));

            tracing::info!(method, user = %user, request = %payload, "handling request");

            let result = next.run(request, ctx).await;

            let duration = start.elapsed();
            match &result {
                Ok(_) => tracing::info!(method, ?duration, "request handled"),
                Err(e) => tracing::warn!(method, ?duration, error = %e, "request failed"),
            }

            result
        })
    }
}

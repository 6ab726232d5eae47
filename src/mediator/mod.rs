//! Request dispatch: one handler per request type, wrapped in the pipeline
//! its capabilities call for.
//!
//! [`Mediator::send`] builds the chain per call from what the request
//! declares:
//!
//! | Layer                        | Installed when                                       |
//! |------------------------------|------------------------------------------------------|
//! | [`LoggerMiddleware`]         | logging enabled on the builder                       |
//! | [`CachingMiddleware`]        | caching configured and `cache_policy()` is `Some`    |
//! | [`CacheRemovingMiddleware`]  | caching configured and `invalidation()` is `Some`    |
//! | handler                      | always                                               |
//!
//! A request declaring both capabilities gets the read layer outside the
//! invalidation layer: a cache hit short-circuits before any write runs.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipecache::{CacheSettings, Context, MemoryStore, Mediator, Request};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Ping;
//!
//! impl Request for Ping {
//!     type Response = String;
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CacheSettings::load()?;
//! let mut mediator = Mediator::builder()
//!     .logging(true)
//!     .caching(Arc::new(MemoryStore::new()), &settings)
//!     .build();
//!
//! mediator.register(|_req: Arc<Ping>, _ctx: Context| async {
//!     Ok::<_, std::io::Error>("pong".to_owned())
//! });
//!
//! let pong = mediator.send(Ping, Context::new()).await?;
//! assert_eq!(pong, "pong");
//! # Ok(())
//! # }
//! ```

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    future::Future,
    sync::Arc,
};

use crate::cache::{CacheRemovingMiddleware, CachingMiddleware};
use crate::config::CacheSettings;
use crate::context::Context;
use crate::middleware::{
    BoxError, LoggerMiddleware, Middleware, Next, PipelineError, PipelineResult, RequestHandler,
};
use crate::request::Request;
use crate::store::{CacheStore, StoreHandle};

/// Type-erased handler map, one entry per request type.
#[derive(Default)]
struct Handlers {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Handlers {
    fn insert<R: Request>(&mut self, handler: Arc<dyn RequestHandler<R>>) {
        self.map.insert(TypeId::of::<R>(), Box::new(handler));
    }

    fn get<R: Request>(&self) -> Option<Arc<dyn RequestHandler<R>>> {
        self.map
            .get(&TypeId::of::<R>())
            .and_then(|value| value.downcast_ref::<Arc<dyn RequestHandler<R>>>())
            .cloned()
    }
}

/// Configures which shared layers a [`Mediator`] installs.
#[derive(Default)]
pub struct MediatorBuilder {
    logging: bool,
    caching: Option<(CachingMiddleware, CacheRemovingMiddleware)>,
}

impl MediatorBuilder {
    /// Log every invocation through [`LoggerMiddleware`].
    #[must_use]
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Install both caching interceptors over `store`.
    #[must_use]
    pub fn caching(self, store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        self.caching_with(StoreHandle::new(store, settings.store_timeout()), settings)
    }

    /// Like [`caching`](Self::caching), reusing an existing handle.
    #[must_use]
    pub fn caching_with(mut self, store: StoreHandle, settings: &CacheSettings) -> Self {
        self.caching = Some((
            CachingMiddleware::new(store.clone(), settings),
            CacheRemovingMiddleware::new(store),
        ));
        self
    }

    pub fn build(self) -> Mediator {
        let (caching, invalidation) = match self.caching {
            Some((read, remove)) => (Some(Arc::new(read)), Some(Arc::new(remove))),
            None => (None, None),
        };
        Mediator {
            handlers: Handlers::default(),
            logger: self.logging.then(|| Arc::new(LoggerMiddleware)),
            caching,
            invalidation,
        }
    }
}

/// Dispatches requests to their handlers through the caching pipeline.
pub struct Mediator {
    handlers: Handlers,
    logger: Option<Arc<LoggerMiddleware>>,
    caching: Option<Arc<CachingMiddleware>>,
    invalidation: Option<Arc<CacheRemovingMiddleware>>,
}

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::default()
    }

    /// Registers an async closure as the handler for request type `R`,
    /// replacing any previous one.
    pub fn register<R, F, Fut, E>(&mut self, handler: F)
    where
        R: Request,
        F: Fn(Arc<R>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.handlers.insert::<R>(Arc::new(handler));
    }

    /// Registers a [`RequestHandler`] implementation for request type `R`.
    pub fn register_handler<R: Request>(&mut self, handler: Arc<dyn RequestHandler<R>>) {
        self.handlers.insert::<R>(handler);
    }

    pub fn has_handler<R: Request>(&self) -> bool {
        self.handlers.map.contains_key(&TypeId::of::<R>())
    }

    /// The cache-read layer, if caching is configured.
    pub fn caching(&self) -> Option<&CachingMiddleware> {
        self.caching.as_deref()
    }

    /// Sends `request` through its pipeline and returns the handler's response.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NoHandler`] if nothing is registered for `R`;
    /// [`PipelineError::Handler`] if the handler fails. Cache failures are
    /// never reported here.
    pub async fn send<R: Request>(&self, request: R, ctx: Context) -> PipelineResult<R::Response> {
        let handler = self.handlers.get::<R>().ok_or(PipelineError::NoHandler {
            request: std::any::type_name::<R>(),
        })?;

        let chain = self.chain_for(&request);
        Next::new(chain, handler).run(Arc::new(request), ctx).await
    }

    fn chain_for<R: Request>(&self, request: &R) -> Vec<Arc<dyn Middleware<R>>> {
        let mut chain: Vec<Arc<dyn Middleware<R>>> = Vec::with_capacity(3);
        if let Some(logger) = &self.logger {
            chain.push(logger.clone());
        }
        if let Some(caching) = self.caching.as_ref().filter(|_| request.cache_policy().is_some()) {
            chain.push(caching.clone());
        }
        if let Some(invalidation) = self
            .invalidation
            .as_ref()
            .filter(|_| request.invalidation().is_some())
        {
            chain.push(invalidation.clone());
        }
        chain
    }
}

//! # pipecache
//!
//! Request-result caching for async request pipelines: cache-aside reads,
//! grouped invalidation on writes, and sliding expiration, over any shared
//! key-value store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipecache::{
//!     CachePolicy, CacheSettings, Context, InvalidationPolicy, Mediator, MemoryStore, Request,
//! };
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct GetProducts { page: u32 }
//!
//! impl Request for GetProducts {
//!     type Response = Vec<String>;
//!
//!     fn cache_policy(&self) -> Option<CachePolicy> {
//!         Some(CachePolicy::new(format!("GetProducts({})", self.page)).group("GetProducts"))
//!     }
//! }
//!
//! #[derive(Serialize)]
//! struct CreateProduct { name: String }
//!
//! impl Request for CreateProduct {
//!     type Response = ();
//!
//!     fn invalidation(&self) -> Option<InvalidationPolicy> {
//!         Some(InvalidationPolicy::new().group("GetProducts"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = CacheSettings::load()?;
//!     let mut mediator = Mediator::builder()
//!         .logging(true)
//!         .caching(Arc::new(MemoryStore::new()), &settings)
//!         .build();
//!
//!     mediator.register(|req: Arc<GetProducts>, _ctx: Context| async move {
//!         Ok::<_, std::io::Error>(vec![format!("page {}", req.page)])
//!     });
//!     mediator.register(|_req: Arc<CreateProduct>, _ctx: Context| async {
//!         Ok::<_, std::io::Error>(())
//!     });
//!
//!     // Miss, then hit.
//!     mediator.send(GetProducts { page: 1 }, Context::new()).await?;
//!     mediator.send(GetProducts { page: 1 }, Context::new()).await?;
//!
//!     // Drops every entry registered under "GetProducts".
//!     mediator.send(CreateProduct { name: "Desk".into() }, Context::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod mediator;
pub mod middleware;
pub mod request;
pub mod store;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheRemovingMiddleware, CachingMiddleware, GroupRegistry};
pub use config::{CacheSettings, ConfigError};
pub use context::Context;
pub use mediator::{Mediator, MediatorBuilder};
pub use middleware::{LoggerMiddleware, Middleware, Next, PipelineError, RequestHandler};
pub use request::{CachePolicy, InvalidationPolicy, Request};
pub use store::{CacheStore, EntryOptions, MemoryStore, StoreError, StoreHandle};

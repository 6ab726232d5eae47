//! Caching layer: request-result caching and grouped invalidation.
//!
//! Two pipeline interceptors share one [`GroupRegistry`]:
//!
//! - [`CachingMiddleware`]: cache-aside for requests that declare a
//!   [`CachePolicy`](crate::request::CachePolicy).
//! - [`CacheRemovingMiddleware`]: post-write invalidation for requests that
//!   declare an [`InvalidationPolicy`](crate::request::InvalidationPolicy).
//!
//! Neither holds mutable state; everything lives in the shared store behind a
//! [`StoreHandle`](crate::store::StoreHandle). Caching is an optimization
//! only: no store failure ever turns a successful request into an error.

pub mod group;
pub mod invalidate;
pub mod read;

pub use group::{GroupRegistry, InvalidationReport, Registration, RegistryError};
pub use invalidate::CacheRemovingMiddleware;
pub use read::CachingMiddleware;

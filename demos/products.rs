//! Product catalog demo: paged listing served from cache, invalidated on create.
//!
//! Run with:
//!
//! ```text
//! RUST_LOG=info cargo run --example products
//! ```

use std::sync::Arc;
use std::time::Duration;

use pipecache::{
    CachePolicy, CacheSettings, Context, InvalidationPolicy, Mediator, MemoryStore, Request,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Product {
    id: u32,
    category_id: u32,
    name: String,
}

#[derive(Debug, Serialize)]
struct GetProducts {
    page: usize,
    page_size: usize,
    bypass_cache: bool,
    sliding_expiration: Option<Duration>,
}

impl Request for GetProducts {
    type Response = Vec<Product>;

    fn cache_policy(&self) -> Option<CachePolicy> {
        let mut policy = CachePolicy::new(format!("GetProducts({},{})", self.page, self.page_size))
            .group("GetProducts")
            .bypass(self.bypass_cache);
        policy.sliding_expiration = self.sliding_expiration;
        Some(policy)
    }
}

#[derive(Debug, Serialize)]
struct CreateProduct {
    category_id: u32,
    name: String,
}

impl Request for CreateProduct {
    type Response = u32;

    fn invalidation(&self) -> Option<InvalidationPolicy> {
        Some(InvalidationPolicy::new().group("GetProducts"))
    }
}

type Repository = Arc<RwLock<Vec<Product>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = CacheSettings::load_from_file("demos/pipecache.yaml")?;
    let store = Arc::new(MemoryStore::new());
    let mut mediator = Mediator::builder()
        .logging(true)
        .caching(store.clone(), &settings)
        .build();

    let repo: Repository = Arc::new(RwLock::new(vec![Product {
        id: 1,
        category_id: 1,
        name: "Desk".into(),
    }]));

    let reads = repo.clone();
    mediator.register(move |req: Arc<GetProducts>, _ctx: Context| {
        let repo = reads.clone();
        async move {
            tracing::info!(page = req.page, "querying repository");
            let products = repo.read().await;
            let page = products
                .iter()
                .skip(req.page * req.page_size)
                .take(req.page_size)
                .cloned()
                .collect::<Vec<_>>();
            Ok::<_, std::io::Error>(page)
        }
    });

    let writes = repo.clone();
    mediator.register(move |req: Arc<CreateProduct>, _ctx: Context| {
        let repo = writes.clone();
        async move {
            let mut products = repo.write().await;
            let id = products.len() as u32 + 1;
            products.push(Product {
                id,
                category_id: req.category_id,
                name: req.name.clone(),
            });
            Ok::<_, std::io::Error>(id)
        }
    });

    let list = || GetProducts {
        page: 0,
        page_size: 10,
        bypass_cache: false,
        sliding_expiration: None,
    };
    let ctx = Context::new().with_user("demo");

    let first = mediator.send(list(), ctx.clone()).await?;
    let cached = mediator.send(list(), ctx.clone()).await?;
    println!("before create: {} product(s), cached copy has {}", first.len(), cached.len());

    let id = mediator
        .send(
            CreateProduct {
                category_id: 1,
                name: "Chair".into(),
            },
            ctx.clone(),
        )
        .await?;
    println!("created product {id}");

    let fresh = mediator.send(list(), ctx).await?;
    println!("after create: {} product(s)", fresh.len());
    println!("entries in store: {}", store.len());

    Ok(())
}

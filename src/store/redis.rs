//! Redis-backed store, shared by every process pointed at the same server.
//!
//! Each entry is a hash with three fields:
//!
//! | Field  | Meaning                                   |
//! |--------|-------------------------------------------|
//! | `data` | the opaque value                          |
//! | `sld`  | sliding expiration in whole seconds       |
//! | `ver`  | write counter, bumped on every write      |
//!
//! Reads and conditional writes run as Lua scripts so the sliding refresh and
//! the version check happen atomically on the server.

use bytes::Bytes;
use deadpool_redis::{Connection, Pool};
use ::redis::{AsyncCommands, Script};

use super::{BoxFuture, CacheStore, CasOutcome, EntryOptions, StoreError, StoreResult, Version};

// Returns {data, ver} and re-arms the TTL, or nil.
const READ_SCRIPT: &str = r"
local v = redis.call('HMGET', KEYS[1], 'data', 'sld', 'ver')
if not v[1] then return nil end
if v[2] then redis.call('EXPIRE', KEYS[1], tonumber(v[2])) end
return {v[1], v[3]}
";

const WRITE_SCRIPT: &str = r"
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'sld', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'ver', 1)
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return 1
";

// ARGV[3] is the expected version, or '' for "must not exist".
const CAS_SCRIPT: &str = r"
local cur = redis.call('HGET', KEYS[1], 'ver')
if ARGV[3] == '' then
  if cur then return 0 end
elseif cur ~= ARGV[3] then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'sld', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'ver', 1)
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return 1
";

/// A [`CacheStore`] over a `deadpool-redis` connection pool.
pub struct RedisStore {
    pool: Pool,
    read: Script,
    write: Script,
    cas: Script,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            read: Script::new(READ_SCRIPT),
            write: Script::new(WRITE_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
        }
    }

    /// Build a pool from a `redis://` URL.
    pub fn connect(url: &str) -> StoreResult<Self> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(StoreError::backend)?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(StoreError::backend)
    }

    async fn read(&self, key: &str) -> StoreResult<Option<(Bytes, Version)>> {
        let mut conn = self.conn().await?;
        let found: Option<(Vec<u8>, Version)> = self
            .read
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(found.map(|(data, ver)| (Bytes::from(data), ver)))
    }
}

impl CacheStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
        Box::pin(async move { Ok(self.read(key).await?.map(|(data, _)| data)) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let _: i64 = self
                .write
                .key(key)
                .arg(value.as_ref())
                .arg(options.ttl_secs())
                .invoke_async(&mut conn)
                .await
                .map_err(StoreError::backend)?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            conn.del::<_, ()>(key).await.map_err(StoreError::backend)
        })
    }

    fn supports_versioning(&self) -> bool {
        true
    }

    fn get_versioned<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<(Bytes, Version)>>> {
        Box::pin(self.read(key))
    }

    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<Version>,
        value: Bytes,
        options: EntryOptions,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let expected = expected.map(|v| v.to_string()).unwrap_or_default();
            let stored: i64 = self
                .cas
                .key(key)
                .arg(value.as_ref())
                .arg(options.ttl_secs())
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(StoreError::backend)?;
            Ok(if stored == 1 {
                CasOutcome::Stored
            } else {
                CasOutcome::Conflict
            })
        })
    }
}

//! Key-value cache client (§6): string keys, binary values, TTL
//! (`SETEX`) semantics, at-least-once read consistency.
//!
//! Cache failures are never fatal (`CACHE_UNAVAILABLE` at the caller) —
//! both implementations below report failure through [`ClientError`]
//! and it is the evidence builder's job to treat that as a miss.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::ClientError;

/// A string-keyed, binary-valued cache with TTL semantics.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError>;
    /// Store a value with a TTL (`SETEX` semantics).
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ClientError>;
}

/// `redis`-backed [`Cache`], using a multiplexed connection manager so a
/// single shared handle serves concurrent requests.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect to `redis_url` and build a connection manager.
    pub async fn connect(redis_url: &str) -> Result<Self, ClientError> {
        let client = redis::Client::open(redis_url).map_err(|e| ClientError::Storage(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| ClientError::Storage(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| ClientError::Storage(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ClientError> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| ClientError::Storage(e.to_string()))
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory [`Cache`], used by tests and as the `CACHE_UNAVAILABLE`
/// degradation target.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ClientError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

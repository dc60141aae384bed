// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Tracker
//!
//! Counts consecutive processing failures per message id. The counter lives
//! outside the consumer loop so it survives redeliveries and, with an external
//! store, the process itself. `increment` must be atomic: concurrent failures
//! of the same message must each be counted.

use crate::errors::RetryStoreError;
use async_trait::async_trait;
use std::{collections::HashMap, time::Duration};
use tokio::{sync::Mutex, time::Instant};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Current failure count, `None` when the message never failed.
    async fn get(&self, key: &str) -> Result<Option<u32>, RetryStoreError>;

    /// Adds one failure and returns the new count.
    async fn increment(&self, key: &str) -> Result<u32, RetryStoreError>;

    async fn clear(&self, key: &str) -> Result<(), RetryStoreError>;
}

struct Entry {
    count: u32,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local store, optionally expiring counters after `ttl`.
#[derive(Default)]
pub struct MemoryRetryStore {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryRetryStore {
    pub fn new() -> MemoryRetryStore {
        MemoryRetryStore::default()
    }

    /// Counters expire `ttl` after their last increment.
    pub fn with_ttl(ttl: Duration) -> MemoryRetryStore {
        MemoryRetryStore {
            ttl: Some(ttl),
            entries: Mutex::default(),
        }
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn get(&self, key: &str) -> Result<Option<u32>, RetryStoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }

        Ok(entries.get(key).map(|entry| entry.count))
    }

    async fn increment(&self, key: &str) -> Result<u32, RetryStoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expires_at = self.ttl.map(|ttl| now + ttl);

        let entry = entries.entry(key.to_owned()).or_insert(Entry {
            count: 0,
            expires_at,
        });
        if entry.is_expired(now) {
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        entry.expires_at = expires_at;

        Ok(entry.count)
    }

    async fn clear(&self, key: &str) -> Result<(), RetryStoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisRetryStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::RetryStore;
    use crate::errors::RetryStoreError;
    use async_trait::async_trait;
    use redis::{aio::ConnectionManager, AsyncCommands};
    use std::time::Duration;

    /// Redis-backed store; `INCR` gives the atomic increment.
    #[derive(Clone)]
    pub struct RedisRetryStore {
        conn: ConnectionManager,
        prefix: String,
        ttl: Option<Duration>,
    }

    impl RedisRetryStore {
        pub async fn connect(url: &str, prefix: &str) -> Result<Self, RetryStoreError> {
            let client = redis::Client::open(url)
                .map_err(|err| RetryStoreError::Unavailable(err.to_string()))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|err| RetryStoreError::Unavailable(err.to_string()))?;

            Ok(RedisRetryStore {
                conn,
                prefix: prefix.to_owned(),
                ttl: None,
            })
        }

        pub fn with_ttl(mut self, ttl: Duration) -> Self {
            self.ttl = Some(ttl);
            self
        }

        fn key(&self, key: &str) -> String {
            format!("{}{}", self.prefix, key)
        }
    }

    #[async_trait]
    impl RetryStore for RedisRetryStore {
        async fn get(&self, key: &str) -> Result<Option<u32>, RetryStoreError> {
            let mut conn = self.conn.clone();
            conn.get::<_, Option<u32>>(self.key(key))
                .await
                .map_err(|err| RetryStoreError::Command(err.to_string()))
        }

        async fn increment(&self, key: &str) -> Result<u32, RetryStoreError> {
            let mut conn = self.conn.clone();
            let key = self.key(key);

            let mut pipe = redis::pipe();
            pipe.atomic().cmd("INCR").arg(&key);
            if let Some(ttl) = self.ttl {
                pipe.cmd("EXPIRE").arg(&key).arg(ttl.as_secs()).ignore();
            }

            let (count,): (u32,) = pipe
                .query_async(&mut conn)
                .await
                .map_err(|err| RetryStoreError::Command(err.to_string()))?;

            Ok(count)
        }

        async fn clear(&self, key: &str) -> Result<(), RetryStoreError> {
            let mut conn = self.conn.clone();
            conn.del::<_, ()>(self.key(key))
                .await
                .map_err(|err| RetryStoreError::Command(err.to_string()))
        }
    }
}

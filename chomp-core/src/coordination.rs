//! The coordination store: claims, cache, and pub/sub over a shared redis
//! instance (spec.md §4.2-§4.3, §6's namespace layout). Grounded on
//! `examples/original_source/src/cache.py` / `src/state.py::get_redis` for
//! the exact operations, and on `mmoldb-app/src/main.rs`'s
//! `rocket_db_pools`/`deadpool_redis` fairing for the redis-in-this-codebase
//! precedent.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use log::warn;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const YEAR_SECONDS: u64 = 31_536_000;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to serialize value for cache: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize cached value: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// A thin, cloneable handle over a redis connection manager, namespaced per
/// spec.md §6 (`<NS>:cache:<resource>`, `<NS>:<resource>`, `<NS>:claims:<id>`,
/// `<NS>:status:resources`, `<NS>:limiter:<bucket>:<user>`).
#[derive(Clone)]
pub struct CoordinationStore {
    conn: ConnectionManager,
    namespace: String,
    proc_id: String,
}

impl CoordinationStore {
    pub async fn connect(redis_url: &str, namespace: impl Into<String>, proc_id: impl Into<String>) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: namespace.into(),
            proc_id: proc_id.into(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn proc_id(&self) -> &str {
        &self.proc_id
    }

    fn claim_key(&self, ingester_id: &str) -> String {
        format!("{}:claims:{}", self.namespace, ingester_id)
    }

    fn cache_key(&self, name: &str) -> String {
        format!("{}:cache:{}", self.namespace, name)
    }

    fn topic_key(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    pub fn status_key(&self) -> String {
        format!("{}:status:resources", self.namespace)
    }

    pub fn limiter_key(&self, bucket: &str, user: &str) -> String {
        format!("{}:limiter:{}:{}", self.namespace, bucket, user)
    }

    // ---- claim manager (spec.md §4.2) ----------------------------------

    /// `SET key=proc_id EX ttl NX`, re-entrant for the current holder.
    /// Returns `true` iff the claim now belongs to `self.proc_id`.
    pub async fn claim(&self, ingester_id: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.claim_key(ingester_id);

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.proc_id)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        if set.is_some() {
            return Ok(true);
        }

        let holder: Option<String> = conn.get(&key).await?;
        Ok(holder.as_deref() == Some(self.proc_id.as_str()))
    }

    /// `exists(claims:<id>) && (!exclude_self || holder != proc_id)`.
    pub async fn is_claimed(&self, ingester_id: &str, exclude_self: bool) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.claim_key(ingester_id);
        let holder: Option<String> = conn.get(&key).await?;
        Ok(match holder {
            None => false,
            Some(h) => !exclude_self || h != self.proc_id,
        })
    }

    /// Deletes the claim only if the current process is the holder.
    pub async fn free(&self, ingester_id: &str) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.claim_key(ingester_id);
        let holder: Option<String> = conn.get(&key).await?;
        if holder.as_deref() == Some(self.proc_id.as_str()) {
            let _: () = conn.del(&key).await?;
        }
        Ok(())
    }

    // ---- cache layer (spec.md §4.3) ------------------------------------

    pub async fn set_raw(&self, name: &str, value: &[u8], ttl_secs: u64) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.cache_key(name);
        let _: () = conn.set_ex(&key, value, ttl_secs.max(1)).await?;
        Ok(())
    }

    pub async fn get_raw(&self, name: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.cache_key(name);
        Ok(conn.get(&key).await?)
    }

    pub async fn set<T: Serialize>(&self, name: &str, value: &T, ttl_secs: u64) -> Result<(), CoordinationError> {
        let bytes = serde_json::to_vec(value).map_err(CoordinationError::Serialize)?;
        self.set_raw(name, &bytes, ttl_secs).await
    }

    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CoordinationError> {
        match self.get_raw(name).await? {
            None => Ok(None),
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(CoordinationError::Deserialize)?;
                Ok(Some(value))
            }
        }
    }

    /// Pipelined multi-set, per spec.md §4.3 `batch_set`.
    pub async fn batch_set_raw(&self, entries: &[(String, Vec<u8>)], ttl_secs: u64) -> Result<(), CoordinationError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (name, value) in entries {
            pipe.set_ex(self.cache_key(name), value, ttl_secs.max(1));
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Pipelined multi-get, per spec.md §4.3 `batch_get`.
    pub async fn batch_get_raw(&self, names: &[String]) -> Result<Vec<Option<Vec<u8>>>, CoordinationError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = names.iter().map(|n| self.cache_key(n)).collect();
        let values: Vec<Option<Vec<u8>>> = conn.mget(&keys).await?;
        Ok(values)
    }

    /// Miss runs `producer`; if it yields `None`, the miss is surfaced
    /// without writing back (matches `original_source/src/cache.py`'s
    /// `get_or_set_cache`, which treats an empty producer result as a
    /// rehydration failure rather than caching it).
    pub async fn get_or_set<T, F, Fut>(&self, name: &str, ttl_secs: u64, producer: F) -> Result<Option<T>, CoordinationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        if let Some(cached) = self.get::<T>(name).await? {
            return Ok(Some(cached));
        }
        match producer().await {
            Some(value) => {
                self.set(name, &value, ttl_secs).await?;
                Ok(Some(value))
            }
            None => {
                warn!("cache could not be rehydrated for key: {name}");
                Ok(None)
            }
        }
    }

    /// Publishes `msg` to `<NS>:<name>` for each `name` in `topics` (spec.md
    /// §4.3 `publish`). Called after every ingester write, alongside the
    /// cache snapshot write.
    pub async fn publish(&self, topics: &[String], msg: &[u8]) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        for topic in topics {
            let key = self.topic_key(topic);
            let _: () = conn.publish(&key, msg).await?;
        }
        Ok(())
    }

    /// Convenience wrapper used by ingesters: writes the resource snapshot to
    /// `cache:<name>` and publishes to `<NS>:<name>` in one step.
    pub async fn publish_snapshot<T: Serialize>(&self, name: &str, value: &T, ttl_secs: u64) -> Result<(), CoordinationError> {
        self.set(name, value, ttl_secs).await?;
        let bytes = serde_json::to_vec(value).map_err(CoordinationError::Serialize)?;
        self.publish(&[name.to_string()], &bytes).await
    }

    /// Subscribes to one or more topics, invoking `handler` for each message
    /// until the connection is dropped or an error occurs (spec.md §4.3
    /// `subscribe`). Used by `chomp-server`'s forwarder boundary.
    pub async fn subscribe<F, Fut>(&self, redis_url: &str, topics: &[String], mut handler: F) -> Result<(), CoordinationError>
    where
        F: FnMut(String, Vec<u8>) -> Fut,
        Fut: Future<Output = ()>,
    {
        use futures::StreamExt;

        let client = redis::Client::open(redis_url)?;
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        let keys: Vec<String> = topics.iter().map(|t| self.topic_key(t)).collect();
        for key in &keys {
            pubsub.subscribe(key).await?;
        }

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel: String = msg.get_channel_name().to_string();
            let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
            handler(channel, payload).await;
        }
        Ok(())
    }

    /// Refreshes `<NS>:status:resources` with a per-ingester summary of the
    /// last successful `ingestion_time` (supplemental feature, spec.md §6 /
    /// SPEC_FULL.md §2).
    pub async fn refresh_status(&self, statuses: &[ResourceStatus]) -> Result<(), CoordinationError> {
        self.set(&self.status_key(), statuses, YEAR_SECONDS).await
    }

    // ---- rate limiter (SPEC_FULL.md §2) --------------------------------

    /// `INCR <NS>:limiter:<bucket>:<user>`, setting the key's TTL only on
    /// the window's first increment (so the window slides from first use,
    /// not from an arbitrary fixed boundary). Returns the post-increment
    /// count, used by `chomp-server`'s fixed-window rate limiter.
    pub async fn limiter_increment(&self, bucket: &str, user: &str, ttl_secs: u64) -> Result<i64, CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.limiter_key(bucket, user);
        let count: i64 = conn.incr(&key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(&key, ttl_secs.max(1) as i64).await?;
        }
        Ok(count)
    }

    /// Reads the current count and remaining TTL for a limiter bucket
    /// without incrementing it, used by the `/limits` introspection route.
    pub async fn limiter_peek(&self, bucket: &str, user: &str) -> Result<(i64, i64), CoordinationError> {
        let mut conn = self.conn.clone();
        let key = self.limiter_key(bucket, user);
        let count: Option<i64> = conn.get(&key).await?;
        let ttl: i64 = conn.ttl(&key).await?;
        Ok((count.unwrap_or(0), ttl.max(0)))
    }
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ResourceStatus {
    pub name: String,
    pub ingestion_time: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
}

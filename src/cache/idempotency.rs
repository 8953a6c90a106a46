use crate::cache::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const VALUE_PROCESSING: &str = "processing";
const VALUE_DONE: &str = "done";

/// Atomic key/value store with expiry.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Stores `value` only when `key` is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Stores `value` unconditionally, replacing any current value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn delete(&self, key: &str) -> CacheResult<()>;
}

fn ttl_millis(ttl: Duration) -> CacheResult<u64> {
    let millis = u64::try_from(ttl.as_millis())
        .map_err(|_| CacheError::TtlError(format!("ttl too large: {:?}", ttl)))?;
    if millis == 0 {
        return Err(CacheError::TtlError("ttl must be positive".to_string()));
    }
    Ok(millis)
}

#[cfg(feature = "cache")]
pub struct RedisIdempotencyCache {
    pool: crate::cache::RedisPool,
}

#[cfg(feature = "cache")]
impl RedisIdempotencyCache {
    pub fn new(pool: crate::cache::RedisPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let millis = ttl_millis(ttl)?;
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let millis = ttl_millis(ttl)?;
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(())
    }
}

/// Process-local cache for tests and single-node runs.
#[derive(Clone, Default)]
pub struct MemoryIdempotencyCache {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        ttl_millis(ttl)?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        ttl_millis(ttl)?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupeDecision {
    /// This caller owns the key and must `complete` or `release` it.
    Acquired,
    /// A previous run finished; carries the suffix stored with `done`, if any.
    Completed(Option<String>),
    InFlight,
}

/// Processing/done marker protocol over an [`IdempotencyCache`].
///
/// The processing marker lives for `min(done_ttl, processing_ceiling)` so a
/// crashed holder never blocks redelivery for longer than the ceiling.
#[derive(Clone)]
pub struct DedupeGate {
    cache: Arc<dyn IdempotencyCache>,
    processing_ttl: Duration,
    done_ttl: Duration,
}

impl DedupeGate {
    pub fn new(cache: Arc<dyn IdempotencyCache>, done_ttl: Duration, processing_ceiling: Duration) -> Self {
        Self {
            cache,
            processing_ttl: done_ttl.min(processing_ceiling),
            done_ttl,
        }
    }

    pub fn processing_ttl(&self) -> Duration {
        self.processing_ttl
    }

    pub async fn acquire(&self, key: &str) -> CacheResult<DedupeDecision> {
        if self
            .cache
            .set_if_absent(key, VALUE_PROCESSING, self.processing_ttl)
            .await?
        {
            return Ok(DedupeDecision::Acquired);
        }

        let mut value = self.cache.get(key).await?;
        if value.is_none() {
            // Expired between the two calls.
            if self
                .cache
                .set_if_absent(key, VALUE_PROCESSING, self.processing_ttl)
                .await?
            {
                return Ok(DedupeDecision::Acquired);
            }
            value = self.cache.get(key).await?;
        }

        let decision = match value.as_deref() {
            Some(VALUE_DONE) => DedupeDecision::Completed(None),
            Some(v) => match v.strip_prefix("done:") {
                Some(suffix) => DedupeDecision::Completed(Some(suffix.to_string())),
                None => DedupeDecision::InFlight,
            },
            None => DedupeDecision::InFlight,
        };
        debug!(key, ?decision, "dedupe key already held");
        Ok(decision)
    }

    /// Overwrites the processing marker with `done` (or `done:{suffix}`) in one
    /// write, so the key is never absent in between.
    pub async fn complete(&self, key: &str, suffix: Option<&str>) -> CacheResult<()> {
        let value = match suffix {
            Some(s) => format!("{}:{}", VALUE_DONE, s),
            None => VALUE_DONE.to_string(),
        };
        self.cache.set(key, &value, self.done_ttl).await
    }

    /// Drops the processing marker so a redelivery can run again.
    pub async fn release(&self, key: &str) -> CacheResult<()> {
        self.cache.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(cache: &MemoryIdempotencyCache) -> DedupeGate {
        DedupeGate::new(
            Arc::new(cache.clone()),
            Duration::from_secs(4 * 24 * 3600),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn processing_ttl_is_capped_by_ceiling() {
        let cache = MemoryIdempotencyCache::new();
        assert_eq!(gate(&cache).processing_ttl(), Duration::from_secs(300));

        let short = DedupeGate::new(
            Arc::new(cache),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert_eq!(short.processing_ttl(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn second_acquire_sees_in_flight_then_done() {
        let cache = MemoryIdempotencyCache::new();
        let gate = gate(&cache);

        assert_eq!(gate.acquire("k").await.unwrap(), DedupeDecision::Acquired);
        assert_eq!(gate.acquire("k").await.unwrap(), DedupeDecision::InFlight);

        gate.complete("k", None).await.unwrap();
        assert_eq!(gate.acquire("k").await.unwrap(), DedupeDecision::Completed(None));
    }

    /// Records every write that reaches the wrapped cache.
    struct Recording {
        inner: MemoryIdempotencyCache,
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IdempotencyCache for Recording {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
            self.ops.lock().await.push(format!("set_nx {key} {value}"));
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
            self.ops.lock().await.push(format!("set {key} {value}"));
            self.inner.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> CacheResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.ops.lock().await.push(format!("del {key}"));
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn complete_overwrites_without_clearing_the_key() {
        let cache = Arc::new(Recording {
            inner: MemoryIdempotencyCache::new(),
            ops: Mutex::new(Vec::new()),
        });
        let gate = DedupeGate::new(
            cache.clone(),
            Duration::from_secs(4 * 24 * 3600),
            Duration::from_secs(300),
        );

        assert_eq!(gate.acquire("k").await.unwrap(), DedupeDecision::Acquired);
        gate.complete("k", Some("17")).await.unwrap();

        assert_eq!(
            *cache.ops.lock().await,
            vec!["set_nx k processing".to_string(), "set k done:17".to_string()]
        );
        assert_eq!(
            gate.acquire("k").await.unwrap(),
            DedupeDecision::Completed(Some("17".to_string()))
        );
    }

    #[tokio::test]
    async fn set_replaces_an_existing_value() {
        let cache = MemoryIdempotencyCache::new();
        assert!(cache.set_if_absent("k", "processing", Duration::from_secs(5)).await.unwrap());
        cache.set("k", "done", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("done"));
        assert!(cache.set("k", "done", Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn release_allows_redelivery() {
        let cache = MemoryIdempotencyCache::new();
        let gate = gate(&cache);

        assert_eq!(gate.acquire("k").await.unwrap(), DedupeDecision::Acquired);
        gate.release("k").await.unwrap();
        assert_eq!(gate.acquire("k").await.unwrap(), DedupeDecision::Acquired);
    }

    #[tokio::test]
    async fn completed_value_carries_suffix() {
        let cache = MemoryIdempotencyCache::new();
        let gate = gate(&cache);

        gate.acquire("k").await.unwrap();
        gate.complete("k", Some("17")).await.unwrap();
        assert_eq!(
            gate.acquire("k").await.unwrap(),
            DedupeDecision::Completed(Some("17".to_string()))
        );
    }

    #[tokio::test]
    async fn expired_entries_are_reacquired() {
        let cache = MemoryIdempotencyCache::new();
        assert!(cache
            .set_if_absent("k", "processing", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache
            .set_if_absent("k", "processing", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let cache = MemoryIdempotencyCache::new();
        assert!(cache.set_if_absent("k", "v", Duration::ZERO).await.is_err());
    }

    #[cfg(feature = "cache")]
    #[tokio::test]
    #[ignore]
    async fn redis_set_if_absent_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let pool = crate::cache::init_cache_pool(crate::cache::CacheConfig {
            redis_url: url,
            ..Default::default()
        })
        .await
        .unwrap();
        let cache = RedisIdempotencyCache::new(pool);
        let key = format!("v1:test:{}", uuid::Uuid::new_v4());
        assert!(cache.set_if_absent(&key, "processing", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_if_absent(&key, "processing", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("processing"));
        cache.set(&key, "done", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("done"));
        cache.delete(&key).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }
}

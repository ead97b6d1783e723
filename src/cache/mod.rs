//! Dual-tier read-through cache in front of the booking store.
//!
//! Lookups consult the in-process map first and fall back to an optional
//! durable tier, repopulating the map on a durable hit. Concurrent misses for
//! the same key share one upstream fetch. Invalidating a key detaches its
//! in-flight fetch: the fetch still answers its callers but never writes its
//! result back. Fetches for other keys are unaffected.

mod durable;
pub mod keys;

pub use durable::{DurableTier, FileTier, TierEntry, TierError};
pub use keys::KeyPattern;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::engine::BookingError;
use crate::model::{Ms, now_ms};
use crate::observability::{
    CACHE_COALESCED_TOTAL, CACHE_DURABLE_FAILURES_TOTAL, CACHE_FETCHES_TOTAL, CACHE_LOOKUPS_TOTAL,
};

type FetchResult<V> = Result<V, BookingError>;
type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

/// Values a [`CacheLayer`] can hold.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub data: V,
    pub expires_at: Ms,
    pub saved_at: Ms,
    pub metadata: Option<Vec<(String, String)>>,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Ms) -> bool {
        now < self.expires_at
    }
}

/// A cached value and whether it was still inside its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit<V> {
    pub data: V,
    pub is_fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Fetch on a stale hit and wait for it.
    Fresh,
    /// Answer a stale hit immediately and refresh in the background.
    StaleWhileRevalidate,
}

struct InFlight<V> {
    token: u64,
    fetch: SharedFetch<V>,
}

struct Inner<V> {
    name: &'static str,
    memory: DashMap<String, CacheEntry<V>>,
    durable: Option<Mutex<Box<dyn DurableTier>>>,
    inflight: DashMap<String, InFlight<V>>,
    next_token: AtomicU64,
}

/// Cheaply cloneable handle; clones share one cache.
pub struct CacheLayer<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheLayer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Cacheable> CacheLayer<V> {
    pub fn new(name: &'static str, durable: Option<Box<dyn DurableTier>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                memory: DashMap::new(),
                durable: durable.map(Mutex::new),
                inflight: DashMap::new(),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    pub fn in_memory(name: &'static str) -> Self {
        Self::new(name, None)
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Fresh entries only.
    pub fn get(&self, key: &str) -> Option<CacheHit<V>> {
        self.inner.lookup(key, now_ms()).filter(|hit| hit.is_fresh)
    }

    pub fn get_including_stale(&self, key: &str) -> Option<CacheHit<V>> {
        self.inner.lookup(key, now_ms())
    }

    pub fn set(&self, key: &str, data: V, ttl: Duration) {
        self.inner.store(key, data, ttl, None);
    }

    pub fn set_with_metadata(&self, key: &str, data: V, ttl: Duration, metadata: Vec<(String, String)>) {
        self.inner.store(key, data, ttl, Some(metadata));
    }

    /// Drop the exact key, or every key under a `prefix*` pattern, from both
    /// tiers. In-flight fetches for matching keys are detached and will not
    /// repopulate the cache.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let pattern = KeyPattern::parse(pattern);

        // detach fetches before clearing, so a fetch settling concurrently
        // either sees itself detached or has its write cleared below
        self.inner.inflight.retain(|k, _| !pattern.matches(k));
        let before = self.inner.memory.len();
        self.inner.memory.retain(|k, _| !pattern.matches(k));
        let mut removed = before.saturating_sub(self.inner.memory.len());

        if let Some(durable) = &self.inner.durable {
            match durable.lock() {
                Ok(mut tier) => removed = removed.max(tier.remove_matching(&pattern)),
                Err(_) => warn!("{} cache: durable tier lock poisoned during invalidation", self.inner.name),
            }
        }
        debug!("{} cache: invalidated {removed} entries for {pattern:?}", self.inner.name);
        removed
    }

    /// Read-through: answer from the cache when fresh, otherwise fetch through
    /// `fetcher`, sharing the fetch with any concurrent caller for the same key.
    ///
    /// A stale entry is returned instead of an error when the store is
    /// unavailable. In [`ReadMode::StaleWhileRevalidate`] a stale entry is
    /// returned immediately and one background refresh is started.
    pub async fn read_through<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: ReadMode,
        fetcher: F,
    ) -> Result<CacheHit<V>, BookingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let cached = self.inner.lookup(key, now_ms());
        let name = self.inner.name;
        match cached {
            Some(hit) if hit.is_fresh => Ok(hit),
            Some(stale) if mode == ReadMode::StaleWhileRevalidate => {
                let refresh = self.shared_fetch(key, ttl, fetcher);
                let key = key.to_string();
                tokio::spawn(async move {
                    if let Err(e) = refresh.await {
                        warn!("{name} cache: background refresh of {key} failed: {e}");
                    }
                });
                Ok(stale)
            }
            stale => match self.shared_fetch(key, ttl, fetcher).await {
                Ok(data) => Ok(CacheHit { data, is_fresh: true }),
                Err(e) if e.is_unavailable() => match stale {
                    Some(hit) => {
                        warn!("{name} cache: serving stale {key}: {e}");
                        Ok(hit)
                    }
                    None => Err(e),
                },
                Err(e) => Err(e),
            },
        }
    }

    fn shared_fetch<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let name = self.inner.name;
        match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                metrics::counter!(CACHE_COALESCED_TOTAL, "cache" => name).increment(1);
                existing.get().fetch.clone()
            }
            Entry::Vacant(slot) => {
                metrics::counter!(CACHE_FETCHES_TOTAL, "cache" => name).increment(1);
                let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                let owner: Weak<Inner<V>> = Arc::downgrade(&self.inner);
                let owned_key = key.to_string();
                let upstream = fetcher();
                let fetch = async move {
                    let result = upstream.await;
                    if let Some(inner) = owner.upgrade() {
                        inner.settle(&owned_key, token, &result, ttl);
                    }
                    result
                }
                .boxed()
                .shared();
                slot.insert(InFlight {
                    token,
                    fetch: fetch.clone(),
                });
                fetch
            }
        }
    }

    /// Drop entries that expired more than `max_stale` ago from both tiers.
    pub fn purge_expired(&self, max_stale: Duration) -> usize {
        let cutoff = now_ms() - max_stale.as_millis() as Ms;
        let before = self.inner.memory.len();
        self.inner.memory.retain(|_, e| e.expires_at >= cutoff);
        let mut purged = before.saturating_sub(self.inner.memory.len());
        if let Some(durable) = &self.inner.durable
            && let Ok(mut tier) = durable.lock()
        {
            purged += tier.purge_before(cutoff);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.memory.is_empty()
    }
}

impl<V: Cacheable> Inner<V> {
    fn lookup(&self, key: &str, now: Ms) -> Option<CacheHit<V>> {
        if let Some(entry) = self.memory.get(key) {
            let is_fresh = entry.is_fresh(now);
            self.record_lookup(if is_fresh { "fresh" } else { "stale" });
            return Some(CacheHit {
                data: entry.data.clone(),
                is_fresh,
            });
        }

        let Some(entry) = self.load_durable(key) else {
            self.record_lookup("miss");
            return None;
        };
        let hit = CacheHit {
            data: entry.data.clone(),
            is_fresh: entry.is_fresh(now),
        };
        debug!("{} cache: durable hit for {key}", self.name);
        self.record_lookup(if hit.is_fresh { "fresh" } else { "stale" });
        self.memory.insert(key.to_string(), entry);
        Some(hit)
    }

    /// Write a finished fetch back, unless its key was invalidated or a newer
    /// fetch replaced it, then retire it.
    fn settle(&self, key: &str, token: u64, result: &FetchResult<V>, ttl: Duration) {
        // the in-flight guard is held across the write so invalidation waits
        match (self.inflight.get(key), result) {
            (Some(current), Ok(data)) if current.token == token => self.store(key, data.clone(), ttl, None),
            (_, Ok(_)) => debug!("{} cache: dropping result for {key}, invalidated mid-fetch", self.name),
            (_, Err(_)) => {}
        }
        self.inflight.remove_if(key, |_, f| f.token == token);
    }

    fn load_durable(&self, key: &str) -> Option<CacheEntry<V>> {
        let durable = self.durable.as_ref()?;
        let raw = durable.lock().ok()?.load(key)?;
        match bincode::deserialize::<V>(&raw.payload) {
            Ok(data) => Some(CacheEntry {
                data,
                expires_at: raw.expires_at,
                saved_at: raw.saved_at,
                metadata: raw.metadata,
            }),
            Err(e) => {
                warn!("{} cache: undecodable durable entry {key}: {e}", self.name);
                if let Ok(mut tier) = durable.lock() {
                    tier.remove_matching(&KeyPattern::Exact(key.to_string()));
                }
                None
            }
        }
    }

    fn store(&self, key: &str, data: V, ttl: Duration, metadata: Option<Vec<(String, String)>>) {
        let saved_at = now_ms();
        let expires_at = saved_at + ttl.as_millis() as Ms;

        if let Some(durable) = &self.durable {
            let written = bincode::serialize(&data)
                .map_err(|e| e.to_string())
                .and_then(|payload| {
                    if payload.len() > crate::limits::MAX_CACHE_ENTRY_BYTES {
                        return Err(format!("{} bytes exceeds the entry limit", payload.len()));
                    }
                    let mut tier = durable.lock().map_err(|_| "lock poisoned".to_string())?;
                    tier.store(TierEntry {
                        key: key.to_string(),
                        payload,
                        expires_at,
                        saved_at,
                        metadata: metadata.clone(),
                    })
                    .map_err(|e| e.to_string())
                });
            if let Err(e) = written {
                metrics::counter!(CACHE_DURABLE_FAILURES_TOTAL, "cache" => self.name).increment(1);
                warn!("{} cache: durable write of {key} failed, keeping it in memory only: {e}", self.name);
            }
        }

        self.memory.insert(
            key.to_string(),
            CacheEntry {
                data,
                expires_at,
                saved_at,
                metadata,
            },
        );
    }

    fn record_lookup(&self, result: &'static str) {
        metrics::counter!(CACHE_LOOKUPS_TOTAL, "cache" => self.name, "result" => result).increment(1);
    }
}

//! Bounded cache of opened publications
//!
//! Opening a publication means fetching it from a backend and parsing the
//! container, so the result is kept around keyed by canonical path.
//!
//! # Guarantees
//!
//! - At most one construction per key is in flight. Concurrent callers for the
//!   same key await the same outcome, success or failure.
//! - Construction runs on its own task: a caller that goes away does not cancel
//!   it for the others, and a finished construction is still admitted.
//! - Size is bounded. When full, a new entry is only admitted if its estimated
//!   access frequency beats the least valuable resident entry; otherwise it is
//!   returned to the caller and dropped afterwards.
//! - Entries expire a fixed time after insertion, checked on access and by the
//!   periodic sweeper.
//! - Each publication is released exactly once, when the last handle to it is
//!   dropped. Removed entries are dropped outside the cache lock.

mod entry;
mod sketch;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};

pub use entry::{CachedPublication, Release};
pub use sketch::FrequencySketch;

/// Number of publications kept open
pub const MAX_CACHED_PUBLICATIONS: usize = 10;
/// Lifetime of a cached publication, measured from insertion
pub const MAX_CACHED_PUBLICATION_TTL: Duration = Duration::from_secs(600);

type Handle<P> = Arc<CachedPublication<P>>;
type Pending<P, E> = Shared<BoxFuture<'static, Result<Handle<P>, E>>>;

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub resident: usize,
    pub capacity: usize,
    pub in_flight: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub rejected: u64,
    pub evicted: u64,
}

struct CacheState<P: Release, E> {
    resident: LruCache<Vec<u8>, Handle<P>>,
    in_flight: HashMap<Vec<u8>, Pending<P, E>>,
    sketch: FrequencySketch,
}

impl<P: Release, E> CacheState<P, E> {
    /// Fresh resident entry for `key`, moving expired ones to `removed`
    fn lookup(&mut self, key: &[u8], ttl: Duration, removed: &mut Vec<Handle<P>>) -> Option<Handle<P>> {
        let expired = self.resident.get(key)?.is_expired(ttl);
        if expired {
            removed.extend(self.resident.pop(key));
            return None;
        }
        self.resident.get(key).cloned()
    }

    fn purge_expired(&mut self, ttl: Duration, removed: &mut Vec<Handle<P>>) {
        let expired: Vec<Vec<u8>> = self
            .resident
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            removed.extend(self.resident.pop(&key));
        }
    }

    /// Resident key with the lowest estimated frequency, least recent on ties
    fn victim(&self) -> Option<(Vec<u8>, u8)> {
        let mut victim: Option<(&Vec<u8>, u8)> = None;
        // Iterates most to least recently used
        for (key, _) in self.resident.iter() {
            let frequency = self.sketch.frequency(key);
            if victim.map_or(true, |(_, lowest)| frequency <= lowest) {
                victim = Some((key, frequency));
            }
        }
        victim.map(|(key, frequency)| (key.clone(), frequency))
    }

    /// Try to make `entry` resident. Returns whether it was admitted.
    fn admit(
        &mut self,
        key: Vec<u8>,
        entry: Handle<P>,
        capacity: usize,
        ttl: Duration,
        removed: &mut Vec<Handle<P>>,
    ) -> bool {
        self.purge_expired(ttl, removed);
        removed.extend(self.resident.pop(&key));

        if self.resident.len() < capacity {
            self.resident.put(key, entry);
            return true;
        }

        let Some((victim, victim_frequency)) = self.victim() else {
            return false;
        };
        if self.sketch.frequency(&key) <= victim_frequency {
            return false;
        }

        removed.extend(self.resident.pop(&victim));
        self.resident.put(key, entry);
        true
    }
}

struct Inner<P: Release, E> {
    state: Mutex<CacheState<P, E>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

impl<P: Release, E> Inner<P, E> {
    fn count_removed(&self, removed: &[Handle<P>]) {
        if !removed.is_empty() {
            self.evicted.fetch_add(removed.len() as u64, Ordering::Relaxed);
        }
    }
}

/// Removes the in-flight marker if the construction task dies before finishing
struct InFlightGuard<P: Release, E> {
    inner: Arc<Inner<P, E>>,
    key: Vec<u8>,
    armed: bool,
}

impl<P: Release, E> Drop for InFlightGuard<P, E> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().in_flight.remove(&self.key);
        }
    }
}

/// Concurrency-safe publication cache. Cloning shares the same cache.
pub struct PublicationCache<P: Release, E> {
    inner: Arc<Inner<P, E>>,
}

impl<P: Release, E> Clone for PublicationCache<P, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, E> Default for PublicationCache<P, E>
where
    P: Release + Send + Sync + 'static,
    E: Clone + From<JoinError> + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(MAX_CACHED_PUBLICATIONS, MAX_CACHED_PUBLICATION_TTL)
    }
}

impl<P, E> PublicationCache<P, E>
where
    P: Release + Send + Sync + 'static,
    E: Clone + From<JoinError> + Send + Sync + 'static,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    resident: LruCache::unbounded(),
                    in_flight: HashMap::new(),
                    sketch: FrequencySketch::new(capacity),
                }),
                capacity,
                ttl,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Return the cached publication for `key`, constructing it on a miss.
    ///
    /// `construct` is only called on a genuine miss with no construction for
    /// `key` already running. Its future runs on a separate task. Keys are
    /// compared as raw bytes.
    pub async fn get_or_create<K, F, Fut>(&self, key: K, remote: bool, construct: F) -> Result<Handle<P>, E>
    where
        K: AsRef<[u8]>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P, E>> + Send + 'static,
    {
        let key = key.as_ref();
        let mut removed = Vec::new();
        let pending = {
            let mut state = self.inner.state.lock();
            state.sketch.increment(key);

            if let Some(entry) = state.lookup(key, self.inner.ttl, &mut removed) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                drop(state);
                self.inner.count_removed(&removed);
                return Ok(entry);
            }

            match state.in_flight.get(key) {
                Some(pending) => pending.clone(),
                None => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let task = tokio::spawn(build(
                        self.inner.clone(),
                        key.to_vec(),
                        remote,
                        construct(),
                    ));
                    let pending: Pending<P, E> =
                        async move { task.await.unwrap_or_else(|e| Err(E::from(e))) }
                            .boxed()
                            .shared();
                    state.in_flight.insert(key.to_vec(), pending.clone());
                    pending
                }
            }
        };
        self.inner.count_removed(&removed);
        drop(removed);

        pending.await
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = Vec::new();
        self.inner.state.lock().purge_expired(self.inner.ttl, &mut removed);
        self.inner.count_removed(&removed);
        removed.len()
    }

    /// Drop every resident entry
    pub fn clear(&self) -> usize {
        let removed: Vec<Handle<P>> = {
            let mut state = self.inner.state.lock();
            let mut removed = Vec::with_capacity(state.resident.len());
            while let Some((_, entry)) = state.resident.pop_lru() {
                removed.push(entry);
            }
            removed
        };
        self.inner.count_removed(&removed);
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        self.inner.state.lock().resident.contains(key.as_ref())
    }

    pub fn stats(&self) -> CacheStats {
        let (resident, in_flight) = {
            let state = self.inner.state.lock();
            (state.resident.len(), state.in_flight.len())
        };
        CacheStats {
            resident,
            capacity: self.inner.capacity,
            in_flight,
            ttl_secs: self.inner.ttl.as_secs(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
        }
    }

    /// Periodically remove expired entries until the cache is dropped
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner<P, E>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let removed = PublicationCache { inner }.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired publications");
                }
            }
        })
    }
}

/// Construction task: run the future, then admit the result
async fn build<P, E, Fut>(inner: Arc<Inner<P, E>>, key: Vec<u8>, remote: bool, construct: Fut) -> Result<Handle<P>, E>
where
    P: Release,
    Fut: Future<Output = Result<P, E>>,
{
    let mut guard = InFlightGuard {
        inner: inner.clone(),
        key,
        armed: true,
    };

    let result = construct.await;

    let mut removed = Vec::new();
    let outcome = {
        let mut state = inner.state.lock();
        state.in_flight.remove(&guard.key);
        guard.armed = false;

        match result {
            Ok(publication) => {
                let entry = Arc::new(CachedPublication::new(publication, remote));
                let admitted = state.admit(
                    guard.key.clone(),
                    entry.clone(),
                    inner.capacity,
                    inner.ttl,
                    &mut removed,
                );
                if !admitted {
                    inner.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %String::from_utf8_lossy(&guard.key), "Publication not admitted to cache");
                }
                Ok(entry)
            }
            // Failures are never cached, the next request tries again
            Err(e) => Err(e),
        }
    };
    inner.count_removed(&removed);
    drop(removed);

    outcome
}

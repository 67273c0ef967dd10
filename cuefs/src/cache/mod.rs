//! Materialization cache.
//!
//! Maps a synthetic track's virtual path to its built artifact and
//! coordinates concurrent readers:
//!
//! - at most one build runs per key; every concurrent `acquire` of the
//!   same key waits on the in-flight build and receives the same artifact,
//! - artifacts referenced by an open handle are pinned and never evicted,
//! - total resident bytes are bounded: an insertion that would exceed the
//!   budget first evicts unpinned entries in LRU order until the newcomer
//!   fits; if everything left is pinned the newcomer is admitted anyway
//!   and marked for eviction on its last release,
//! - failed builds are remembered for a short TTL so a broken album does
//!   not get rebuilt on every open,
//! - a semaphore bounds how many builds run at once; excess builds queue
//!   FIFO.
//!
//! Builds run in spawned tasks: a caller that goes away while waiting
//! does not abort the build for the remaining waiters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

/// Default artifact byte budget (256 MiB).
pub const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Default TTL for remembered failures.
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(15);

/// An immutable, fully materialized FLAC stream.
#[derive(Debug)]
pub struct Artifact {
    bytes: Vec<u8>,
}

impl Artifact {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Cache sizing and policy knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for resident artifacts.
    pub max_bytes: u64,
    /// Maximum concurrent materializations.
    pub max_builds: usize,
    /// How long a failed build is remembered.
    pub failure_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_builds: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            failure_ttl: DEFAULT_FAILURE_TTL,
        }
    }
}

/// Acquire failure, surfaced to the reader as an I/O error.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("materialization failed: {0}")]
    BuildFailed(String),

    #[error("materialization recently failed: {0}")]
    RecentFailure(String),
}

/// Point-in-time counters, mirrored from atomics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub evictions: u64,
    pub resident_bytes: u64,
    pub entry_count: u64,
}

type BuildOutcome = Result<Arc<Artifact>, String>;

enum Entry {
    /// A build is in flight; senders are woken when it settles.
    Building {
        waiters: Vec<oneshot::Sender<BuildOutcome>>,
    },
    Ready {
        artifact: Arc<Artifact>,
        refcount: usize,
        last_used: Instant,
        evict_on_release: bool,
    },
    Failed {
        message: String,
        expires_at: Instant,
    },
}

struct Inner {
    entries: HashMap<String, Entry>,
    resident_bytes: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    build_sem: Arc<Semaphore>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    evictions: AtomicU64,
}

/// The artifact cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ArtifactCache {
    shared: Arc<Shared>,
}

impl ArtifactCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    entries: HashMap::new(),
                    resident_bytes: 0,
                }),
                build_sem: Arc::new(Semaphore::new(config.max_builds.max(1))),
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                builds: AtomicU64::new(0),
                build_failures: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Get the artifact for `key`, building it via `build` on a miss.
    ///
    /// On success the artifact is pinned for the caller; every successful
    /// `acquire` must be paired with one [`release`](Self::release).
    pub async fn acquire<F, Fut, E>(&self, key: &str, build: F) -> Result<Arc<Artifact>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let (tx, rx) = oneshot::channel();
        let mut tx_slot = Some(tx);
        let start_build = {
            let shared = &self.shared;
            let mut inner = shared.inner.lock();
            let start = match inner.entries.get_mut(key) {
                Some(Entry::Ready {
                    artifact,
                    refcount,
                    last_used,
                    ..
                }) => {
                    *refcount += 1;
                    *last_used = Instant::now();
                    shared.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(artifact));
                }
                Some(Entry::Building { waiters }) => {
                    waiters.push(tx_slot.take().expect("sender is still available"));
                    shared.hits.fetch_add(1, Ordering::Relaxed);
                    false
                }
                Some(Entry::Failed {
                    message,
                    expires_at,
                }) => {
                    if Instant::now() < *expires_at {
                        return Err(CacheError::RecentFailure(message.clone()));
                    }
                    // negative entry expired, rebuild
                    true
                }
                None => true,
            };
            if start {
                shared.misses.fetch_add(1, Ordering::Relaxed);
                inner.entries.insert(
                    key.to_string(),
                    Entry::Building {
                        waiters: vec![tx_slot.take().expect("sender is still available")],
                    },
                );
            }
            start
        };

        if start_build {
            let shared = Arc::clone(&self.shared);
            let key = key.to_string();
            tokio::spawn(async move {
                // FIFO backpressure on concurrent materializations
                let _permit = shared
                    .build_sem
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("build semaphore is never closed");
                let result = build().await;
                settle(&shared, &key, result.map_err(|e| e.to_string()));
            });
        }

        match rx.await {
            Ok(Ok(artifact)) => Ok(artifact),
            Ok(Err(message)) => Err(CacheError::BuildFailed(message)),
            Err(_) => Err(CacheError::BuildFailed(
                "materialization task vanished".to_string(),
            )),
        }
    }

    /// Drop one pin of `key`. The artifact stays cached (unpinned) unless
    /// it was admitted over budget, in which case its last release evicts
    /// it immediately.
    pub fn release(&self, key: &str) {
        let mut inner = self.shared.inner.lock();
        match inner.entries.get_mut(key) {
            Some(Entry::Ready {
                artifact,
                refcount,
                last_used,
                evict_on_release,
            }) => {
                *refcount = refcount.saturating_sub(1);
                *last_used = Instant::now();
                if *refcount == 0 && *evict_on_release {
                    let len = artifact.len();
                    inner.entries.remove(key);
                    inner.resident_bytes -= len;
                    self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => warn!(key, "release of an artifact that is not resident"),
        }
    }

    /// Exact size of a settled artifact, without touching its pin count
    /// or recency. Used for authoritative `getattr` sizes.
    pub fn ready_size(&self, key: &str) -> Option<u64> {
        let inner = self.shared.inner.lock();
        match inner.entries.get(key) {
            Some(Entry::Ready { artifact, .. }) => Some(artifact.len()),
            _ => None,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        let inner = shared.inner.lock();
        CacheStats {
            hits: shared.hits.load(Ordering::Relaxed),
            misses: shared.misses.load(Ordering::Relaxed),
            builds: shared.builds.load(Ordering::Relaxed),
            build_failures: shared.build_failures.load(Ordering::Relaxed),
            evictions: shared.evictions.load(Ordering::Relaxed),
            resident_bytes: inner.resident_bytes,
            entry_count: inner.entries.len() as u64,
        }
    }
}

/// Transition a `Building` entry to `Ready` or `Failed` and wake waiters.
fn settle(shared: &Arc<Shared>, key: &str, result: Result<Vec<u8>, String>) {
    let mut inner = shared.inner.lock();
    let waiters = match inner.entries.remove(key) {
        Some(Entry::Building { waiters }) => waiters,
        // cannot happen: only the builder settles its own entry
        _ => Vec::new(),
    };

    match result {
        Ok(bytes) => {
            shared.builds.fetch_add(1, Ordering::Relaxed);
            let artifact = Arc::new(Artifact { bytes });
            let len = artifact.len();

            let evict_on_release = make_room(shared, &mut inner, len);

            let mut served = 0usize;
            for tx in waiters {
                if tx.send(Ok(Arc::clone(&artifact))).is_ok() {
                    served += 1;
                }
            }

            if served == 0 && evict_on_release {
                // nothing will ever release it, so it never becomes resident
                shared.evictions.fetch_add(1, Ordering::Relaxed);
                return;
            }

            inner.resident_bytes += len;
            inner.entries.insert(
                key.to_string(),
                Entry::Ready {
                    artifact,
                    refcount: served,
                    last_used: Instant::now(),
                    evict_on_release,
                },
            );
        }
        Err(message) => {
            shared.build_failures.fetch_add(1, Ordering::Relaxed);
            for tx in waiters {
                let _ = tx.send(Err(message.clone()));
            }
            inner.entries.insert(
                key.to_string(),
                Entry::Failed {
                    expires_at: Instant::now() + shared.config.failure_ttl,
                    message,
                },
            );
        }
    }
}

/// Evict unpinned entries, oldest first, until the incoming artifact
/// fits within the budget. Returns whether the newcomer must be marked
/// evict-on-release because everything left is pinned and it still does
/// not fit.
fn make_room(shared: &Arc<Shared>, inner: &mut Inner, incoming_len: u64) -> bool {
    while inner.resident_bytes + incoming_len > shared.config.max_bytes {
        let victim = inner
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Ready {
                    refcount: 0,
                    last_used,
                    ..
                } => Some((key.clone(), *last_used)),
                _ => None,
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(key, _)| key);

        match victim {
            Some(key) => {
                if let Some(Entry::Ready { artifact, .. }) = inner.entries.remove(&key) {
                    inner.resident_bytes -= artifact.len();
                    shared.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "evicted artifact");
                }
            }
            // everything left is pinned or building
            None => break,
        }
    }

    inner.resident_bytes + incoming_len > shared.config.max_bytes
}

//! Result cache for completed task calls.
//!
//! Keys are a task name plus a canonical form of its target items. Storage is
//! split across independently locked shards, each bounded by LRU eviction,
//! with an optional TTL.

use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::types::TaskResult;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Default maximum number of cached results.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Cache key: task name plus canonical item key.
///
/// Items are opaque: they are trimmed, de-duplicated and sorted but keep
/// their case, so `["TP53", " BRCA1"]` and `["BRCA1", "TP53"]` hit the same
/// entry while `"tp53"` does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    task: String,
    items: Vec<String>,
}

impl CacheKey {
    pub fn new<S: AsRef<str>>(task: &str, items: &[S]) -> Self {
        let items: BTreeSet<String> = items
            .iter()
            .map(|item| item.as_ref().trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        Self {
            task: task.trim().to_string(),
            items: items.into_iter().collect(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// The canonical item key: sorted items joined by `,`.
    pub fn item_key(&self) -> String {
        self.items.join(",")
    }

    /// Hex SHA-256 of the key, stable across processes. Used in logs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.task.as_bytes());
        hasher.update([0x1f]);
        for item in &self.items {
            hasher.update(item.as_bytes());
            hasher.update([0x1e]);
        }
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.task, self.item_key())
    }
}

/// Configuration for the result cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries across all shards.
    pub max_entries: usize,
    /// Entries older than this are treated as absent. `None` keeps entries
    /// until evicted.
    pub ttl: Option<Duration>,
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: None,
            shards: DEFAULT_SHARDS,
        }
    }
}

impl CacheConfig {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries_added: u64,
    /// Entries removed by the LRU bound or by TTL expiry.
    pub entries_evicted: u64,
    /// Entries currently held.
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if no accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    result: TaskResult,
    inserted_at: Instant,
    last_accessed: u64,
}

type Shard = Mutex<HashMap<CacheKey, CacheEntry>>;

/// Sharded, bounded store of completed task results.
#[derive(Debug)]
pub struct ResultCache {
    shards: Vec<Shard>,
    shard_capacity: usize,
    config: CacheConfig,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    added: AtomicU64,
    evicted: AtomicU64,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::with_config(CacheConfig::default())
    }
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_config(CacheConfig::new(max_entries))
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let max_entries = config.max_entries.max(1);
        let shard_count = config.shards.clamp(1, max_entries);
        let shard_capacity = max_entries.div_ceil(shard_count);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            shard_capacity,
            config,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            added: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Look up a cached result, refreshing its LRU position.
    pub fn get(&self, key: &CacheKey) -> Option<TaskResult> {
        let tick = self.tick();
        let mut shard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);

        let expired = match shard.get_mut(key) {
            Some(entry) => {
                if !self.is_expired(entry) {
                    entry.last_accessed = tick;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            shard.remove(key);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result, evicting the shard's least recently used entry when
    /// the shard is full.
    pub fn insert(&self, key: CacheKey, result: TaskResult) {
        let tick = self.tick();
        let mut shard = self.shard(&key).lock().unwrap_or_else(PoisonError::into_inner);

        if !shard.contains_key(&key) {
            if let Some(ttl) = self.config.ttl {
                let before = shard.len();
                shard.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
                self.evicted
                    .fetch_add((before - shard.len()) as u64, Ordering::Relaxed);
            }
            while shard.len() >= self.shard_capacity {
                let oldest = shard
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_accessed)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        shard.remove(&k);
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }

        shard.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                last_accessed: tick,
            },
        );
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries_added: self.added.load(Ordering::Relaxed),
            entries_evicted: self.evicted.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn shard(&self, key: &CacheKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.config
            .ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

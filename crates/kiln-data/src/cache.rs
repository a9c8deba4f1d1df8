use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use kiln_types::KilnResult;
use parking_lot::RwLock;

use crate::loaders::load_table;

/// Cached table with access bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry {
    table: Arc<RecordBatch>,
    last_accessed: u64,
    access_count: u64,
}

/// In-memory cache of loaded tables, keyed by canonical file path.
///
/// Every trial of a search reads the same dataset; the cache makes sure it
/// is parsed once and shared as an `Arc<RecordBatch>`.
#[derive(Debug)]
pub struct TableCache {
    cache: DashMap<PathBuf, RwLock<CacheEntry>>,
    max_entries: usize,
    clock: AtomicU64,
    stats: RwLock<CacheStats>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::with_limit(16)
    }

    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn key_for(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn get(&self, path: &Path) -> Option<Arc<RecordBatch>> {
        let key = Self::key_for(path);
        if let Some(entry_lock) = self.cache.get(&key) {
            let mut entry = entry_lock.write();
            entry.last_accessed = self.tick();
            entry.access_count += 1;
            self.stats.write().hits += 1;
            return Some(entry.table.clone());
        }

        self.stats.write().misses += 1;
        None
    }

    pub fn insert(&self, path: &Path, table: Arc<RecordBatch>) {
        let key = Self::key_for(path);
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_entries {
            self.evict_lru();
        }

        let rows = table.num_rows() as u64;
        self.cache.insert(
            key,
            RwLock::new(CacheEntry {
                table,
                last_accessed: self.tick(),
                access_count: 0,
            }),
        );

        let mut stats = self.stats.write();
        stats.stores += 1;
        stats.total_rows_cached += rows;
    }

    /// Return the cached table for `path`, loading it on a miss.
    pub fn load(&self, path: &Path) -> KilnResult<Arc<RecordBatch>> {
        if let Some(table) = self.get(path) {
            return Ok(table);
        }

        let table = Arc::new(load_table(path)?);
        self.insert(path, table.clone());
        Ok(table)
    }

    /// Evict the least recently used entry
    fn evict_lru(&self) {
        let oldest = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().read().last_accessed))
            .min_by_key(|(_, accessed)| *accessed)
            .map(|(key, _)| key);

        if let Some(key) = oldest {
            if let Some((_, entry_lock)) = self.cache.remove(&key) {
                let entry = entry_lock.into_inner();
                let mut stats = self.stats.write();
                stats.evictions += 1;
                stats.total_rows_cached = stats
                    .total_rows_cached
                    .saturating_sub(entry.table.num_rows() as u64);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&self) {
        self.cache.clear();
        *self.stats.write() = CacheStats::default();
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl Default for TableCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub total_rows_cached: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

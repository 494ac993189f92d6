//! Manager: owns the bucket map, answers lookups, applies prefix trims,
//! writes back extended entries, and evicts under byte and TTL bounds.
//!
//! All state mutation is serialized behind a single async mutex. Tensor
//! `append`/`trim` work happens on request-owned handles outside the lock;
//! only table membership, timestamps, and byte totals are guarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::entry::{common_prefix_length, CacheEntry};
use crate::cache::key;
use crate::cache::layer::Layer;
use crate::cache::promoter;
use crate::config::{CacheConfig, GenerationParams};

/// An exclusively-owned reference to a bucket's layer sequence, handed to a
/// request between [`Manager::lookup`] and [`Manager::write_back`]. The
/// manager holds no aliasing reference while a handle is outstanding.
#[derive(Debug)]
pub struct CacheHandle {
    pub key: String,
    pub tokens: Vec<u32>,
    pub layers: Vec<Layer>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    total_tokens_reused: u64,
    total_tokens_processed: u64,
}

impl Counters {
    fn snapshot(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate: if total == 0 {
                0.0
            } else {
                self.hits as f64 / total as f64
            },
            total_tokens_reused: self.total_tokens_reused,
            total_tokens_processed: self.total_tokens_processed,
            average_tokens_reused: if self.hits == 0 {
                0.0
            } else {
                self.total_tokens_reused as f64 / self.hits as f64
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub total_tokens_reused: u64,
    pub total_tokens_processed: u64,
    pub average_tokens_reused: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub entry_count: usize,
    pub current_size_mb: f64,
    pub max_size_mb: usize,
    pub ttl_minutes: u64,
    pub stats: CacheStats,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    counters: Counters,
}

impl Inner {
    fn sweep_expired(&mut self, now: Instant, ttl: Duration) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.valid_at(now, ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            if let Some(e) = self.entries.remove(&k) {
                tracing::debug!(key = %k, "evicting expired cache entry");
                self.total_bytes = self.total_bytes.saturating_sub(e.bytes);
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed_at)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(k) => {
                if let Some(e) = self.entries.remove(&k) {
                    self.total_bytes = self.total_bytes.saturating_sub(e.bytes);
                    self.counters.evictions += 1;
                    tracing::debug!(key = %k, "evicted cache entry under byte pressure");
                }
                true
            }
            None => false,
        }
    }
}

/// Process-wide prompt-prefix cache. If `enable_cache` is false at
/// construction, every lookup is a pass-through miss and write-back is a
/// no-op, matching the null-manager behavior required by configuration.
pub struct Manager {
    inner: Mutex<Inner>,
    enable_cache: bool,
    max_bytes: usize,
    ttl: Duration,
}

impl Manager {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_bytes: 0,
                counters: Counters::default(),
            }),
            enable_cache: config.enable_cache,
            max_bytes: config.max_bytes(),
            ttl: config.ttl(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enable_cache
    }

    /// Detach and return the longest reusable prefix for `(model, tokens,
    /// params)`. On hit, the returned handle is the entry's layer sequence,
    /// removed from the table until the matching `write_back`.
    pub async fn lookup(
        &self,
        model: &str,
        tokens: &[u32],
        params: &GenerationParams,
    ) -> (Vec<u32>, Option<CacheHandle>) {
        if !self.enable_cache {
            return (tokens.to_vec(), None);
        }

        let bucket = key::compose(model, params);
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.sweep_expired(now, self.ttl);

        let Some(mut entry) = inner.entries.remove(&bucket) else {
            inner.counters.misses += 1;
            inner.counters.total_tokens_processed += tokens.len() as u64;
            return (tokens.to_vec(), None);
        };
        inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);

        let max_p = tokens.len().saturating_sub(1);
        let p = common_prefix_length(&entry.tokens, tokens).min(max_p);

        if p == 0 {
            inner.counters.misses += 1;
            inner.counters.total_tokens_processed += tokens.len() as u64;
            tracing::debug!(key = %bucket, "cache miss: no usable common prefix");
            return (tokens.to_vec(), None);
        }

        let d = entry.tokens.len() - p;
        if d > 0 {
            for layer in entry.layers.iter_mut() {
                if let Err(err) = layer.trim(d) {
                    inner.counters.misses += 1;
                    inner.counters.total_tokens_processed += tokens.len() as u64;
                    tracing::debug!(key = %bucket, error = %err, "trim refused, treating as cache miss");
                    return (tokens.to_vec(), None);
                }
            }
        }

        entry.tokens.truncate(p);
        entry.touch(now);
        entry.recompute_bytes();

        inner.counters.hits += 1;
        inner.counters.total_tokens_reused += p as u64;
        inner.counters.total_tokens_processed += (tokens.len() - p) as u64;

        let suffix = tokens[p..].to_vec();
        let handle = CacheHandle {
            key: bucket,
            tokens: entry.tokens,
            layers: entry.layers,
        };
        (suffix, Some(handle))
    }

    /// Re-attach a handle under its bucket key, applying quantization
    /// promotion first and evicting by LRU until the byte bound holds.
    pub async fn write_back(
        &self,
        model: &str,
        full_tokens: Vec<u32>,
        mut handle: CacheHandle,
        params: &GenerationParams,
    ) {
        if !self.enable_cache {
            return;
        }

        let bucket = key::compose(model, params);
        debug_assert_eq!(bucket, handle.key, "write_back bucket must match the handle it was issued for");

        let promoted = promoter::promote_layers(&mut handle.layers, params);
        if promoted > 0 {
            tracing::info!(promoted, key = %bucket, "promoted dense KV layers to quantized storage");
        }

        let now = Instant::now();
        let new_entry = CacheEntry::new(bucket.clone(), full_tokens, handle.layers, now);

        let mut inner = self.inner.lock().await;
        if let Some(prior) = inner.entries.remove(&bucket) {
            inner.total_bytes = inner.total_bytes.saturating_sub(prior.bytes);
        }

        while inner.total_bytes + new_entry.bytes > self.max_bytes && inner.evict_oldest() {}

        inner.total_bytes += new_entry.bytes;
        inner.entries.insert(bucket, new_entry);
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        inner.counters.snapshot()
    }

    pub async fn status(&self) -> CacheStatus {
        let inner = self.inner.lock().await;
        CacheStatus {
            enabled: self.enable_cache,
            entry_count: inner.entries.len(),
            current_size_mb: inner.total_bytes as f64 / (1024.0 * 1024.0),
            max_size_mb: self.max_bytes / (1024 * 1024),
            ttl_minutes: self.ttl.as_secs() / 60,
            stats: inner.counters.snapshot(),
        }
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Test-only seam: insert an entry directly, bypassing `write_back`, so
    /// TTL and eviction scenarios can set up state without a full begin/end
    /// round trip through the promoter.
    #[cfg(test)]
    async fn inject_for_test(&self, entry: CacheEntry) {
        let mut inner = self.inner.lock().await;
        inner.total_bytes += entry.bytes;
        inner.entries.insert(entry.key.clone(), entry);
    }
}

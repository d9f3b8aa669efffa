//! Cache statistics.
//!
//! Counters live behind shared handles owned by the cache tier; drivers
//! snapshot them into a serializable report and print it through whatever
//! sink they use. Nothing here is module-level state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct CacheStats {
    pub bitmap_hit: AtomicU64,
    pub bitmap_miss: AtomicU64,
    pub index_hit: AtomicU64,
    pub index_miss: AtomicU64,
    pub edge_hit: AtomicU64,
    pub edge_miss: AtomicU64,
}

impl CacheStats {
    pub fn handle() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            bitmap_hits: self.bitmap_hit.load(Ordering::Relaxed),
            bitmap_misses: self.bitmap_miss.load(Ordering::Relaxed),
            index_hits: self.index_hit.load(Ordering::Relaxed),
            index_misses: self.index_miss.load(Ordering::Relaxed),
            edge_hits: self.edge_hit.load(Ordering::Relaxed),
            edge_misses: self.edge_miss.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.bitmap_hit,
            &self.bitmap_miss,
            &self.index_hit,
            &self.index_miss,
            &self.edge_hit,
            &self.edge_miss,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of one direction's cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMetrics {
    pub bitmap_hits: u64,
    pub bitmap_misses: u64,
    pub index_hits: u64,
    pub index_misses: u64,
    pub edge_hits: u64,
    pub edge_misses: u64,
}

impl CacheMetrics {
    pub fn edge_hit_rate(&self) -> f64 {
        let total = self.edge_hits + self.edge_misses;
        if total == 0 {
            0.0
        } else {
            self.edge_hits as f64 / total as f64
        }
    }
}

/// Both directions' counters for one rank.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineMetrics {
    pub outgoing: CacheMetrics,
    pub incoming: CacheMetrics,
}

impl EngineMetrics {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn print_report(&self) {
        println!("=== Cache Metrics ===");
        for (name, m) in [("outgoing", &self.outgoing), ("incoming", &self.incoming)] {
            println!("[{name}]");
            println!("  Bitmap Hits:    {}", m.bitmap_hits);
            println!("  Bitmap Misses:  {}", m.bitmap_misses);
            println!("  Index Hits:     {}", m.index_hits);
            println!("  Index Misses:   {}", m.index_misses);
            println!("  Edge Hits:      {}", m.edge_hits);
            println!("  Edge Misses:    {}", m.edge_misses);
            println!("  Edge Hit Rate:  {:.2}%", m.edge_hit_rate() * 100.0);
        }
    }
}

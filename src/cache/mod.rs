//! Three-tier cache hiding far-memory adjacency latency.
//!
//! Per delegated far partition and socket: a full copy of the remote
//! adjacency bitmap, a full copy of the remote index, and a direct-mapped
//! edge cache fed by the prefetcher. Bitmap and index copies are pulled
//! once right after load under a transient window lock; the list window
//! stays shared-locked for the lifetime of the computation.

pub mod edge_cache;
pub mod prefetch;

use std::sync::Arc;

use crate::cluster::{Direction, SharedLock, Window, WindowKey, WindowKind, WindowRegistry};
use crate::config::GraphConfig;
use crate::error::Result;
use crate::metrics::CacheStats;
use crate::types::VertexId;

pub use edge_cache::EdgeCache;
pub use prefetch::{PrefetchRequest, Prefetcher};

#[derive(Debug)]
pub struct CacheTier {
    sockets: usize,
    bitmap_cache: Vec<Vec<Option<Arc<Vec<u64>>>>>,
    index_cache: Vec<Vec<Option<Arc<Vec<u64>>>>>,
    edge_cache: Vec<Vec<Option<Arc<EdgeCache>>>>,
    bitmap_windows: Vec<Vec<Option<Arc<Window>>>>,
    index_windows: Vec<Vec<Option<Arc<Window>>>>,
    list_windows: Vec<Vec<Option<Arc<Window>>>>,
    list_locks: Vec<SharedLock>,
    pub stats: Arc<CacheStats>,
}

impl CacheTier {
    pub fn new(partitions: usize, sockets: usize) -> Self {
        let grid = || (0..partitions).map(|_| vec![None; sockets]).collect();
        let grid_w = || (0..partitions).map(|_| vec![None; sockets]).collect();
        Self {
            sockets,
            bitmap_cache: grid(),
            index_cache: grid(),
            edge_cache: (0..partitions).map(|_| vec![None; sockets]).collect(),
            bitmap_windows: grid_w(),
            index_windows: grid_w(),
            list_windows: (0..partitions).map(|_| vec![None; sockets]).collect(),
            list_locks: Vec::new(),
            stats: CacheStats::handle(),
        }
    }

    /// Wires this tier to far partition `fp`: resolves its windows, takes
    /// the long-lived shared lock on the list, and pulls the bitmap and
    /// index copies in one read each.
    pub fn attach_far_partition(
        &mut self,
        registry: &WindowRegistry,
        fp: usize,
        dir: Direction,
        config: &GraphConfig,
    ) -> Result<()> {
        for s in 0..self.sockets {
            let key = |kind| WindowKey {
                partition: fp,
                socket: s,
                dir,
                kind,
            };
            let bitmap_win = registry.get(key(WindowKind::Bitmap))?;
            if config.bitmap_cache {
                let lock = bitmap_win.lock_shared();
                self.bitmap_cache[fp][s] = Some(Arc::new(bitmap_win.read_all_words()));
                drop(lock);
            }
            let index_win = registry.get(key(WindowKind::Index))?;
            if config.index_cache {
                let lock = index_win.lock_shared();
                self.index_cache[fp][s] = Some(Arc::new(index_win.read_all_words()));
                drop(lock);
            }
            let list_win = registry.get(key(WindowKind::List))?;
            self.list_locks.push(list_win.lock_shared());
            self.bitmap_windows[fp][s] = Some(bitmap_win);
            self.index_windows[fp][s] = Some(index_win);
            self.list_windows[fp][s] = Some(list_win);
            if config.edge_cache {
                self.edge_cache[fp][s] =
                    Some(Arc::new(EdgeCache::new(config.edge_cache_entries)));
            }
        }
        Ok(())
    }

    /// Bitmap word covering `v` on far partition `fp`, socket `s`.
    pub fn bitmap_word(&self, fp: usize, s: usize, v: VertexId) -> u64 {
        use std::sync::atomic::Ordering::Relaxed;
        let word = (v as usize) >> 6;
        if let Some(cached) = &self.bitmap_cache[fp][s] {
            self.stats.bitmap_hit.fetch_add(1, Relaxed);
            cached[word]
        } else {
            self.stats.bitmap_miss.fetch_add(1, Relaxed);
            let win = self.bitmap_windows[fp][s].as_ref().expect("far window");
            let lock = win.lock_shared();
            let w = win.read_word(word);
            drop(lock);
            w
        }
    }

    pub fn bit_set(&self, fp: usize, s: usize, v: VertexId) -> bool {
        self.bitmap_word(fp, s, v) & (1u64 << (v & 63)) != 0
    }

    /// Index pair `[idx0, idx1)` of `v` on far partition `fp`.
    pub fn index_pair(&self, fp: usize, s: usize, v: VertexId) -> (u64, u64) {
        use std::sync::atomic::Ordering::Relaxed;
        if let Some(cached) = &self.index_cache[fp][s] {
            self.stats.index_hit.fetch_add(1, Relaxed);
            (cached[v as usize], cached[v as usize + 1])
        } else {
            self.stats.index_miss.fetch_add(1, Relaxed);
            let win = self.index_windows[fp][s].as_ref().expect("far window");
            let lock = win.lock_shared();
            let pair = win.read_words(v as usize, 2);
            drop(lock);
            (pair[0], pair[1])
        }
    }

    pub fn edge_cache_of(&self, fp: usize, s: usize) -> Option<&Arc<EdgeCache>> {
        self.edge_cache[fp][s].as_ref()
    }

    /// Shared list-window locks currently held; one per attached
    /// `(partition, socket)`.
    pub fn held_list_locks(&self) -> usize {
        self.list_locks.len()
    }

    pub fn list_window(&self, fp: usize, s: usize) -> &Arc<Window> {
        self.list_windows[fp][s].as_ref().expect("far window")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encode_slice;

    fn registry_with_far(fp: usize, sockets: usize) -> WindowRegistry {
        let reg = WindowRegistry::new();
        for s in 0..sockets {
            let key = |kind| WindowKey {
                partition: fp,
                socket: s,
                dir: Direction::Outgoing,
                kind,
            };
            // Bit 3 set; vertex 3 owns records [2, 5).
            reg.publish_words(key(WindowKind::Bitmap), vec![0b1000u64].into());
            reg.publish_words(key(WindowKind::Index), vec![0u64, 2, 2, 2, 5, 5].into());
            let list: Arc<[u8]> = encode_slice(&[10u32, 11, 12, 13, 14]).into();
            reg.publish_bytes(key(WindowKind::List), list);
        }
        reg
    }

    #[test]
    fn cached_lookups_count_hits() {
        let reg = registry_with_far(2, 1);
        let mut tier = CacheTier::new(3, 1);
        tier.attach_far_partition(&reg, 2, Direction::Outgoing, &GraphConfig::default())
            .unwrap();
        assert!(tier.bit_set(2, 0, 3));
        assert!(!tier.bit_set(2, 0, 1));
        assert_eq!(tier.index_pair(2, 0, 3), (2, 5));
        assert_eq!(tier.held_list_locks(), 1);
        let snap = tier.stats.snapshot();
        assert_eq!(snap.bitmap_hits, 2);
        assert_eq!(snap.index_hits, 1);
        assert_eq!(snap.bitmap_misses + snap.index_misses, 0);
    }

    #[test]
    fn disabled_caches_fall_back_to_windows() {
        let reg = registry_with_far(1, 1);
        let mut tier = CacheTier::new(2, 1);
        tier.attach_far_partition(&reg, 1, Direction::Outgoing, &GraphConfig::cache_off())
            .unwrap();
        assert!(tier.bit_set(1, 0, 3));
        assert_eq!(tier.index_pair(1, 0, 3), (2, 5));
        assert!(tier.edge_cache_of(1, 0).is_none());
        let snap = tier.stats.snapshot();
        assert_eq!(snap.bitmap_misses, 1);
        assert_eq!(snap.index_misses, 1);
    }
}

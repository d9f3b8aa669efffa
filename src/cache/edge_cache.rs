//! Direct-mapped edge cache.
//!
//! `K` slots per `(partition, socket)`. Source `v` maps to slot `v % K`;
//! the slot is a hit for `v` iff its tag equals `v + 1`, a tag of zero
//! means empty. A conflicting source simply overwrites the slot — tag
//! replacement is the only eviction.
//!
//! The prefetcher is the single writer. It stages the payload with the
//! tag cleared and publishes the tag once the drain round's reads are in
//! place, so a reader observing the tag also observes the bytes.

use parking_lot::RwLock;

use crate::types::VertexId;

#[derive(Debug)]
struct EdgeSlot {
    tag: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct EdgeCache {
    slots: Vec<RwLock<EdgeSlot>>,
}

impl EdgeCache {
    pub fn new(entries: usize) -> Self {
        assert!(entries > 0, "edge cache needs at least one slot");
        let slots = (0..entries)
            .map(|_| {
                RwLock::new(EdgeSlot {
                    tag: 0,
                    data: Vec::new(),
                })
            })
            .collect();
        Self { slots }
    }

    pub fn entries(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, v: VertexId) -> &RwLock<EdgeSlot> {
        &self.slots[v as usize % self.slots.len()]
    }

    fn tag_of(v: VertexId) -> u64 {
        v as u64 + 1
    }

    /// True when the slot currently holds `v`'s records.
    pub fn probe(&self, v: VertexId) -> bool {
        self.slot_of(v).read().tag == Self::tag_of(v)
    }

    /// Runs `f` over the cached bytes of `v` if present.
    pub fn with_cached<R>(&self, v: VertexId, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let slot = self.slot_of(v).read();
        if slot.tag == Self::tag_of(v) {
            Some(f(&slot.data))
        } else {
            None
        }
    }

    /// Writes `v`'s payload with the tag cleared; not yet visible to
    /// readers as a hit.
    pub fn stage(&self, v: VertexId, bytes: &[u8]) {
        let mut slot = self.slot_of(v).write();
        slot.tag = 0;
        slot.data.clear();
        slot.data.extend_from_slice(bytes);
    }

    /// Publishes a staged payload. A conflicting overwrite between stage
    /// and publish leaves the slot owned by the later writer.
    pub fn publish(&self, v: VertexId) {
        let mut slot = self.slot_of(v).write();
        if slot.tag == 0 {
            slot.tag = Self::tag_of(v);
        }
    }

    /// Stage and publish in one step.
    pub fn fill(&self, v: VertexId, bytes: &[u8]) {
        let mut slot = self.slot_of(v).write();
        slot.data.clear();
        slot.data.extend_from_slice(bytes);
        slot.tag = Self::tag_of(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_misses() {
        let cache = EdgeCache::new(8);
        assert!(!cache.probe(3));
        assert!(cache.with_cached(3, |_| ()).is_none());
    }

    #[test]
    fn fill_then_hit() {
        let cache = EdgeCache::new(8);
        cache.fill(3, &[1, 2, 3, 4]);
        assert!(cache.probe(3));
        assert_eq!(cache.with_cached(3, |b| b.to_vec()), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn conflicting_source_overwrites() {
        let cache = EdgeCache::new(8);
        cache.fill(3, &[1]);
        cache.fill(11, &[2]); // 11 % 8 == 3
        assert!(!cache.probe(3));
        assert!(cache.probe(11));
        assert_eq!(cache.with_cached(11, |b| b.to_vec()), Some(vec![2]));
    }

    #[test]
    fn staged_payload_is_invisible_until_published() {
        let cache = EdgeCache::new(4);
        cache.stage(2, &[9, 9]);
        assert!(!cache.probe(2));
        cache.publish(2);
        assert!(cache.probe(2));
        assert_eq!(cache.with_cached(2, |b| b.to_vec()), Some(vec![9, 9]));
    }

    #[test]
    fn vertex_zero_has_a_nonzero_tag() {
        let cache = EdgeCache::new(4);
        cache.fill(0, &[]);
        assert!(cache.probe(0));
    }
}

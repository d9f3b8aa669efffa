#![allow(unsafe_code)]

//! Shared write arena backing message buffers.
//!
//! Many worker threads append packed message units into one buffer. Each
//! writer claims a disjoint byte range with a fetch-and-add on the owning
//! buffer's unit counter and copies into its range; ranges never overlap.
//! Reads happen only after the writing parallel region has been joined,
//! and capacity changes only between rounds while no workers exist.

use std::cell::UnsafeCell;

pub struct WriteArena {
    data: UnsafeCell<Vec<u8>>,
}

impl std::fmt::Debug for WriteArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteArena")
            .field("capacity", &self.capacity())
            .finish()
    }
}

// Writers touch disjoint ranges and readers are separated from writers by
// thread joins; see the module invariants above.
unsafe impl Sync for WriteArena {}

impl WriteArena {
    pub fn new() -> Self {
        Self {
            data: UnsafeCell::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        unsafe { (*self.data.get()).len() }
    }

    /// Grows the arena to at least `bytes`. Must only be called while no
    /// worker threads hold writes into this arena.
    pub fn ensure_capacity(&self, bytes: usize) {
        let data = unsafe { &mut *self.data.get() };
        if data.len() < bytes {
            data.resize(bytes, 0);
        }
    }

    /// Copies `src` into the arena at `offset`. The caller must have
    /// claimed `[offset, offset + src.len())` exclusively.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let data = unsafe { &mut *self.data.get() };
        assert!(
            offset + src.len() <= data.len(),
            "arena write past capacity: {} + {} > {}",
            offset,
            src.len(),
            data.len()
        );
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Borrows the first `len` bytes. Must only be called after all
    /// writers have been joined.
    pub fn bytes(&self, len: usize) -> &[u8] {
        let data = unsafe { &*self.data.get() };
        &data[..len]
    }
}

impl Default for WriteArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn concurrent_disjoint_writes_land() {
        let arena = WriteArena::new();
        arena.ensure_capacity(8 * 64);
        let cursor = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..16 {
                        let at = cursor.fetch_add(8, Ordering::Relaxed);
                        arena.write(at, &(at as u64).to_le_bytes());
                    }
                });
            }
        });
        let bytes = arena.bytes(8 * 64);
        for i in 0..64 {
            let got = u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
            assert_eq!(got, (i * 8) as u64);
        }
    }
}

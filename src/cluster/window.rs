//! One-sided remote memory windows.
//!
//! A far-memory rank publishes each of its CSR arrays as a read-only
//! region; compute ranks read through the handle without involving the
//! owner. One window exists per `(partition, socket, direction, kind)` —
//! readers share the handle instead of holding one per thread. Delegates
//! take a shared lock on list windows for the lifetime of a computation;
//! bitmap and index windows are locked only around the startup bulk pull.
//!
//! Lists larger than the transport's ceiling would need per-segment
//! windows with offset routing; this transport has no ceiling, so a
//! single window per array is used.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{GraphError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Bitmap,
    Index,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub partition: usize,
    pub socket: usize,
    pub dir: Direction,
    pub kind: WindowKind,
}

#[derive(Debug)]
enum WindowPayload {
    Words(Arc<[u64]>),
    Bytes(Arc<[u8]>),
}

/// A published read-only region with a shared-lock reader count.
#[derive(Debug)]
pub struct Window {
    payload: WindowPayload,
    readers: AtomicUsize,
}

impl Window {
    fn words(&self) -> &[u64] {
        match &self.payload {
            WindowPayload::Words(w) => w,
            WindowPayload::Bytes(_) => panic!("word read on a byte window"),
        }
    }

    fn raw_bytes(&self) -> &[u8] {
        match &self.payload {
            WindowPayload::Bytes(b) => b,
            WindowPayload::Words(_) => panic!("byte read on a word window"),
        }
    }

    pub fn word_len(&self) -> usize {
        self.words().len()
    }

    pub fn byte_len(&self) -> usize {
        self.raw_bytes().len()
    }

    pub fn read_word(&self, offset: usize) -> u64 {
        debug_assert!(self.readers.load(Ordering::Relaxed) > 0, "unlocked read");
        self.words()[offset]
    }

    pub fn read_words(&self, offset: usize, len: usize) -> Vec<u64> {
        debug_assert!(self.readers.load(Ordering::Relaxed) > 0, "unlocked read");
        self.words()[offset..offset + len].to_vec()
    }

    pub fn read_all_words(&self) -> Vec<u64> {
        self.read_words(0, self.word_len())
    }

    pub fn read_bytes_into(&self, offset: usize, len: usize, out: &mut Vec<u8>) {
        debug_assert!(self.readers.load(Ordering::Relaxed) > 0, "unlocked read");
        out.clear();
        out.extend_from_slice(&self.raw_bytes()[offset..offset + len]);
    }

    pub fn lock_shared(self: &Arc<Self>) -> SharedLock {
        self.readers.fetch_add(1, Ordering::AcqRel);
        SharedLock {
            window: Arc::clone(self),
        }
    }
}

/// Guard for a held shared lock; dropping it releases the lock.
#[derive(Debug)]
pub struct SharedLock {
    window: Arc<Window>,
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        self.window.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct WindowRegistry {
    map: DashMap<WindowKey, Arc<Window>>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub fn publish_words(&self, key: WindowKey, words: Arc<[u64]>) {
        self.map.insert(
            key,
            Arc::new(Window {
                payload: WindowPayload::Words(words),
                readers: AtomicUsize::new(0),
            }),
        );
    }

    pub fn publish_bytes(&self, key: WindowKey, bytes: Arc<[u8]>) {
        self.map.insert(
            key,
            Arc::new(Window {
                payload: WindowPayload::Bytes(bytes),
                readers: AtomicUsize::new(0),
            }),
        );
    }

    /// Resolves a published window. Callers synchronize publication with
    /// a barrier first; a missing window is a protocol violation.
    pub fn get(&self, key: WindowKey) -> Result<Arc<Window>> {
        self.map
            .get(&key)
            .map(|w| Arc::clone(&w))
            .ok_or(GraphError::Protocol("window not published"))
    }
}

impl Default for WindowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: WindowKind) -> WindowKey {
        WindowKey {
            partition: 5,
            socket: 0,
            dir: Direction::Outgoing,
            kind,
        }
    }

    #[test]
    fn word_window_round_trips() {
        let reg = WindowRegistry::new();
        reg.publish_words(key(WindowKind::Index), vec![3u64, 7, 9].into());
        let win = reg.get(key(WindowKind::Index)).unwrap();
        let _lock = win.lock_shared();
        assert_eq!(win.read_words(1, 2), vec![7, 9]);
        assert_eq!(win.read_word(0), 3);
    }

    #[test]
    fn byte_window_reads_ranges() {
        let reg = WindowRegistry::new();
        reg.publish_bytes(key(WindowKind::List), vec![1u8, 2, 3, 4, 5].into());
        let win = reg.get(key(WindowKind::List)).unwrap();
        let _lock = win.lock_shared();
        let mut out = Vec::new();
        win.read_bytes_into(1, 3, &mut out);
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[test]
    fn unpublished_window_is_a_protocol_error() {
        let reg = WindowRegistry::new();
        assert!(reg.get(key(WindowKind::Bitmap)).is_err());
    }
}

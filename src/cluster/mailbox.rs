//! Tagged point-to-point transport between ranks.
//!
//! Every rank owns one mailbox. A send deposits the payload under
//! `(source, tag, label)` in the destination's mailbox; a receive blocks
//! until a matching payload arrives. The label carries the sub-stream a
//! message belongs to (a partition and socket during rounds, a slice
//! owner during gathers), so delivery order between streams is free.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    ShuffleGraph,
    PassMessage,
    GatherVertexArray,
    SyncBitmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MsgKey {
    from: usize,
    tag: Tag,
    label: u32,
}

#[derive(Default, Debug)]
struct Queues {
    by_key: HashMap<MsgKey, VecDeque<Vec<u8>>>,
}

#[derive(Debug)]
pub struct Mailbox {
    queues: Mutex<Queues>,
    arrived: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            arrived: Condvar::new(),
        }
    }

    pub fn deliver(&self, from: usize, tag: Tag, label: u32, payload: Vec<u8>) {
        let key = MsgKey { from, tag, label };
        let mut q = self.queues.lock();
        q.by_key.entry(key).or_default().push_back(payload);
        self.arrived.notify_all();
    }

    /// Blocks until a payload from `from` with `tag` and `label` arrives.
    pub fn recv(&self, from: usize, tag: Tag, label: u32) -> Vec<u8> {
        let key = MsgKey { from, tag, label };
        let mut q = self.queues.lock();
        loop {
            if let Some(queue) = q.by_key.get_mut(&key) {
                if let Some(payload) = queue.pop_front() {
                    return payload;
                }
            }
            self.arrived.wait(&mut q);
        }
    }

    /// Blocks until any payload with `tag` arrives, returning its source
    /// and label alongside the bytes.
    pub fn recv_any(&self, tag: Tag) -> (usize, u32, Vec<u8>) {
        let mut q = self.queues.lock();
        loop {
            let hit = q
                .by_key
                .iter_mut()
                .find(|(key, queue)| key.tag == tag && !queue.is_empty())
                .map(|(key, queue)| (key.from, key.label, queue.pop_front().unwrap()));
            if let Some(found) = hit {
                return found;
            }
            self.arrived.wait(&mut q);
        }
    }

    /// Blocks until a payload with `tag` and `label` arrives from any
    /// source. Labels keep interleaved phases from bleeding into each
    /// other's receive loops.
    pub fn recv_labeled(&self, tag: Tag, label: u32) -> (usize, Vec<u8>) {
        let mut q = self.queues.lock();
        loop {
            let hit = q
                .by_key
                .iter_mut()
                .find(|(key, queue)| key.tag == tag && key.label == label && !queue.is_empty())
                .map(|(key, queue)| (key.from, queue.pop_front().unwrap()));
            if let Some(found) = hit {
                return found;
            }
            self.arrived.wait(&mut q);
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

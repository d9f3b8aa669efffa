//! Message buffers and the delegation layout.
//!
//! Each `(partition, socket)` pair owns a send and a receive arena of
//! packed `(vertex, message)` units. Threads emit through a small private
//! scratch buffer and flush it into the shared arena at a position
//! claimed by fetch-and-add on the unit counter. A delegate's send buffer
//! is laid out as its own messages first (`owned_count`), followed by one
//! segment per delegated far partition, bounded by `delegated_start`.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::primitives::arena::WriteArena;
use crate::types::{msg_unit_size, Codec, VertexId};

#[derive(Debug)]
pub struct MessageBuffer {
    pub data: WriteArena,
    /// Units currently in the buffer.
    pub count: AtomicUsize,
    /// Units belonging to the owning partition itself.
    pub owned_count: AtomicUsize,
    /// Offset at which messages for partition `j` begin; entries for
    /// partitions this rank does not delegate are unused.
    pub delegated_start: Vec<AtomicUsize>,
}

impl MessageBuffer {
    pub fn new(partitions: usize) -> Self {
        Self {
            data: WriteArena::new(),
            count: AtomicUsize::new(0),
            owned_count: AtomicUsize::new(0),
            delegated_start: (0..=partitions).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Prepares the buffer for a round: grows the arena and zeroes the
    /// layout. Runs while no workers touch the buffer.
    pub fn reset(&self, capacity_bytes: usize) {
        self.data.ensure_capacity(capacity_bytes);
        self.count.store(0, Ordering::Relaxed);
        self.owned_count.store(0, Ordering::Relaxed);
        for d in &self.delegated_start {
            d.store(0, Ordering::Relaxed);
        }
    }

    pub fn units(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn owned(&self) -> usize {
        self.owned_count.load(Ordering::Relaxed)
    }

    pub fn seal_owned(&self) {
        self.owned_count
            .store(self.count.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn mark_delegated_start(&self, partition: usize) {
        self.delegated_start[partition].store(self.count.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn delegated_range(&self, partition: usize, next: usize) -> (usize, usize) {
        (
            self.delegated_start[partition].load(Ordering::Relaxed),
            self.delegated_start[next].load(Ordering::Relaxed),
        )
    }

    /// Installs received bytes wholesale; the payload must be an exact
    /// multiple of the unit size.
    pub fn install(&self, unit: usize, bytes: &[u8]) {
        assert!(
            bytes.len() % unit == 0,
            "received payload is not a unit multiple"
        );
        let n = bytes.len() / unit;
        self.data.ensure_capacity(bytes.len());
        self.data.write(0, bytes);
        self.count.store(n, Ordering::Relaxed);
        self.owned_count.store(n, Ordering::Relaxed);
    }
}

/// Decodes message unit `k` out of a packed buffer.
pub fn decode_msg<M: Codec>(bytes: &[u8], k: usize) -> (VertexId, M) {
    let unit = msg_unit_size::<M>();
    let at = k * unit;
    (
        u32::read(&bytes[at..at + 4]),
        M::read(&bytes[at + 4..at + unit]),
    )
}

/// Per-thread emit context handed to signal callbacks.
pub struct SignalCtx<'a, M: Codec> {
    target: &'a MessageBuffer,
    scratch: Vec<u8>,
    scratch_units: usize,
    limit: usize,
    _marker: PhantomData<M>,
}

impl<'a, M: Codec> SignalCtx<'a, M> {
    pub fn new(target: &'a MessageBuffer, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            target,
            scratch: vec![0u8; limit * msg_unit_size::<M>()],
            scratch_units: 0,
            limit,
            _marker: PhantomData,
        }
    }

    /// Emits a message toward `dst`'s adjacency owner.
    pub fn emit(&mut self, dst: VertexId, msg: M) {
        let unit = msg_unit_size::<M>();
        let at = self.scratch_units * unit;
        dst.write(&mut self.scratch[at..at + 4]);
        msg.write(&mut self.scratch[at + 4..at + unit]);
        self.scratch_units += 1;
        if self.scratch_units == self.limit {
            self.flush();
        }
    }

    /// Pushes the scratch into the shared buffer at a claimed position.
    pub fn flush(&mut self) {
        if self.scratch_units == 0 {
            return;
        }
        let unit = msg_unit_size::<M>();
        let pos = self
            .target
            .count
            .fetch_add(self.scratch_units, Ordering::Relaxed);
        self.target
            .data
            .write(pos * unit, &self.scratch[..self.scratch_units * unit]);
        self.scratch_units = 0;
    }
}

impl<M: Codec> Drop for SignalCtx<'_, M> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_flush_at_the_limit_and_on_drop() {
        let buf = MessageBuffer::new(2);
        buf.reset(64 * msg_unit_size::<u32>());
        {
            let mut ctx = SignalCtx::<u32>::new(&buf, 4);
            for v in 0..6u32 {
                ctx.emit(v, v * 10);
            }
            assert_eq!(buf.units(), 4);
        }
        assert_eq!(buf.units(), 6);
        let bytes = buf.data.bytes(6 * msg_unit_size::<u32>());
        let decoded: Vec<_> = (0..6).map(|k| decode_msg::<u32>(bytes, k)).collect();
        assert_eq!(
            decoded,
            vec![(0, 0), (1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]
        );
    }

    #[test]
    fn concurrent_emitters_share_one_buffer() {
        let buf = MessageBuffer::new(1);
        buf.reset(1024 * msg_unit_size::<u64>());
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let buf = &buf;
                s.spawn(move || {
                    let mut ctx = SignalCtx::<u64>::new(buf, 3);
                    for i in 0..32u32 {
                        ctx.emit(t * 100 + i, 1);
                    }
                });
            }
        });
        assert_eq!(buf.units(), 128);
        let bytes = buf.data.bytes(128 * msg_unit_size::<u64>());
        let mut vertices: Vec<_> = (0..128).map(|k| decode_msg::<u64>(bytes, k).0).collect();
        vertices.sort_unstable();
        let mut expected: Vec<_> = (0..4u32)
            .flat_map(|t| (0..32).map(move |i| t * 100 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(vertices, expected);
    }

    #[test]
    fn delegated_layout_tracks_counts() {
        let buf = MessageBuffer::new(6);
        buf.reset(256 * msg_unit_size::<u32>());
        {
            let mut ctx = SignalCtx::<u32>::new(&buf, 16);
            ctx.emit(1, 0);
            ctx.emit(2, 0);
        }
        buf.seal_owned();
        buf.mark_delegated_start(4);
        {
            let mut ctx = SignalCtx::<u32>::new(&buf, 16);
            ctx.emit(9, 0);
        }
        buf.mark_delegated_start(6);
        assert_eq!(buf.owned(), 2);
        assert_eq!(buf.delegated_range(4, 6), (2, 3));
    }

    #[test]
    #[should_panic(expected = "unit multiple")]
    fn ragged_payload_is_fatal() {
        let buf = MessageBuffer::new(1);
        buf.install(8, &[0u8; 12]);
    }
}

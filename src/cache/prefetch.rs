//! Asynchronous edge prefetch.
//!
//! Workers that miss the edge cache enqueue a request into their own
//! bounded ring and spin on the slot tag; a single background task drains
//! the rings, issues the one-sided list reads, and publishes the tags
//! only after the whole drain round's data is in place. A producer stalls
//! when its ring is within one work unit of full. Shutdown raises a flag
//! and the task drains every ring once more before exiting, so no staged
//! request is lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::bitmap::BASIC_CHUNK;
use crate::cache::edge_cache::EdgeCache;
use crate::cluster::Window;
use crate::types::VertexId;

#[derive(Debug)]
pub struct PrefetchRequest {
    pub vertex: VertexId,
    pub idx0: u64,
    pub idx1: u64,
    pub unit: usize,
    pub cache: Arc<EdgeCache>,
    pub window: Arc<Window>,
}

#[derive(Debug)]
struct PrefetchQueue {
    ring: Mutex<VecDeque<PrefetchRequest>>,
    space: Condvar,
    produced: AtomicU64,
    consumed: AtomicU64,
    capacity: usize,
}

impl PrefetchQueue {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            capacity: capacity.max(2 * BASIC_CHUNK as usize),
        }
    }

    fn push(&self, req: PrefetchRequest) {
        let high_water = (self.capacity - BASIC_CHUNK as usize) as u64;
        let mut ring = self.ring.lock();
        while self.produced.load(Ordering::Relaxed) - self.consumed.load(Ordering::Relaxed)
            > high_water
        {
            self.space.wait(&mut ring);
        }
        ring.push_back(req);
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    fn drain(&self) -> Vec<PrefetchRequest> {
        let mut ring = self.ring.lock();
        let items: Vec<_> = ring.drain(..).collect();
        if !items.is_empty() {
            self.consumed.fetch_add(items.len() as u64, Ordering::Relaxed);
            self.space.notify_all();
        }
        items
    }
}

#[derive(Debug)]
struct PrefetchShared {
    queues: Vec<PrefetchQueue>,
    shutdown: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// Handle owning the background task; dropping it drains and joins.
#[derive(Debug)]
pub struct Prefetcher {
    shared: Arc<PrefetchShared>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn start(workers: usize, queue_capacity: usize) -> Self {
        let shared = Arc::new(PrefetchShared {
            queues: (0..workers.max(1))
                .map(|_| PrefetchQueue::new(queue_capacity))
                .collect(),
            shutdown: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });
        let task_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("edge-prefetch".into())
            .spawn(move || run(task_shared))
            .expect("spawn prefetcher");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Queues a fetch from `worker`'s ring, stalling on back-pressure.
    pub fn enqueue(&self, worker: usize, req: PrefetchRequest) {
        self.shared.queues[worker % self.shared.queues.len()].push(req);
        self.shared.wake.notify_all();
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<PrefetchShared>) {
    let mut bytes = Vec::new();
    loop {
        let mut staged: Vec<(Arc<EdgeCache>, VertexId)> = Vec::new();
        for queue in &shared.queues {
            for req in queue.drain() {
                if req.cache.probe(req.vertex) {
                    continue;
                }
                let offset = req.idx0 as usize * req.unit;
                let len = (req.idx1 - req.idx0) as usize * req.unit;
                req.window.read_bytes_into(offset, len, &mut bytes);
                req.cache.stage(req.vertex, &bytes);
                staged.push((req.cache, req.vertex));
            }
        }
        // Tags flip only after every read of this round has landed.
        for (cache, v) in staged.drain(..) {
            cache.publish(v);
        }
        let idle = shared
            .queues
            .iter()
            .all(|q| q.produced.load(Ordering::Relaxed) == q.consumed.load(Ordering::Relaxed));
        if idle {
            if shared.shutdown.load(Ordering::Acquire) {
                debug!("prefetcher drained, exiting");
                return;
            }
            let mut guard = shared.wake_lock.lock();
            shared
                .wake
                .wait_for(&mut guard, Duration::from_micros(500));
        }
    }
}

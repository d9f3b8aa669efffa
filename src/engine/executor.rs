//! Work-stealing executor.
//!
//! Each rank runs `T` workers split across `S` sockets. A worker owns a
//! `(curr, end, status)` state and claims one bitmap word of work at a
//! time with a fetch-and-add on `curr`; when its stripe runs dry it flips
//! to `STEALING` and claims chunks from peers still `WORKING`. Stolen
//! chunks are processed against the victim's socket, which keeps every
//! `(chunk, socket replica)` pair covered exactly once.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::bitmap::BASIC_CHUNK;
use crate::types::Accum;

const WORKING: u8 = 0;
const STEALING: u8 = 1;

#[derive(Debug)]
struct ThreadState {
    curr: AtomicU64,
    end: AtomicU64,
    status: AtomicU8,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            curr: AtomicU64::new(0),
            end: AtomicU64::new(0),
            status: AtomicU8::new(STEALING),
        }
    }
}

#[derive(Debug)]
pub struct Executor {
    threads: usize,
    sockets: usize,
    states: Vec<ThreadState>,
}

impl Executor {
    pub fn new(threads: usize, sockets: usize) -> Self {
        assert!(sockets >= 1 && threads >= sockets);
        assert_eq!(threads % sockets, 0, "threads must divide across sockets");
        Self {
            threads,
            sockets,
            states: (0..threads).map(|_| ThreadState::new()).collect(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn sockets(&self) -> usize {
        self.sockets
    }

    pub fn threads_per_socket(&self) -> usize {
        self.threads / self.sockets
    }

    pub fn socket_of(&self, thread: usize) -> usize {
        thread / self.threads_per_socket()
    }

    pub fn socket_offset(&self, thread: usize) -> usize {
        thread % self.threads_per_socket()
    }

    fn set_state(&self, thread: usize, curr: u64, end: u64) {
        let st = &self.states[thread];
        st.curr.store(curr, Ordering::Relaxed);
        st.end.store(end, Ordering::Relaxed);
        st.status.store(WORKING, Ordering::Release);
    }

    /// One range per socket, divided among that socket's threads in
    /// whole work units; the socket's last thread absorbs the remainder.
    pub fn init_socket_stripes(&self, ranges: &[(u64, u64)]) {
        assert_eq!(ranges.len(), self.sockets);
        let tps = self.threads_per_socket() as u64;
        for t in 0..self.threads {
            let (begin, end) = ranges[self.socket_of(t)];
            let j = self.socket_offset(t) as u64;
            let step = (end - begin) / tps / BASIC_CHUNK * BASIC_CHUNK;
            let curr = begin + step * j;
            let stop = if j == tps - 1 { end } else { begin + step * (j + 1) };
            self.set_state(t, curr, stop);
        }
    }

    /// The same `[0, len)` stripe layout on every socket: socket replicas
    /// each cover the whole index range, striped by socket offset.
    pub fn init_mirror_stripes(&self, len: u64) {
        let ranges: Vec<(u64, u64)> = (0..self.sockets).map(|_| (0, len)).collect();
        self.init_socket_stripes(&ranges);
    }

    /// `[begin, end)` divided across all threads regardless of socket.
    pub fn init_flat_stripes(&self, begin: u64, end: u64) {
        let n = self.threads as u64;
        let step = (end - begin) / n / BASIC_CHUNK * BASIC_CHUNK;
        for t in 0..self.threads {
            let curr = begin + step * t as u64;
            let stop = if t == self.threads - 1 {
                end
            } else {
                begin + step * (t as u64 + 1)
            };
            self.set_state(t, curr, stop);
        }
    }

    /// Explicit per-thread chunks, used by the tuned dense schedule.
    pub fn init_tuned(&self, chunks: &[(u64, u64)]) {
        assert_eq!(chunks.len(), self.threads);
        for (t, &(curr, end)) in chunks.iter().enumerate() {
            self.set_state(t, curr, end);
        }
    }

    /// Claims the next work unit from `owner`'s stripe.
    pub fn claim(&self, owner: usize) -> Option<(u64, u64)> {
        let st = &self.states[owner];
        let b = st.curr.fetch_add(BASIC_CHUNK, Ordering::Relaxed);
        let end = st.end.load(Ordering::Relaxed);
        if b >= end {
            None
        } else {
            Some((b, (b + BASIC_CHUNK).min(end)))
        }
    }

    pub fn mark_stealing(&self, thread: usize) {
        self.states[thread].status.store(STEALING, Ordering::Release);
    }

    pub fn is_working(&self, thread: usize) -> bool {
        self.states[thread].status.load(Ordering::Acquire) == WORKING
    }

    /// Forks `f` across the pool and joins, combining the results.
    pub fn run<R, F>(&self, f: F) -> R
    where
        R: Accum,
        F: Fn(usize) -> R + Sync,
    {
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..self.threads)
                .map(|t| {
                    let f = &f;
                    s.spawn(move || f(t))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker panicked"))
                .fold(R::ZERO, R::combine)
        })
    }

    /// Forks `f` across the pool with no result.
    pub fn run_each<F: Fn(usize) + Sync>(&self, f: F) {
        self.run(|t| {
            f(t);
            0u64
        });
    }

    /// Full claim-then-steal drive over the configured stripes. `body`
    /// receives the owning thread of the chunk so callers can resolve
    /// the right socket replica.
    pub fn work_steal<R, F>(&self, body: F) -> R
    where
        R: Accum,
        F: Fn(usize, u64, u64) -> R + Sync,
    {
        self.run(|t| {
            let mut local = R::ZERO;
            while let Some((b, e)) = self.claim(t) {
                local = local.combine(body(t, b, e));
            }
            self.mark_stealing(t);
            for offset in 1..self.threads {
                let victim = (t + offset) % self.threads;
                while self.is_working(victim) {
                    match self.claim(victim) {
                        Some((b, e)) => local = local.combine(body(victim, b, e)),
                        None => std::hint::spin_loop(),
                    }
                }
            }
            local
        })
    }
}

//! In-process cluster: one thread per rank, tagged mailboxes between
//! them, collectives over the world and compute-only groups, and the
//! shared one-sided window registry.
//!
//! The compute/world split mirrors the two communicators of the engine:
//! the world group carries load-time shuffles and barriers, the compute
//! group carries round reductions. Far-memory ranks never enter compute
//! collectives.

pub mod mailbox;
pub mod window;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::ClusterTopology;
use crate::types::Codec;

pub use mailbox::{Mailbox, Tag};
pub use window::{Direction, SharedLock, Window, WindowKey, WindowKind, WindowRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    World,
    Compute,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Debug)]
struct Rendezvous {
    state: Mutex<BarrierState>,
    released: Condvar,
    size: usize,
}

impl Rendezvous {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
            size,
        }
    }

    fn wait(&self) {
        let mut st = self.state.lock();
        let arrived_in = st.generation;
        st.arrived += 1;
        if st.arrived == self.size {
            st.arrived = 0;
            st.generation += 1;
            self.released.notify_all();
        } else {
            while st.generation == arrived_in {
                self.released.wait(&mut st);
            }
        }
    }
}

#[derive(Debug)]
enum ReducePhase {
    Collect,
    Publish,
}

#[derive(Debug)]
struct ReduceState {
    parts: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
    phase: ReducePhase,
    result: Option<Arc<Vec<u8>>>,
}

#[derive(Debug)]
struct ReduceCell {
    state: Mutex<ReduceState>,
    turned: Condvar,
    size: usize,
}

impl ReduceCell {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(ReduceState {
                parts: vec![None; size],
                arrived: 0,
                departed: 0,
                phase: ReducePhase::Collect,
                result: None,
            }),
            turned: Condvar::new(),
            size,
        }
    }

    fn reduce(&self, member: usize, contribution: Vec<u8>, fold: &dyn Fn(&[Vec<u8>]) -> Vec<u8>) -> Arc<Vec<u8>> {
        let mut st = self.state.lock();
        while !matches!(st.phase, ReducePhase::Collect) {
            self.turned.wait(&mut st);
        }
        st.parts[member] = Some(contribution);
        st.arrived += 1;
        if st.arrived == self.size {
            let parts: Vec<Vec<u8>> = st.parts.iter_mut().map(|p| p.take().unwrap()).collect();
            st.result = Some(Arc::new(fold(&parts)));
            st.phase = ReducePhase::Publish;
            st.departed = 0;
            self.turned.notify_all();
        } else {
            while !matches!(st.phase, ReducePhase::Publish) {
                self.turned.wait(&mut st);
            }
        }
        let result = Arc::clone(st.result.as_ref().unwrap());
        st.departed += 1;
        if st.departed == self.size {
            st.phase = ReducePhase::Collect;
            st.arrived = 0;
            st.result = None;
            self.turned.notify_all();
        }
        result
    }
}

#[derive(Debug)]
struct Shared {
    topology: ClusterTopology,
    mailboxes: Vec<Mailbox>,
    registry: WindowRegistry,
    world_barrier: Rendezvous,
    compute_barrier: Rendezvous,
    world_reduce: ReduceCell,
    compute_reduce: ReduceCell,
}

/// Per-rank handle to the cluster; the engine's communication surface.
#[derive(Debug, Clone)]
pub struct NodeCtx {
    rank: usize,
    shared: Arc<Shared>,
}

impl NodeCtx {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn topology(&self) -> ClusterTopology {
        self.shared.topology
    }

    pub fn partitions(&self) -> usize {
        self.shared.topology.partitions
    }

    pub fn compute_partitions(&self) -> usize {
        self.shared.topology.compute_partitions
    }

    pub fn is_compute(&self) -> bool {
        self.shared.topology.is_compute(self.rank)
    }

    pub fn windows(&self) -> &WindowRegistry {
        &self.shared.registry
    }

    pub fn send(&self, to: usize, tag: Tag, label: u32, payload: Vec<u8>) {
        self.shared.mailboxes[to].deliver(self.rank, tag, label, payload);
    }

    pub fn recv(&self, from: usize, tag: Tag, label: u32) -> Vec<u8> {
        self.shared.mailboxes[self.rank].recv(from, tag, label)
    }

    pub fn recv_any(&self, tag: Tag) -> (usize, u32, Vec<u8>) {
        self.shared.mailboxes[self.rank].recv_any(tag)
    }

    pub fn recv_labeled(&self, tag: Tag, label: u32) -> (usize, Vec<u8>) {
        self.shared.mailboxes[self.rank].recv_labeled(tag, label)
    }

    pub fn barrier(&self, scope: Scope) {
        match scope {
            Scope::World => self.shared.world_barrier.wait(),
            Scope::Compute => {
                debug_assert!(self.is_compute(), "far rank in compute barrier");
                self.shared.compute_barrier.wait()
            }
        }
    }

    /// Element-wise all-reduce of `vals` across the scope with `combine`.
    pub fn all_reduce<T, F>(&self, scope: Scope, vals: &mut [T], combine: F)
    where
        T: Codec,
        F: Fn(T, T) -> T,
    {
        let cell = match scope {
            Scope::World => &self.shared.world_reduce,
            Scope::Compute => {
                debug_assert!(self.is_compute(), "far rank in compute reduction");
                &self.shared.compute_reduce
            }
        };
        let contribution = crate::types::encode_slice(vals);
        let n = vals.len();
        let folded = cell.reduce(self.rank, contribution, &|parts: &[Vec<u8>]| {
            let mut acc = crate::types::decode_slice::<T>(&parts[0]);
            assert_eq!(acc.len(), n, "reduction length mismatch across ranks");
            for part in &parts[1..] {
                let other = crate::types::decode_slice::<T>(part);
                assert_eq!(other.len(), n, "reduction length mismatch across ranks");
                for (a, b) in acc.iter_mut().zip(other) {
                    *a = combine(*a, b);
                }
            }
            crate::types::encode_slice(&acc)
        });
        let out = crate::types::decode_slice::<T>(&folded);
        vals.copy_from_slice(&out);
    }

    pub fn all_reduce_sum<T: crate::types::Accum>(&self, scope: Scope, val: T) -> T {
        let mut buf = [val];
        self.all_reduce(scope, &mut buf, T::combine);
        buf[0]
    }
}

pub struct Cluster;

impl Cluster {
    /// Runs `f` once per rank on its own thread and returns the results
    /// indexed by rank. A panicking rank aborts the run; mid-run
    /// communication errors are unrecoverable by design.
    pub fn launch<F, T>(topology: ClusterTopology, f: F) -> Vec<T>
    where
        F: Fn(NodeCtx) -> T + Send + Sync,
        T: Send,
    {
        let shared = Arc::new(Shared {
            topology,
            mailboxes: (0..topology.partitions).map(|_| Mailbox::new()).collect(),
            registry: WindowRegistry::new(),
            world_barrier: Rendezvous::new(topology.partitions),
            compute_barrier: Rendezvous::new(topology.compute_partitions),
            world_reduce: ReduceCell::new(topology.partitions),
            compute_reduce: ReduceCell::new(topology.compute_partitions),
        });
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..topology.partitions)
                .map(|rank| {
                    let ctx = NodeCtx {
                        rank,
                        shared: Arc::clone(&shared),
                    };
                    let f = &f;
                    s.spawn(move || f(ctx))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_reduce_sums_over_world() {
        let topo = ClusterTopology::all_compute(4);
        let results = Cluster::launch(topo, |ctx| {
            ctx.all_reduce_sum(Scope::World, (ctx.rank() + 1) as u64)
        });
        assert_eq!(results, vec![10, 10, 10, 10]);
    }

    #[test]
    fn compute_scope_excludes_far_ranks() {
        let topo = ClusterTopology::new(4, 2);
        let results = Cluster::launch(topo, |ctx| {
            if ctx.is_compute() {
                ctx.all_reduce_sum(Scope::Compute, 1u32)
            } else {
                0
            }
        });
        assert_eq!(results, vec![2, 2, 0, 0]);
    }

    #[test]
    fn element_wise_reduce_with_min_and_max() {
        let topo = ClusterTopology::all_compute(3);
        let results = Cluster::launch(topo, |ctx| {
            let mut vals = vec![ctx.rank() as u32, 10 - ctx.rank() as u32];
            ctx.all_reduce(Scope::World, &mut vals, u32::max);
            vals
        });
        for r in results {
            assert_eq!(r, vec![2, 10]);
        }
    }

    #[test]
    fn point_to_point_ring() {
        let topo = ClusterTopology::all_compute(3);
        let results = Cluster::launch(topo, |ctx| {
            let next = (ctx.rank() + 1) % 3;
            let prev = (ctx.rank() + 2) % 3;
            ctx.send(next, Tag::PassMessage, 0, vec![ctx.rank() as u8]);
            ctx.recv(prev, Tag::PassMessage, 0)
        });
        assert_eq!(results, vec![vec![2], vec![0], vec![1]]);
    }

    #[test]
    fn repeated_barriers_do_not_wedge() {
        let topo = ClusterTopology::all_compute(4);
        Cluster::launch(topo, |ctx| {
            for _ in 0..100 {
                ctx.barrier(Scope::World);
            }
        });
    }
}

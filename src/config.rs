use crate::types::VertexId;

/// How the world of ranks is split between compute and far-memory roles.
///
/// Ranks `[0, compute_partitions)` own worker pools and run rounds; the
/// remaining ranks hold CSR data served over one-sided reads. Each far
/// partition `f` is delegated to compute partition `f % compute_partitions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTopology {
    pub partitions: usize,
    pub compute_partitions: usize,
}

impl ClusterTopology {
    pub fn new(partitions: usize, compute_partitions: usize) -> Self {
        assert!(partitions >= 1, "need at least one partition");
        assert!(
            (1..=partitions).contains(&compute_partitions),
            "compute partitions must be in [1, partitions]"
        );
        Self {
            partitions,
            compute_partitions,
        }
    }

    /// All ranks are compute ranks.
    pub fn all_compute(partitions: usize) -> Self {
        Self::new(partitions, partitions)
    }

    pub fn is_compute(&self, rank: usize) -> bool {
        rank < self.compute_partitions
    }

    pub fn is_far_memory(&self, rank: usize) -> bool {
        rank >= self.compute_partitions
    }

    /// The compute rank standing in for far-memory partition `f`.
    pub fn delegate_of(&self, f: usize) -> usize {
        debug_assert!(self.is_far_memory(f));
        f % self.compute_partitions
    }

    /// Far-memory partitions delegated to `rank`, in ascending order.
    pub fn delegated_partitions(&self, rank: usize) -> Vec<usize> {
        (self.compute_partitions..self.partitions)
            .filter(|f| f % self.compute_partitions == rank)
            .collect()
    }

    /// Next delegated partition of the same delegate after `f`, or the
    /// world size; closes the `delegated_start` layout.
    pub fn next_delegated(&self, f: usize) -> usize {
        if f + self.compute_partitions < self.partitions {
            f + self.compute_partitions
        } else {
            self.partitions
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Worker pool size per rank. Rounded down to a multiple of `sockets`.
    pub threads: usize,
    /// NUMA sub-partitions per rank; CSR is replicated per socket.
    pub sockets: usize,
    /// Per-vertex chunking weight; `None` resolves to `8 * (partitions - 1)`.
    pub alpha: Option<u64>,
    /// Partition boundaries are aligned down to a multiple of this many
    /// vertices. Tests that need single-vertex partitions set it to 1.
    pub page_size: VertexId,
    /// Per-thread scratch capacity, in message units.
    pub local_send_buffer_limit: usize,
    pub bitmap_cache: bool,
    pub index_cache: bool,
    pub edge_cache: bool,
    /// Direct-mapped entries per `(partition, socket)` edge cache.
    pub edge_cache_entries: usize,
    /// Per-worker bounded prefetch ring capacity, in requests.
    pub prefetch_queue_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            threads: parallelism.max(2),
            sockets: 2,
            alpha: None,
            page_size: 4096,
            local_send_buffer_limit: 16,
            bitmap_cache: true,
            index_cache: true,
            edge_cache: true,
            edge_cache_entries: 1 << 16,
            prefetch_queue_size: 1 << 12,
        }
    }
}

impl GraphConfig {
    /// All caches disabled; every delegated lookup goes to the window.
    pub fn cache_off() -> Self {
        Self {
            bitmap_cache: false,
            index_cache: false,
            edge_cache: false,
            ..Self::default()
        }
    }

    pub fn single_socket() -> Self {
        Self {
            sockets: 1,
            ..Self::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Effective worker count: at least one thread per socket, and a
    /// multiple of the socket count.
    pub fn effective_threads(&self) -> usize {
        let t = self.threads.max(self.sockets);
        t / self.sockets * self.sockets
    }

    pub fn resolve_alpha(&self, partitions: usize) -> u64 {
        self.alpha
            .unwrap_or_else(|| 8 * (partitions.saturating_sub(1)) as u64)
    }
}

//! The edge-processing engine.
//!
//! [`Graph`] ties the partitioner, per-socket CSR stores, message
//! buffers, the cache tier, and the work-stealing executor into the two
//! round operators `process_vertices` and `process_edges`. A rank loads
//! its share of the edge file, shuffles records to their owners, and —
//! if it is a far-memory rank — publishes its CSR arrays as one-sided
//! windows instead of running rounds. Compute ranks stand in for their
//! delegated far partitions: they signal over the delegated vertex
//! ranges, short-circuit messages bound for them, and consume their
//! adjacency through the cache tier.

pub mod executor;
pub mod messaging;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::bitmap::{Bitmap, BASIC_CHUNK};
use crate::cache::{CacheTier, PrefetchRequest, Prefetcher};
use crate::cluster::{Direction, NodeCtx, Scope, Tag, WindowKey, WindowKind};
use crate::config::{ClusterTopology, GraphConfig};
use crate::error::{GraphError, Result};
use crate::metrics::EngineMetrics;
use crate::partition::{chunk_offsets, partition_of, verify_offsets};
use crate::storage::csr::{CsrBuilder, DirectionStore, SocketCsr};
use crate::types::{
    adj_unit_size, decode_slice, edge_unit_size, encode_slice, msg_unit_size, Accum, AdjView,
    Codec, EdgeData, EdgeId, EdgeRecord, VertexId,
};

use executor::Executor;
use messaging::{decode_msg, MessageBuffer, SignalCtx};

/// Records streamed per shuffle chunk.
const SHUFFLE_CHUNK: usize = 1 << 14;

/// Which vertex of a record keys the shuffle, and which side the list
/// stores.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BuildSide {
    /// Keyed by destination; lists hold out-neighbours, indexed by source.
    Outgoing,
    /// Keyed by source; lists hold in-neighbours, indexed by sink.
    Incoming,
}

fn pass_label(side: BuildSide, placement: bool) -> u32 {
    match (side, placement) {
        (BuildSide::Outgoing, false) => 0,
        (BuildSide::Outgoing, true) => 1,
        (BuildSide::Incoming, false) => 2,
        (BuildSide::Incoming, true) => 3,
    }
}

fn stream_label(part: usize, socket: usize, sockets: usize) -> u32 {
    (part * sockets + socket) as u32
}

#[derive(Debug)]
pub struct Graph<E: EdgeData> {
    // Dropped first, before the window locks held by the cache tiers go.
    prefetcher: Option<Prefetcher>,
    ctx: NodeCtx,
    config: GraphConfig,
    topology: ClusterTopology,
    alpha: u64,
    pub vertices: VertexId,
    pub edges: EdgeId,
    pub symmetric: bool,
    pub partition_offset: Vec<VertexId>,
    pub local_partition_offset: Vec<VertexId>,
    pub owned_vertices: VertexId,
    out_degree: Vec<VertexId>,
    in_degree: Vec<VertexId>,
    out_store: DirectionStore,
    in_store: DirectionStore,
    out_cache: CacheTier,
    in_cache: CacheTier,
    tuned_chunks_dense: Vec<Vec<(u64, u64)>>,
    tuned_chunks_sparse: Vec<Vec<(u64, u64)>>,
    delegated: Vec<usize>,
    executor: Executor,
    send_buffer: Vec<Vec<MessageBuffer>>,
    recv_buffer: Vec<Vec<MessageBuffer>>,
    _marker: PhantomData<E>,
}

impl<E: EdgeData> Graph<E> {
    pub fn load_directed(
        ctx: NodeCtx,
        path: impl AsRef<Path>,
        vertices: VertexId,
        config: GraphConfig,
    ) -> Result<Self> {
        Self::load(ctx, path.as_ref(), vertices, config, false)
    }

    /// Loads a directed edge file as an undirected graph: every record
    /// contributes both orientations to one symmetric structure shared by
    /// the outgoing and incoming sides.
    pub fn load_undirected_from_directed(
        ctx: NodeCtx,
        path: impl AsRef<Path>,
        vertices: VertexId,
        config: GraphConfig,
    ) -> Result<Self> {
        Self::load(ctx, path.as_ref(), vertices, config, true)
    }

    fn load(
        ctx: NodeCtx,
        path: &Path,
        vertices: VertexId,
        config: GraphConfig,
        symmetric: bool,
    ) -> Result<Self> {
        let started = Instant::now();
        let topology = ctx.topology();
        let partitions = topology.partitions;
        let rank = ctx.rank();
        let sockets = config.sockets;
        let alpha = config.resolve_alpha(partitions);
        let edge_unit = edge_unit_size::<E>();

        let file_len = std::fs::metadata(path)?.len();
        if file_len % edge_unit as u64 != 0 {
            return Err(GraphError::MalformedInput(format!(
                "file size {file_len} is not a multiple of the {edge_unit}-byte record"
            )));
        }
        let edges: EdgeId = file_len / edge_unit as u64;
        if rank == 0 {
            info!(vertices, edges, symmetric, "loading graph");
        }

        // Per-rank share of the edge stream; the last rank reads the tail.
        let share = edges / partitions as u64;
        let my_records = share + if rank == partitions - 1 { edges % partitions as u64 } else { 0 };
        let my_offset = share * rank as u64 * edge_unit as u64;
        let my_bytes = my_records * edge_unit as u64;

        // Degree accumulation, reduced across the world.
        let mut out_degree = vec![0u32; vertices as usize];
        let mut in_degree = vec![0u32; vertices as usize];
        stream_edges::<E>(path, my_offset, my_bytes, |rec| {
            out_degree[rec.src as usize] += 1;
            if symmetric {
                out_degree[rec.dst as usize] += 1;
            } else {
                in_degree[rec.dst as usize] += 1;
            }
        })?;
        ctx.all_reduce(Scope::World, &mut out_degree, |a, b| a + b);
        if symmetric {
            in_degree = out_degree.clone();
        } else {
            ctx.all_reduce(Scope::World, &mut in_degree, |a, b| a + b);
        }

        // Locality-aware chunking, identical on every rank by construction
        // and verified by double reduction.
        let partition_offset = chunk_offsets(
            0,
            vertices,
            partitions,
            &out_degree,
            alpha,
            config.page_size,
        );
        verify_offsets(&ctx, &partition_offset)?;
        let owned_vertices = partition_offset[rank + 1] - partition_offset[rank];
        let local_partition_offset = chunk_offsets(
            partition_offset[rank],
            partition_offset[rank + 1],
            sockets,
            &out_degree,
            alpha,
            config.page_size,
        );
        debug!(rank, ?partition_offset, "partitioned");

        let executor = Executor::new(config.effective_threads(), sockets);

        // CSR builds: outgoing always, incoming only for directed graphs.
        let out_store = build_direction::<E>(
            &ctx,
            path,
            my_offset,
            my_bytes,
            vertices,
            &partition_offset,
            &local_partition_offset,
            BuildSide::Outgoing,
            symmetric,
        )?;
        let in_store = if symmetric {
            out_store.clone()
        } else {
            build_direction::<E>(
                &ctx,
                path,
                my_offset,
                my_bytes,
                vertices,
                &partition_offset,
                &local_partition_offset,
                BuildSide::Incoming,
                symmetric,
            )?
        };

        // Far-memory ranks expose their arrays; everyone synchronizes so
        // delegates observe published windows.
        if topology.is_far_memory(rank) {
            publish_windows(&ctx, rank, Direction::Outgoing, &out_store);
            publish_windows(&ctx, rank, Direction::Incoming, &in_store);
        }
        ctx.barrier(Scope::World);

        let delegated = topology.delegated_partitions(rank);
        let mut out_cache = CacheTier::new(partitions, sockets);
        let mut in_cache = CacheTier::new(partitions, sockets);
        if topology.is_compute(rank) {
            for &fp in &delegated {
                out_cache.attach_far_partition(ctx.windows(), fp, Direction::Outgoing, &config)?;
                in_cache.attach_far_partition(ctx.windows(), fp, Direction::Incoming, &config)?;
            }
        }

        let send_buffer = (0..partitions)
            .map(|_| (0..sockets).map(|_| MessageBuffer::new(partitions)).collect())
            .collect();
        let recv_buffer = (0..partitions)
            .map(|_| (0..sockets).map(|_| MessageBuffer::new(partitions)).collect())
            .collect();

        let prefetcher = if topology.is_compute(rank) && !delegated.is_empty() {
            Some(Prefetcher::start(
                executor.threads(),
                config.prefetch_queue_size,
            ))
        } else {
            None
        };

        let mut graph = Self {
            prefetcher,
            ctx,
            config,
            topology,
            alpha,
            vertices,
            edges,
            symmetric,
            partition_offset,
            local_partition_offset,
            owned_vertices,
            out_degree,
            in_degree,
            out_store,
            in_store,
            out_cache,
            in_cache,
            tuned_chunks_dense: Vec::new(),
            tuned_chunks_sparse: Vec::new(),
            delegated,
            executor,
            send_buffer,
            recv_buffer,
            _marker: PhantomData,
        };

        if symmetric {
            graph.tuned_chunks_dense = graph.tune_chunks();
            graph.tuned_chunks_sparse = graph.tuned_chunks_dense.clone();
        } else {
            graph.transpose();
            let transposed = graph.tune_chunks();
            graph.transpose();
            graph.tuned_chunks_dense = graph.tune_chunks();
            graph.tuned_chunks_sparse = transposed;
        }

        if rank == 0 {
            info!(elapsed = ?started.elapsed(), "graph loaded");
        }
        Ok(graph)
    }

    pub fn ctx(&self) -> &NodeCtx {
        &self.ctx
    }

    pub fn topology(&self) -> ClusterTopology {
        self.topology
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn alpha(&self) -> u64 {
        self.alpha
    }

    pub fn out_degree(&self, v: VertexId) -> VertexId {
        self.out_degree[v as usize]
    }

    pub fn in_degree(&self, v: VertexId) -> VertexId {
        self.in_degree[v as usize]
    }

    pub fn delegated_partitions(&self) -> &[usize] {
        &self.delegated
    }

    pub fn outgoing_store(&self) -> &DirectionStore {
        &self.out_store
    }

    pub fn incoming_store(&self) -> &DirectionStore {
        &self.in_store
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            outgoing: self.out_cache.stats.snapshot(),
            incoming: self.in_cache.stats.snapshot(),
        }
    }

    pub fn partition_of_vertex(&self, v: VertexId) -> usize {
        partition_of(&self.partition_offset, v)
    }

    // ---- vertex arrays ---------------------------------------------------

    pub fn alloc_vertex_array<T: Codec + Default>(&self) -> Vec<T> {
        vec![T::default(); self.vertices as usize]
    }

    /// Explicit release, for symmetry with `alloc_vertex_array`.
    pub fn dealloc_vertex_array<T>(&self, array: Vec<T>) {
        drop(array);
    }

    pub fn alloc_vertex_subset(&self) -> Bitmap {
        Bitmap::new(self.vertices as usize)
    }

    /// Fills the rank's own range and every far-memory range.
    pub fn fill_vertex_array<T: Copy>(&self, array: &mut [T], value: T) {
        let rank = self.ctx.rank();
        for v in self.partition_offset[rank]..self.partition_offset[rank + 1] {
            array[v as usize] = value;
        }
        let far_begin = self.partition_offset[self.topology.compute_partitions];
        let far_end = self.partition_offset[self.topology.partitions];
        for v in far_begin..far_end {
            array[v as usize] = value;
        }
    }

    /// Persists a vertex array: compute rank 0 pre-allocates the file,
    /// then each compute rank writes its own slice and the slices of the
    /// partitions it delegates.
    pub fn dump_vertex_array<T: Codec>(&self, array: &[T], path: impl AsRef<Path>) -> Result<()> {
        if !self.ctx.is_compute() {
            return Ok(());
        }
        let path = path.as_ref();
        let file_len = (T::SIZE * self.vertices as usize) as u64;
        if self.ctx.rank() == 0 {
            let fresh = match std::fs::metadata(path) {
                Ok(meta) => meta.len() != file_len,
                Err(_) => true,
            };
            if fresh {
                let file = File::create(path)?;
                file.set_len(file_len)?;
            }
        }
        self.ctx.barrier(Scope::Compute);
        let mut file = OpenOptions::new().write(true).open(path)?;
        let rank = self.ctx.rank();
        let mut slices = vec![(self.partition_offset[rank], self.partition_offset[rank + 1])];
        for &fp in &self.delegated {
            slices.push((self.partition_offset[fp], self.partition_offset[fp + 1]));
        }
        for (begin, end) in slices {
            file.seek(SeekFrom::Start(begin as u64 * T::SIZE as u64))?;
            file.write_all(&encode_slice(&array[begin as usize..end as usize]))?;
        }
        file.flush()?;
        self.ctx.barrier(Scope::Compute);
        Ok(())
    }

    /// Reads back the slices this rank is responsible for.
    pub fn restore_vertex_array<T: Codec>(
        &self,
        array: &mut [T],
        path: impl AsRef<Path>,
    ) -> Result<()> {
        if !self.ctx.is_compute() {
            return Ok(());
        }
        let path = path.as_ref();
        let file_len = (T::SIZE * self.vertices as usize) as u64;
        let meta = std::fs::metadata(path)?;
        if meta.len() != file_len {
            return Err(GraphError::MalformedInput(format!(
                "array file is {} bytes, expected {file_len}",
                meta.len()
            )));
        }
        let mut file = File::open(path)?;
        let rank = self.ctx.rank();
        let mut slices = vec![(self.partition_offset[rank], self.partition_offset[rank + 1])];
        for &fp in &self.delegated {
            slices.push((self.partition_offset[fp], self.partition_offset[fp + 1]));
        }
        for (begin, end) in slices {
            let bytes = (end - begin) as usize * T::SIZE;
            let mut buf = vec![0u8; bytes];
            file.seek(SeekFrom::Start(begin as u64 * T::SIZE as u64))?;
            file.read_exact(&mut buf)?;
            let vals = decode_slice::<T>(&buf);
            array[begin as usize..end as usize].copy_from_slice(&vals);
        }
        Ok(())
    }

    /// Collects every partition slice — owned and delegated — onto the
    /// compute root.
    pub fn gather_vertex_array<T: Codec>(&self, array: &mut [T], root: usize) {
        assert!(
            root < self.topology.compute_partitions,
            "gather root must be a compute rank"
        );
        if !self.ctx.is_compute() {
            return;
        }
        let rank = self.ctx.rank();
        let offs = &self.partition_offset;
        if rank != root {
            let own = encode_slice(&array[offs[rank] as usize..offs[rank + 1] as usize]);
            self.ctx
                .send(root, Tag::GatherVertexArray, rank as u32, own);
            for &fp in &self.delegated {
                let seg = encode_slice(&array[offs[fp] as usize..offs[fp + 1] as usize]);
                self.ctx.send(root, Tag::GatherVertexArray, fp as u32, seg);
            }
        } else {
            for i in 0..self.topology.compute_partitions {
                if i == root {
                    continue;
                }
                let bytes = self.ctx.recv(i, Tag::GatherVertexArray, i as u32);
                install_slice(array, offs[i], offs[i + 1], &bytes);
            }
            for fp in self.topology.compute_partitions..self.topology.partitions {
                let delegate = self.topology.delegate_of(fp);
                if delegate == root {
                    continue;
                }
                let bytes = self.ctx.recv(delegate, Tag::GatherVertexArray, fp as u32);
                install_slice(array, offs[fp], offs[fp + 1], &bytes);
            }
        }
    }

    // ---- vertex walk -----------------------------------------------------

    /// Calls `process` on every set bit of `active` in this rank's own
    /// range and in each delegated far range, work-stealing throughout,
    /// and all-reduces the sum over the compute group.
    pub fn process_vertices<R, F>(&self, process: F, active: &Bitmap) -> R
    where
        R: Accum,
        F: Fn(VertexId) -> R + Sync,
    {
        if !self.ctx.is_compute() {
            return R::ZERO;
        }
        let started = Instant::now();
        let ranges: Vec<(u64, u64)> = (0..self.config.sockets)
            .map(|s| {
                (
                    self.local_partition_offset[s] as u64,
                    self.local_partition_offset[s + 1] as u64,
                )
            })
            .collect();
        self.executor.init_socket_stripes(&ranges);
        let mut local = self.walk_active(active, &process);
        for &fp in &self.delegated {
            self.executor.init_flat_stripes(
                self.partition_offset[fp] as u64,
                self.partition_offset[fp + 1] as u64,
            );
            local = local.combine(self.walk_active(active, &process));
        }
        let global = self.ctx.all_reduce_sum(Scope::Compute, local);
        debug!(rank = self.ctx.rank(), elapsed = ?started.elapsed(), "process_vertices");
        global
    }

    fn walk_active<R, F>(&self, active: &Bitmap, process: &F) -> R
    where
        R: Accum,
        F: Fn(VertexId) -> R + Sync,
    {
        self.executor.work_steal(|_owner, begin, end| {
            let mut local = R::ZERO;
            active.for_each_set_in(begin, end, |v| local = local.combine(process(v)));
            local
        })
    }

    // ---- edge rounds -----------------------------------------------------

    /// One gather/scatter round. The dense pair is accepted for API
    /// completeness; the driver below forces the sparse path.
    #[allow(clippy::too_many_arguments)]
    pub fn process_edges<R, M, SS, SL, DS, DL>(
        &self,
        sparse_signal: SS,
        sparse_slot: SL,
        dense_signal: DS,
        dense_slot: DL,
        active: &Bitmap,
        dense_selective: Option<&Bitmap>,
    ) -> R
    where
        R: Accum,
        M: Codec,
        SS: Fn(&mut SignalCtx<'_, M>, VertexId) + Sync,
        SL: Fn(VertexId, M, AdjView<'_, E>) -> R + Sync,
        DS: Fn(&mut SignalCtx<'_, M>, VertexId, AdjView<'_, E>) + Sync,
        DL: Fn(VertexId, M) -> R + Sync,
    {
        if !self.ctx.is_compute() {
            return R::ZERO;
        }
        let started = Instant::now();
        let _active_edges: u64 =
            self.process_vertices(|v| self.out_degree[v as usize] as u64, active);
        // let sparse = active_edges < self.edges / 20;
        let sparse = true;
        let local = if sparse {
            self.sparse_round::<R, M, _, _>(&sparse_signal, &sparse_slot, active)
        } else {
            self.dense_round::<R, M, _, _>(&dense_signal, &dense_slot, dense_selective)
        };
        let global = self.ctx.all_reduce_sum(Scope::Compute, local);
        debug!(rank = self.ctx.rank(), elapsed = ?started.elapsed(), sparse, "process_edges");
        global
    }

    /// Sparse-only round; the common entry point for drivers.
    pub fn process_edges_sparse<R, M, SS, SL>(
        &self,
        sparse_signal: SS,
        sparse_slot: SL,
        active: &Bitmap,
    ) -> R
    where
        R: Accum,
        M: Codec,
        SS: Fn(&mut SignalCtx<'_, M>, VertexId) + Sync,
        SL: Fn(VertexId, M, AdjView<'_, E>) -> R + Sync,
    {
        self.process_edges(
            sparse_signal,
            sparse_slot,
            |_: &mut SignalCtx<'_, M>, _: VertexId, _: AdjView<'_, E>| {},
            |_: VertexId, _: M| R::ZERO,
            active,
            None,
        )
    }

    fn sparse_round<R, M, SS, SL>(&self, sparse_signal: &SS, sparse_slot: &SL, active: &Bitmap) -> R
    where
        R: Accum,
        M: Codec,
        SS: Fn(&mut SignalCtx<'_, M>, VertexId) + Sync,
        SL: Fn(VertexId, M, AdjView<'_, E>) -> R + Sync,
    {
        let partitions = self.topology.partitions;
        let compute = self.topology.compute_partitions;
        let sockets = self.config.sockets;
        let rank = self.ctx.rank();
        let unit = msg_unit_size::<M>();
        let offs = &self.partition_offset;

        for s in 0..sockets {
            self.send_buffer[rank][s].reset(unit * self.vertices as usize * sockets);
        }
        for i in 0..partitions {
            for s in 0..sockets {
                let span = (offs[i + 1] - offs[i]) as usize;
                self.recv_buffer[i][s].reset(unit * span * sockets);
            }
        }

        // Signal phase: own frontier first, then each delegated range,
        // recording the delegated layout as it grows.
        self.signal_range(rank, offs[rank] as u64, offs[rank + 1] as u64, active, sparse_signal);
        for s in 0..sockets {
            self.send_buffer[rank][s].seal_owned();
            self.send_buffer[rank][s].mark_delegated_start(compute);
        }
        for &fp in &self.delegated {
            for s in 0..sockets {
                self.send_buffer[rank][s].mark_delegated_start(fp);
            }
            self.signal_range(rank, offs[fp] as u64, offs[fp + 1] as u64, active, sparse_signal);
        }
        for s in 0..sockets {
            self.send_buffer[rank][s].mark_delegated_start(partitions);
        }

        // Exchange overlapped with the local consume phase.
        let ready: Mutex<Vec<usize>> = Mutex::new(vec![rank]);
        let ready_grew = Condvar::new();
        let push_ready = |i: usize| {
            ready.lock().push(i);
            ready_grew.notify_all();
        };

        let mut reducer = R::ZERO;
        std::thread::scope(|scope| {
            // Sender: every compute peer gets the owned prefix plus each
            // delegated segment, labelled by its far partition.
            scope.spawn(|| {
                for step in 1..partitions {
                    let i = (rank + partitions - step) % partitions;
                    if i >= compute {
                        continue;
                    }
                    for s in 0..sockets {
                        let buf = &self.send_buffer[rank][s];
                        let total = buf.units();
                        let bytes = buf.data.bytes(total * unit);
                        let owned = buf.owned();
                        self.ctx.send(
                            i,
                            Tag::PassMessage,
                            stream_label(rank, s, sockets),
                            bytes[..owned * unit].to_vec(),
                        );
                        for &fp in &self.delegated {
                            let (lo, hi) =
                                buf.delegated_range(fp, self.topology.next_delegated(fp));
                            self.ctx.send(
                                i,
                                Tag::PassMessage,
                                stream_label(fp, s, sockets),
                                bytes[lo * unit..hi * unit].to_vec(),
                            );
                        }
                    }
                }
            });
            // Receiver: ring order over partitions; self-delegated
            // segments are short-circuited with a local copy.
            scope.spawn(|| {
                for step in 1..partitions {
                    let i = (rank + step) % partitions;
                    if i < compute {
                        for s in 0..sockets {
                            let bytes =
                                self.ctx.recv(i, Tag::PassMessage, stream_label(i, s, sockets));
                            self.recv_buffer[i][s].install(unit, &bytes);
                        }
                    } else {
                        let delegate = self.topology.delegate_of(i);
                        if delegate == rank {
                            for s in 0..sockets {
                                let buf = &self.send_buffer[rank][s];
                                let (lo, hi) =
                                    buf.delegated_range(i, self.topology.next_delegated(i));
                                let bytes = buf.data.bytes(buf.units() * unit);
                                self.recv_buffer[i][s]
                                    .install(unit, &bytes[lo * unit..hi * unit]);
                            }
                        } else {
                            for s in 0..sockets {
                                let bytes = self.ctx.recv(
                                    delegate,
                                    Tag::PassMessage,
                                    stream_label(i, s, sockets),
                                );
                                self.recv_buffer[i][s].install(unit, &bytes);
                            }
                        }
                    }
                    push_ready(i);
                }
            });

            // Local consume: every ready buffer against the local CSR.
            for step in 0..partitions {
                let i = {
                    let mut queue = ready.lock();
                    while queue.len() <= step {
                        ready_grew.wait(&mut queue);
                    }
                    queue[step]
                };
                let used = if i == rank {
                    &self.send_buffer[i]
                } else {
                    &self.recv_buffer[i]
                };
                for buf in used.iter().take(sockets) {
                    let n = buf.owned();
                    let bytes = buf.data.bytes(n * unit);
                    self.executor.init_mirror_stripes(n as u64);
                    let r = self.executor.work_steal(|owner, begin, end| {
                        let s = self.executor.socket_of(owner);
                        let csr = &self.out_store.sockets[s];
                        let mut local = R::ZERO;
                        for k in begin..end {
                            let (v, msg) = decode_msg::<M>(bytes, k as usize);
                            if let Some((lo, hi)) = csr.range(v) {
                                let adj = adj_unit_size::<E>();
                                let view = AdjView::new(
                                    &csr.list[lo as usize * adj..hi as usize * adj],
                                );
                                local = local.combine(sparse_slot(v, msg, view));
                            }
                        }
                        local
                    });
                    reducer = reducer.combine(r);
                }
            }

            // Delegated consume: the same buffers again, against each
            // delegated far partition's CSR through the cache tier.
            for step in 0..partitions {
                for &fp in &self.delegated {
                    let i = (fp + step) % partitions;
                    let used = if i == rank {
                        &self.send_buffer[i]
                    } else {
                        &self.recv_buffer[i]
                    };
                    for buf in used.iter().take(sockets) {
                        let n = buf.owned();
                        let bytes = buf.data.bytes(n * unit);
                        self.executor.init_mirror_stripes(n as u64);
                        let r = self.executor.work_steal(|owner, begin, end| {
                            let mut local = R::ZERO;
                            for k in begin..end {
                                let (v, msg) = decode_msg::<M>(bytes, k as usize);
                                local = local.combine(
                                    self.delegated_slot(owner, fp, v, msg, sparse_slot),
                                );
                            }
                            local
                        });
                        reducer = reducer.combine(r);
                    }
                }
            }
        });
        reducer
    }

    /// Slots one message against far partition `fp`'s adjacency: cached
    /// bitmap word, cached index pair, then the edge cache — spinning on
    /// the slot tag behind a prefetch request on a miss.
    fn delegated_slot<R, M, SL>(
        &self,
        owner: usize,
        fp: usize,
        v: VertexId,
        msg: M,
        sparse_slot: &SL,
    ) -> R
    where
        R: Accum,
        M: Codec,
        SL: Fn(VertexId, M, AdjView<'_, E>) -> R + Sync,
    {
        use std::sync::atomic::Ordering::Relaxed;
        let s = self.executor.socket_of(owner);
        let tier = &self.out_cache;
        if !tier.bit_set(fp, s, v) {
            return R::ZERO;
        }
        let (idx0, idx1) = tier.index_pair(fp, s, v);
        let adj = adj_unit_size::<E>();
        match tier.edge_cache_of(fp, s) {
            Some(cache) => {
                if let Some(r) =
                    cache.with_cached(v, |bytes| sparse_slot(v, msg, AdjView::new(bytes)))
                {
                    tier.stats.edge_hit.fetch_add(1, Relaxed);
                    return r;
                }
                tier.stats.edge_miss.fetch_add(1, Relaxed);
                let prefetcher = self.prefetcher.as_ref().expect("prefetcher running");
                let window = tier.list_window(fp, s);
                let request = || PrefetchRequest {
                    vertex: v,
                    idx0,
                    idx1,
                    unit: adj,
                    cache: Arc::clone(cache),
                    window: Arc::clone(window),
                };
                prefetcher.enqueue(owner, request());
                let mut spins: u64 = 0;
                loop {
                    if let Some(r) =
                        cache.with_cached(v, |bytes| sparse_slot(v, msg, AdjView::new(bytes)))
                    {
                        return r;
                    }
                    spins += 1;
                    // A conflicting source can overwrite the slot between
                    // publish and our read; re-request instead of wedging.
                    if spins % 100_000 == 0 {
                        prefetcher.enqueue(owner, request());
                    }
                    std::hint::spin_loop();
                }
            }
            None => {
                let window = tier.list_window(fp, s);
                let mut bytes = Vec::new();
                window.read_bytes_into(
                    idx0 as usize * adj,
                    (idx1 - idx0) as usize * adj,
                    &mut bytes,
                );
                sparse_slot(v, msg, AdjView::new(&bytes))
            }
        }
    }

    /// Scans `[begin, end)` of `active` across the pool, feeding
    /// `signal` a per-thread emit context bound to `dest`'s send buffer.
    fn signal_range<M, SS>(&self, dest: usize, begin: u64, end: u64, active: &Bitmap, signal: &SS)
    where
        M: Codec,
        SS: Fn(&mut SignalCtx<'_, M>, VertexId) + Sync,
    {
        let cursor = AtomicU64::new(begin);
        self.executor.run_each(|t| {
            let socket = self.executor.socket_of(t);
            let mut emit_ctx = SignalCtx::<M>::new(
                &self.send_buffer[dest][socket],
                self.config.local_send_buffer_limit,
            );
            loop {
                let b = cursor.fetch_add(BASIC_CHUNK, Ordering::Relaxed);
                if b >= end {
                    break;
                }
                active.for_each_set_in(b, (b + BASIC_CHUNK).min(end), |v| {
                    signal(&mut emit_ctx, v)
                });
            }
            emit_ctx.flush();
        });
    }

    /// Dense round: pull along incoming edges into active sinks. Exists
    /// for the gated-off dense mode; requires an all-compute world.
    fn dense_round<R, M, DS, DL>(
        &self,
        dense_signal: &DS,
        dense_slot: &DL,
        dense_selective: Option<&Bitmap>,
    ) -> R
    where
        R: Accum,
        M: Codec,
        DS: Fn(&mut SignalCtx<'_, M>, VertexId, AdjView<'_, E>) + Sync,
        DL: Fn(VertexId, M) -> R + Sync,
    {
        let partitions = self.topology.partitions;
        assert_eq!(
            partitions, self.topology.compute_partitions,
            "dense traversal requires an all-compute world"
        );
        let sockets = self.config.sockets;
        let rank = self.ctx.rank();
        let unit = msg_unit_size::<M>();
        let offs = &self.partition_offset;

        // Share the selective frontier so peers can skip inactive sinks.
        if let Some(selective) = dense_selective {
            if partitions > 1 {
                for step in 1..partitions {
                    let peer = (rank + step) % partitions;
                    let w0 = (offs[rank] as usize) >> 6;
                    let words = (self.owned_vertices as usize + 63) / 64;
                    self.ctx.send(
                        peer,
                        Tag::SyncBitmap,
                        rank as u32,
                        encode_slice(&selective.words_from(w0, words)),
                    );
                }
                for step in 1..partitions {
                    let peer = (rank + partitions - step) % partitions;
                    let bytes = self.ctx.recv(peer, Tag::SyncBitmap, peer as u32);
                    let w0 = (offs[peer] as usize) >> 6;
                    selective.store_words(w0, &decode_slice::<u64>(&bytes));
                }
                self.ctx.barrier(Scope::Compute);
            }
        }

        for i in 0..partitions {
            for s in 0..sockets {
                let span = (offs[i + 1] - offs[i]) as usize;
                self.send_buffer[i][s].reset(unit * span * sockets);
                self.recv_buffer[i][s]
                    .reset(unit * self.owned_vertices as usize * sockets);
            }
        }

        let send_queue: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        let send_grew = Condvar::new();
        let recv_queue: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        let recv_grew = Condvar::new();

        let mut reducer = R::ZERO;
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for step in 0..partitions - 1 {
                    let i = {
                        let mut queue = send_queue.lock();
                        while queue.len() <= step {
                            send_grew.wait(&mut queue);
                        }
                        queue[step]
                    };
                    for s in 0..sockets {
                        let buf = &self.send_buffer[i][s];
                        let bytes = buf.data.bytes(buf.units() * unit).to_vec();
                        self.ctx
                            .send(i, Tag::PassMessage, stream_label(i, s, sockets), bytes);
                    }
                }
            });
            scope.spawn(|| {
                for step in 1..partitions {
                    let i = (rank + partitions - step) % partitions;
                    for s in 0..sockets {
                        let bytes =
                            self.ctx.recv(i, Tag::PassMessage, stream_label(rank, s, sockets));
                        self.recv_buffer[i][s].install(unit, &bytes);
                    }
                    recv_queue.lock().push(i);
                    recv_grew.notify_all();
                }
                recv_queue.lock().push(rank);
                recv_grew.notify_all();
            });

            // Signal along incoming adjacency, one destination partition
            // per step over the tuned chunks.
            let mut current = rank;
            for _ in 0..partitions {
                current = (current + 1) % partitions;
                let i = current;
                self.executor.init_tuned(&self.tuned_chunks_dense[i]);
                self.executor.run(|t| {
                    let socket = self.executor.socket_of(t);
                    let mut emit_ctx = SignalCtx::<M>::new(
                        &self.send_buffer[i][socket],
                        self.config.local_send_buffer_limit,
                    );
                    let drive = |owner: usize, begin: u64, end: u64,
                                 emit_ctx: &mut SignalCtx<'_, M>| {
                        let s = self.executor.socket_of(owner);
                        let csr = &self.in_store.sockets[s];
                        let adj = adj_unit_size::<E>();
                        for pos in begin..end {
                            let entry = csr.compressed[pos as usize];
                            let next = csr.compressed[pos as usize + 1];
                            if let Some(selective) = dense_selective {
                                if !selective.get(entry.vertex) {
                                    continue;
                                }
                            }
                            let view = AdjView::new(
                                &csr.list[entry.index as usize * adj..next.index as usize * adj],
                            );
                            dense_signal(emit_ctx, entry.vertex, view);
                        }
                    };
                    while let Some((b, e)) = self.executor.claim(t) {
                        drive(t, b, e, &mut emit_ctx);
                    }
                    self.executor.mark_stealing(t);
                    for offset in 1..self.executor.threads() {
                        let victim = (t + offset) % self.executor.threads();
                        while self.executor.is_working(victim) {
                            match self.executor.claim(victim) {
                                Some((b, e)) => drive(victim, b, e, &mut emit_ctx),
                                None => std::hint::spin_loop(),
                            }
                        }
                    }
                    emit_ctx.flush();
                    0u64
                });
                if i != rank {
                    send_queue.lock().push(i);
                    send_grew.notify_all();
                }
            }

            // Consume messages addressed to this rank's masters.
            for step in 0..partitions {
                let i = {
                    let mut queue = recv_queue.lock();
                    while queue.len() <= step {
                        recv_grew.wait(&mut queue);
                    }
                    queue[step]
                };
                let used = if i == rank {
                    &self.send_buffer[i]
                } else {
                    &self.recv_buffer[i]
                };
                for buf in used.iter().take(sockets) {
                    let n = buf.units();
                    let bytes = buf.data.bytes(n * unit);
                    self.executor.init_mirror_stripes(n as u64);
                    let r = self.executor.work_steal(|_owner, begin, end| {
                        let mut local = R::ZERO;
                        for k in begin..end {
                            let (v, msg) = decode_msg::<M>(bytes, k as usize);
                            local = local.combine(dense_slot(v, msg));
                        }
                        local
                    });
                    reducer = reducer.combine(r);
                }
            }
        });
        reducer
    }

    /// Per-partition, per-thread chunks over the compressed incoming
    /// index, balanced by edge count. Used by the dense schedule.
    fn tune_chunks(&self) -> Vec<Vec<(u64, u64)>> {
        let partitions = self.topology.partitions;
        let threads = self.executor.threads();
        let tps = self.executor.threads_per_socket();
        let mut tuned = vec![vec![(0u64, 0u64); threads]; partitions];
        let mut current = self.ctx.rank();
        for _ in 0..partitions {
            current = (current + 1) % partitions;
            let i = current;
            for s in 0..self.config.sockets {
                let csr = &self.in_store.sockets[s];
                let k = csr.compressed_vertices();
                let mut first = 0usize;
                while first < k && csr.compressed[first].vertex < self.partition_offset[i] {
                    first += 1;
                }
                let mut last = first;
                while last < k && csr.compressed[last].vertex < self.partition_offset[i + 1] {
                    last += 1;
                }
                let weight = |pos: usize| {
                    csr.compressed[pos + 1].index - csr.compressed[pos].index + self.alpha
                };
                let mut remaining: u64 = (first..last).map(weight).sum();
                let mut cursor = first as u64;
                for j in 0..tps {
                    let t = s * tps + j;
                    let chunks_left = (tps - j) as u64;
                    if chunks_left == 1 {
                        tuned[i][t] = (cursor, last as u64);
                        break;
                    }
                    let expected = remaining / chunks_left;
                    let mut got: u64 = 0;
                    let mut stop = cursor;
                    for pos in cursor..last as u64 {
                        got += weight(pos as usize);
                        stop = pos + 1;
                        if got >= expected {
                            break;
                        }
                    }
                    tuned[i][t] = (cursor, stop);
                    remaining -= got;
                    cursor = stop;
                }
            }
        }
        tuned
    }

    /// Swaps every paired incoming/outgoing structure; two transposes
    /// restore the original state exactly.
    pub fn transpose(&mut self) {
        std::mem::swap(&mut self.out_degree, &mut self.in_degree);
        std::mem::swap(&mut self.out_store, &mut self.in_store);
        std::mem::swap(&mut self.out_cache, &mut self.in_cache);
        std::mem::swap(&mut self.tuned_chunks_dense, &mut self.tuned_chunks_sparse);
    }
}

fn install_slice<T: Codec>(array: &mut [T], begin: VertexId, end: VertexId, bytes: &[u8]) {
    let expected = (end - begin) as usize * T::SIZE;
    assert_eq!(bytes.len(), expected, "gathered slice has the wrong length");
    let vals = decode_slice::<T>(bytes);
    array[begin as usize..end as usize].copy_from_slice(&vals);
}

/// Streams `[offset, offset + len)` of the edge file in bulk chunks.
fn stream_edges<E: EdgeData>(
    path: &Path,
    offset: u64,
    len: u64,
    mut f: impl FnMut(EdgeRecord<E>),
) -> Result<()> {
    let edge_unit = edge_unit_size::<E>();
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; SHUFFLE_CHUNK * edge_unit];
    let mut remaining = len as usize;
    while remaining > 0 {
        let take = remaining.min(buf.len());
        file.read_exact(&mut buf[..take])?;
        for chunk in buf[..take].chunks_exact(edge_unit) {
            f(EdgeRecord::read(chunk));
        }
        remaining -= take;
    }
    Ok(())
}

/// Builds one direction's per-socket CSR from the shuffled edge stream:
/// a counting pass, a prefix-sum seal, and a placement pass.
#[allow(clippy::too_many_arguments)]
fn build_direction<E: EdgeData>(
    ctx: &NodeCtx,
    path: &Path,
    my_offset: u64,
    my_bytes: u64,
    vertices: VertexId,
    partition_offset: &[VertexId],
    local_partition_offset: &[VertexId],
    side: BuildSide,
    symmetric: bool,
) -> Result<DirectionStore> {
    let sockets = local_partition_offset.len() - 1;
    let mut builders: Vec<CsrBuilder> = (0..sockets)
        .map(|_| CsrBuilder::new(vertices as usize, adj_unit_size::<E>()))
        .collect();

    let local_socket = |v: VertexId| -> usize {
        for s in 0..sockets {
            if v >= local_partition_offset[s] && v < local_partition_offset[s + 1] {
                return s;
            }
        }
        panic!("vertex {v} shuffled to the wrong rank");
    };

    for placement in [false, true] {
        if placement {
            for b in &mut builders {
                b.seal_counts();
            }
        }
        let label = pass_label(side, placement);
        builders = std::thread::scope(|scope| -> Result<Vec<CsrBuilder>> {
            let local_socket = &local_socket;
            let receiver = scope.spawn(move || {
                let mut builders = builders;
                let mut finished = 0usize;
                let edge_unit = edge_unit_size::<E>();
                while finished < ctx.partitions() {
                    let (_from, bytes) = ctx.recv_labeled(Tag::ShuffleGraph, label);
                    if bytes.is_empty() {
                        finished += 1;
                        continue;
                    }
                    assert!(
                        bytes.len() % edge_unit == 0,
                        "shuffle payload is not a record multiple"
                    );
                    for chunk in bytes.chunks_exact(edge_unit) {
                        let rec = EdgeRecord::<E>::read(chunk);
                        let (key, index_vertex, neighbour) = match side {
                            BuildSide::Outgoing => (rec.dst, rec.src, rec.dst),
                            BuildSide::Incoming => (rec.src, rec.dst, rec.src),
                        };
                        assert!(
                            key >= partition_offset[ctx.rank()]
                                && key < partition_offset[ctx.rank() + 1],
                            "record shuffled to the wrong partition"
                        );
                        let socket = local_socket(key);
                        if placement {
                            let unit = adj_unit_size::<E>();
                            let mut record = vec![0u8; unit];
                            neighbour.write(&mut record[0..4]);
                            rec.data.write(&mut record[4..unit]);
                            builders[socket].place(index_vertex, &record);
                        } else {
                            builders[socket].count(index_vertex);
                        }
                    }
                }
                builders
            });

            // Stream this rank's share and shuffle records to the rank
            // owning the key vertex.
            let edge_unit = edge_unit_size::<E>();
            let mut outbox: Vec<Vec<u8>> = (0..ctx.partitions()).map(|_| Vec::new()).collect();
            let route = |rec: EdgeRecord<E>, outbox: &mut Vec<Vec<u8>>| {
                let key = match side {
                    BuildSide::Outgoing => rec.dst,
                    BuildSide::Incoming => rec.src,
                };
                let dest = partition_of(partition_offset, key);
                let buf = &mut outbox[dest];
                let at = buf.len();
                buf.resize(at + edge_unit, 0);
                rec.write(&mut buf[at..]);
                if buf.len() == SHUFFLE_CHUNK * edge_unit {
                    ctx.send(dest, Tag::ShuffleGraph, label, std::mem::take(buf));
                }
            };
            stream_edges::<E>(path, my_offset, my_bytes, |rec| {
                route(rec, &mut outbox);
                if symmetric {
                    let mirrored = EdgeRecord {
                        src: rec.dst,
                        dst: rec.src,
                        data: rec.data,
                    };
                    route(mirrored, &mut outbox);
                }
            })?;
            for (dest, buf) in outbox.iter_mut().enumerate() {
                if !buf.is_empty() {
                    ctx.send(dest, Tag::ShuffleGraph, label, std::mem::take(buf));
                }
            }
            for dest in 0..ctx.partitions() {
                ctx.send(dest, Tag::ShuffleGraph, label, Vec::new());
            }
            Ok(receiver.join().expect("shuffle receiver panicked"))
        })?;
    }

    let store = DirectionStore {
        sockets: builders.into_iter().map(CsrBuilder::finish).collect(),
    };
    debug!(
        rank = ctx.rank(),
        edges = store.total_edges(),
        side = matches!(side, BuildSide::Outgoing),
        "direction built"
    );
    Ok(store)
}

/// Exposes a far-memory rank's CSR arrays through the window registry.
fn publish_windows(ctx: &NodeCtx, rank: usize, dir: Direction, store: &DirectionStore) {
    for (s, csr) in store.sockets.iter().enumerate() {
        let key = |kind| WindowKey {
            partition: rank,
            socket: s,
            dir,
            kind,
        };
        ctx.windows()
            .publish_words(key(WindowKind::Bitmap), csr.bitmap.to_words().into());
        ctx.windows()
            .publish_words(key(WindowKind::Index), Arc::clone(&csr.index));
        ctx.windows()
            .publish_bytes(key(WindowKind::List), Arc::clone(&csr.list));
    }
}

impl<E: EdgeData> Graph<E> {
    pub fn outgoing_socket(&self, s: usize) -> &SocketCsr {
        &self.out_store.sockets[s]
    }

    pub fn incoming_socket(&self, s: usize) -> &SocketCsr {
        &self.in_store.sockets[s]
    }
}

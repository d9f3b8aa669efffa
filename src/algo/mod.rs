//! Vertex-centric algorithm drivers.
//!
//! Clients of the edge engine: each algorithm is a pair of signal/slot
//! callbacks driven to a fixed point with `process_edges`, with
//! per-vertex state held in atomics so concurrent slot calls for the
//! same destination compose. Results are gathered onto compute rank 0;
//! other ranks return their partial arrays.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::bitmap::Bitmap;
use crate::engine::Graph;
use crate::primitives::atomic::{add_f64, claim_u32, min_f64, min_u32};
use crate::types::{Empty, VertexId};

const GATHER_ROOT: usize = 0;

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, val: f64) {
    cell.store(val.to_bits(), Ordering::Relaxed);
}

/// Power iteration with uniform teleport; returns the gathered ranks.
pub fn pagerank(graph: &Graph<Empty>, iterations: usize, damping: f64) -> Vec<f64> {
    let n = graph.vertices as usize;
    let uniform = 1.0 / graph.vertices as f64;
    let curr: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(uniform.to_bits())).collect();
    let next: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(0)).collect();
    let active = graph.alloc_vertex_subset();
    active.fill();

    for _ in 0..iterations {
        for cell in &next {
            store_f64(cell, 0.0);
        }
        let _edges: u64 = graph.process_edges_sparse(
            |emit_ctx, v| {
                let degree = graph.out_degree(v).max(1) as f64;
                emit_ctx.emit(v, load_f64(&curr[v as usize]) / degree);
            },
            |_v, contribution: f64, adj| {
                for u in adj.iter() {
                    add_f64(&next[u.neighbour as usize], contribution);
                }
                adj.len() as u64
            },
            &active,
        );
        let teleport = (1.0 - damping) * uniform;
        let _n: u64 = graph.process_vertices(
            |v| {
                store_f64(
                    &curr[v as usize],
                    teleport + damping * load_f64(&next[v as usize]),
                );
                1
            },
            &active,
        );
    }

    let mut out: Vec<f64> = curr.iter().map(load_f64).collect();
    graph.gather_vertex_array(&mut out, GATHER_ROOT);
    out
}

/// Frontier BFS; unreached vertices keep `u32::MAX`.
pub fn bfs(graph: &Graph<Empty>, root: VertexId) -> Vec<u32> {
    let n = graph.vertices as usize;
    let depth: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(u32::MAX)).collect();
    depth[root as usize].store(0, Ordering::Relaxed);
    let mut active = graph.alloc_vertex_subset();
    let mut next_active = graph.alloc_vertex_subset();
    active.set(root);

    loop {
        next_active.clear();
        let discovered: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, depth[v as usize].load(Ordering::Relaxed)),
            |_v, d: u32, adj| {
                let mut found = 0u64;
                for u in adj.iter() {
                    if claim_u32(&depth[u.neighbour as usize], u32::MAX, d + 1) {
                        next_active.set(u.neighbour);
                        found += 1;
                    }
                }
                found
            },
            &active,
        );
        std::mem::swap(&mut active, &mut next_active);
        if discovered == 0 {
            break;
        }
    }

    let mut out: Vec<u32> = depth.iter().map(|d| d.load(Ordering::Relaxed)).collect();
    graph.gather_vertex_array(&mut out, GATHER_ROOT);
    out
}

/// Bellman-Ford style relaxation over weighted edges.
pub fn sssp(graph: &Graph<f64>, root: VertexId) -> Vec<f64> {
    let n = graph.vertices as usize;
    let dist: Vec<AtomicU64> = (0..n)
        .map(|_| AtomicU64::new(f64::INFINITY.to_bits()))
        .collect();
    store_f64(&dist[root as usize], 0.0);
    let mut active = graph.alloc_vertex_subset();
    let mut next_active = graph.alloc_vertex_subset();
    active.set(root);

    loop {
        next_active.clear();
        let relaxed: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, load_f64(&dist[v as usize])),
            |_v, d: f64, adj| {
                let mut improved = 0u64;
                for u in adj.iter() {
                    if min_f64(&dist[u.neighbour as usize], d + u.data) {
                        next_active.set(u.neighbour);
                        improved += 1;
                    }
                }
                improved
            },
            &active,
        );
        std::mem::swap(&mut active, &mut next_active);
        if relaxed == 0 {
            break;
        }
    }

    let mut out: Vec<f64> = dist.iter().map(load_f64).collect();
    graph.gather_vertex_array(&mut out, GATHER_ROOT);
    out
}

/// Label propagation to the minimum reachable id; the representative of
/// each component is its smallest vertex.
pub fn connected_components(graph: &Graph<Empty>) -> Vec<u32> {
    let n = graph.vertices as usize;
    let label: Vec<AtomicU32> = (0..n).map(|v| AtomicU32::new(v as u32)).collect();
    let mut active = graph.alloc_vertex_subset();
    let mut next_active = graph.alloc_vertex_subset();
    active.fill();

    loop {
        next_active.clear();
        let lowered: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, label[v as usize].load(Ordering::Relaxed)),
            |_v, candidate: u32, adj| {
                let mut changed = 0u64;
                for u in adj.iter() {
                    if min_u32(&label[u.neighbour as usize], candidate) {
                        next_active.set(u.neighbour);
                        changed += 1;
                    }
                }
                changed
            },
            &active,
        );
        std::mem::swap(&mut active, &mut next_active);
        if lowered == 0 {
            break;
        }
    }

    let mut out: Vec<u32> = label.iter().map(|l| l.load(Ordering::Relaxed)).collect();
    graph.gather_vertex_array(&mut out, GATHER_ROOT);
    out
}

/// Single-source betweenness dependency (Brandes): a forward path-count
/// sweep by BFS level, a transpose, and a backward accumulation sweep.
pub fn betweenness(graph: &mut Graph<Empty>, root: VertexId) -> Vec<f64> {
    let n = graph.vertices as usize;
    let depth: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(u32::MAX)).collect();
    let paths: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(0)).collect();
    depth[root as usize].store(0, Ordering::Relaxed);
    store_f64(&paths[root as usize], 1.0);

    let mut active = graph.alloc_vertex_subset();
    let mut next_active = graph.alloc_vertex_subset();
    active.set(root);
    let mut levels: Vec<Bitmap> = vec![active.clone()];

    loop {
        let level = levels.len() as u32;
        next_active.clear();
        let discovered: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, load_f64(&paths[v as usize])),
            |_v, count: f64, adj| {
                let mut found = 0u64;
                for u in adj.iter() {
                    let cell = &depth[u.neighbour as usize];
                    if claim_u32(cell, u32::MAX, level) {
                        found += 1;
                    }
                    if cell.load(Ordering::Relaxed) == level {
                        add_f64(&paths[u.neighbour as usize], count);
                        next_active.set(u.neighbour);
                    }
                }
                found
            },
            &active,
        );
        if discovered == 0 {
            break;
        }
        levels.push(next_active.clone());
        std::mem::swap(&mut active, &mut next_active);
    }

    // Backward sweep over the reversed edges, deepest level first.
    let delta: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(0)).collect();
    graph.transpose();
    for level in (1..levels.len()).rev() {
        let frontier = &levels[level];
        let parent_level = level as u32 - 1;
        let _edges: u64 = graph.process_edges_sparse(
            |emit_ctx, v| {
                let share = (1.0 + load_f64(&delta[v as usize])) / load_f64(&paths[v as usize]);
                emit_ctx.emit(v, share)
            },
            |_v, share: f64, adj| {
                for u in adj.iter() {
                    let w = u.neighbour as usize;
                    if depth[w].load(Ordering::Relaxed) == parent_level {
                        add_f64(&delta[w], load_f64(&paths[w]) * share);
                    }
                }
                adj.len() as u64
            },
            frontier,
        );
    }
    graph.transpose();

    let mut out: Vec<f64> = delta.iter().map(load_f64).collect();
    out[root as usize] = 0.0;
    graph.gather_vertex_array(&mut out, GATHER_ROOT);
    out
}

//! End-to-end rounds over small graphs: the algorithm drivers, the
//! delegation protocol, persistence round-trips, and transpose.

use std::path::PathBuf;

use tempfile::TempDir;

use umbrage::algo;
use umbrage::types::edge_unit_size;
use umbrage::{Cluster, ClusterTopology, Empty, Graph, GraphConfig, Scope, VertexId};

fn write_edges(dir: &TempDir, name: &str, edges: &[(u32, u32)]) -> PathBuf {
    let path = dir.path().join(name);
    let mut bytes = Vec::with_capacity(edges.len() * edge_unit_size::<Empty>());
    for &(src, dst) in edges {
        bytes.extend_from_slice(&src.to_le_bytes());
        bytes.extend_from_slice(&dst.to_le_bytes());
    }
    std::fs::write(&path, bytes).unwrap();
    path
}

fn write_weighted_edges(dir: &TempDir, name: &str, edges: &[(u32, u32, f64)]) -> PathBuf {
    let path = dir.path().join(name);
    let mut bytes = Vec::with_capacity(edges.len() * edge_unit_size::<f64>());
    for &(src, dst, w) in edges {
        bytes.extend_from_slice(&src.to_le_bytes());
        bytes.extend_from_slice(&dst.to_le_bytes());
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    std::fs::write(&path, bytes).unwrap();
    path
}

fn test_config(sockets: usize) -> GraphConfig {
    GraphConfig {
        threads: 2 * sockets,
        sockets,
        page_size: 1,
        edge_cache_entries: 64,
        prefetch_queue_size: 256,
        ..GraphConfig::default()
    }
}

fn ring(n: u32) -> Vec<(u32, u32)> {
    (0..n).map(|v| (v, (v + 1) % n)).collect()
}

#[test]
fn pagerank_on_a_ring_converges_uniformly() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "ring8.bin", &ring(8));
    let topo = ClusterTopology::all_compute(2);
    let results = Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let graph = Graph::<Empty>::load_directed(ctx, &path, 8, test_config(1)).unwrap();
        let ranks = algo::pagerank(&graph, 20, 0.85);
        (rank, ranks)
    });
    let (_, ranks) = results.into_iter().find(|(r, _)| *r == 0).unwrap();
    for (v, r) in ranks.iter().enumerate() {
        assert!((r - 0.125).abs() < 1e-6, "vertex {v} has rank {r}");
    }
}

#[test]
fn bfs_on_a_path_yields_hop_counts() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "path.bin", &[(0, 1), (1, 2), (2, 3)]);
    let topo = ClusterTopology::all_compute(1);
    let results = Cluster::launch(topo, |ctx| {
        let graph = Graph::<Empty>::load_directed(ctx, &path, 4, test_config(1)).unwrap();
        algo::bfs(&graph, 0)
    });
    assert_eq!(results[0], vec![0, 1, 2, 3]);
}

#[test]
fn sssp_relaxes_to_shortest_distances() {
    let dir = TempDir::new().unwrap();
    let path = write_weighted_edges(
        &dir,
        "weighted.bin",
        &[
            (0, 1, 1.0),
            (0, 2, 4.0),
            (1, 2, 2.0),
            (1, 3, 7.0),
            (2, 3, 3.0),
        ],
    );
    let topo = ClusterTopology::all_compute(2);
    let results = Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let graph = Graph::<f64>::load_directed(ctx, &path, 4, test_config(1)).unwrap();
        (rank, algo::sssp(&graph, 0))
    });
    let (_, dists) = results.into_iter().find(|(r, _)| *r == 0).unwrap();
    let expected = [0.0, 1.0, 3.0, 6.0];
    for (v, (got, want)) in dists.iter().zip(expected).enumerate() {
        assert!((got - want).abs() < 1e-12, "vertex {v}: {got} != {want}");
    }
}

#[test]
fn connected_components_finds_both_triangles() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(
        &dir,
        "triangles.bin",
        &[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)],
    );
    let topo = ClusterTopology::all_compute(2);
    let results = Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let graph =
            Graph::<Empty>::load_undirected_from_directed(ctx, &path, 6, test_config(1)).unwrap();
        (rank, algo::connected_components(&graph))
    });
    let (_, labels) = results.into_iter().find(|(r, _)| *r == 0).unwrap();
    assert_eq!(labels, vec![0, 0, 0, 3, 3, 3]);
}

#[test]
fn undirected_load_doubles_every_degree() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "cycle4.bin", &[(0, 1), (1, 2), (2, 3), (3, 0)]);
    let topo = ClusterTopology::all_compute(1);
    Cluster::launch(topo, |ctx| {
        let graph =
            Graph::<Empty>::load_undirected_from_directed(ctx, &path, 4, test_config(1)).unwrap();
        for v in 0..4u32 {
            assert_eq!(graph.out_degree(v), 2, "out degree of {v}");
            assert_eq!(graph.in_degree(v), 2, "in degree of {v}");
            assert!(graph.outgoing_socket(0).bitmap.get(v));
            assert!(graph.incoming_socket(0).bitmap.get(v));
        }
        assert_eq!(graph.outgoing_socket(0).edges, 8);
    });
}

#[test]
fn csr_counts_match_the_index_everywhere() {
    let dir = TempDir::new().unwrap();
    let edges = vec![(0u32, 3u32), (0, 5), (1, 3), (2, 6), (4, 7), (5, 0), (6, 1)];
    let path = write_edges(&dir, "counts.bin", &edges);
    let topo = ClusterTopology::all_compute(2);
    let edges_ref = &edges;
    Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let graph = Graph::<Empty>::load_directed(ctx, &path, 8, test_config(2)).unwrap();
        let lo = graph.partition_offset[rank];
        let hi = graph.partition_offset[rank + 1];
        // Per-source record counts across sockets match the edges whose
        // destination lands on this rank.
        for v in 0..8u32 {
            let expected = edges_ref
                .iter()
                .filter(|(s, d)| *s == v && *d >= lo && *d < hi)
                .count() as u64;
            let got: u64 = (0..2)
                .map(|s| {
                    let csr = graph.outgoing_socket(s);
                    csr.range(v).map(|(a, b)| b - a).unwrap_or(0)
                })
                .sum();
            assert_eq!(got, expected, "rank {rank} vertex {v}");
        }
        // Socket totals sum to this rank's landed edges.
        let landed = edges_ref.iter().filter(|(_, d)| *d >= lo && *d < hi).count() as u64;
        let total: u64 = (0..2).map(|s| graph.outgoing_socket(s).edges).sum();
        assert_eq!(total, landed);
        // Index agrees with the compressed table after restore.
        for s in 0..2 {
            let csr = graph.outgoing_socket(s);
            for w in csr.compressed.windows(2) {
                assert_eq!(csr.index[w[0].vertex as usize], w[0].index);
                assert_eq!(csr.index[w[0].vertex as usize + 1], w[1].index);
            }
        }
    });
}

#[test]
fn delegated_round_short_circuits_and_reduces_frontier_edges() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "ring6.bin", &ring(6));
    // 4 compute + 2 far-memory ranks; every partition owns one vertex,
    // so vertices 4 and 5 live in far memory (delegates 0 and 1).
    let topo = ClusterTopology::new(6, 4);
    let results = Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let is_compute = ctx.is_compute();
        let graph = Graph::<Empty>::load_directed(ctx, &path, 6, test_config(1)).unwrap();
        if is_compute {
            assert_eq!(
                graph.partition_offset,
                vec![0, 1, 2, 3, 4, 5, 6],
                "one vertex per partition"
            );
        }
        // Frontier {3, 5}: 3 -> 4 lands on far partition 4 (served
        // through rank 0's cache), 5 -> 0 is signalled by 5's delegate
        // and consumed locally on rank 0.
        let active = graph.alloc_vertex_subset();
        active.set(3);
        active.set(5);
        let slot_calls: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, 0u32),
            |_v, _msg: u32, adj| adj.len() as u64,
            &active,
        );
        // A frontier of just {0} reduces to its single outgoing edge.
        let from_zero = graph.alloc_vertex_subset();
        from_zero.set(0);
        let single: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, 0u32),
            |_v, _msg: u32, adj| adj.len() as u64,
            &from_zero,
        );
        if is_compute {
            assert_eq!(single, 1);
        }
        (rank, is_compute, slot_calls, graph.metrics())
    });
    for (rank, is_compute, slot_calls, metrics) in results {
        if is_compute {
            assert_eq!(slot_calls, 2, "rank {rank}: one slot call per frontier edge");
        } else {
            assert_eq!(slot_calls, 0, "far rank {rank} runs no rounds");
        }
        if rank == 0 {
            // Rank 0 delegates partition 4 and served 3 -> 4 from it.
            assert!(metrics.outgoing.bitmap_hits + metrics.outgoing.bitmap_misses > 0);
            assert_eq!(
                metrics.outgoing.edge_hits + metrics.outgoing.edge_misses,
                1,
                "exactly one delegated adjacency lookup"
            );
        }
    }
}

#[test]
fn delegation_is_transparent_to_results() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "ring6b.bin", &ring(6));
    let run = |topo: ClusterTopology, config: GraphConfig| -> Vec<u32> {
        let path = &path;
        let results = Cluster::launch(topo, move |ctx| {
            let rank = ctx.rank();
            let graph = Graph::<Empty>::load_directed(ctx, path, 6, config.clone()).unwrap();
            (rank, algo::bfs(&graph, 0))
        });
        results.into_iter().find(|(r, _)| *r == 0).unwrap().1
    };
    let all_compute = run(ClusterTopology::all_compute(6), test_config(1));
    let delegated = run(ClusterTopology::new(6, 4), test_config(1));
    let mut cache_off = test_config(1);
    cache_off.bitmap_cache = false;
    cache_off.index_cache = false;
    cache_off.edge_cache = false;
    let delegated_uncached = run(ClusterTopology::new(6, 4), cache_off);
    assert_eq!(all_compute, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(delegated, all_compute, "delegation changed results");
    assert_eq!(delegated_uncached, all_compute, "caching changed results");
}

#[test]
fn repeated_rounds_hit_the_edge_cache() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "ring6c.bin", &ring(6));
    let topo = ClusterTopology::new(6, 4);
    let results = Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let graph = Graph::<Empty>::load_directed(ctx, &path, 6, test_config(1)).unwrap();
        let active = graph.alloc_vertex_subset();
        active.set(3);
        let first: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, 0u32),
            |_v, _msg: u32, adj| adj.len() as u64,
            &active,
        );
        let second: u64 = graph.process_edges_sparse(
            |emit_ctx, v| emit_ctx.emit(v, 0u32),
            |_v, _msg: u32, adj| adj.len() as u64,
            &active,
        );
        (rank, first, second, graph.metrics())
    });
    for (rank, first, second, metrics) in results {
        if rank == 0 {
            assert_eq!(first, 1);
            assert_eq!(second, 1, "cached adjacency produced a different result");
            assert_eq!(metrics.outgoing.edge_misses, 1, "first lookup misses");
            assert_eq!(metrics.outgoing.edge_hits, 1, "second lookup hits");
        }
    }
}

#[test]
fn vertex_array_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "dump_ring.bin", &ring(8));
    let array_path = dir.path().join("ranks.bin");
    let topo = ClusterTopology::all_compute(2);
    let array_path_ref = &array_path;
    Cluster::launch(topo, |ctx| {
        let graph = Graph::<Empty>::load_directed(ctx, &path, 8, test_config(1)).unwrap();
        let mut array = graph.alloc_vertex_array::<u64>();
        for (v, cell) in array.iter_mut().enumerate() {
            *cell = (v as u64) * 31 + 7;
        }
        graph.dump_vertex_array(&array, array_path_ref).unwrap();
        let mut restored = graph.alloc_vertex_array::<u64>();
        graph.restore_vertex_array(&mut restored, array_path_ref).unwrap();
        let rank = graph.ctx().rank();
        let lo = graph.partition_offset[rank] as usize;
        let hi = graph.partition_offset[rank + 1] as usize;
        assert_eq!(&restored[lo..hi], &array[lo..hi]);
        graph.ctx().barrier(Scope::Compute);
    });
    // The file holds every slice byte-for-byte.
    let bytes = std::fs::read(&array_path).unwrap();
    let expected: Vec<u8> = (0..8u64).flat_map(|v| (v * 31 + 7).to_le_bytes()).collect();
    assert_eq!(bytes, expected);
}

#[test]
fn gather_collects_owned_and_delegated_slices() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "gather_ring.bin", &ring(6));
    let topo = ClusterTopology::new(6, 4);
    let results = Cluster::launch(topo, |ctx| {
        let rank = ctx.rank();
        let graph = Graph::<Empty>::load_directed(ctx, &path, 6, test_config(1)).unwrap();
        let mut array = graph.alloc_vertex_array::<u32>();
        if graph.ctx().is_compute() {
            let fill = |a: &mut [u32], lo: VertexId, hi: VertexId| {
                for v in lo..hi {
                    a[v as usize] = v * 100;
                }
            };
            fill(&mut array, graph.partition_offset[rank], graph.partition_offset[rank + 1]);
            for &fp in graph.delegated_partitions() {
                fill(&mut array, graph.partition_offset[fp], graph.partition_offset[fp + 1]);
            }
        }
        graph.gather_vertex_array(&mut array, 0);
        (rank, array)
    });
    let (_, gathered) = results.into_iter().find(|(r, _)| *r == 0).unwrap();
    assert_eq!(gathered, vec![0, 100, 200, 300, 400, 500]);
}

#[test]
fn double_transpose_restores_every_structure() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "transpose.bin", &[(0, 1), (0, 2), (2, 3), (3, 0)]);
    let topo = ClusterTopology::all_compute(1);
    Cluster::launch(topo, |ctx| {
        let mut graph = Graph::<Empty>::load_directed(ctx, &path, 4, test_config(1)).unwrap();
        let out_list = graph.outgoing_socket(0).list.as_ptr() as usize;
        let in_list = graph.incoming_socket(0).list.as_ptr() as usize;
        let out_deg: Vec<u32> = (0..4).map(|v| graph.out_degree(v)).collect();
        let metrics = graph.metrics();

        graph.transpose();
        assert_eq!(graph.outgoing_socket(0).list.as_ptr() as usize, in_list);
        let in_as_out: Vec<u32> = (0..4).map(|v| graph.out_degree(v)).collect();
        assert_ne!(out_deg, in_as_out, "transpose swapped degree views");

        graph.transpose();
        assert_eq!(graph.outgoing_socket(0).list.as_ptr() as usize, out_list);
        assert_eq!(graph.incoming_socket(0).list.as_ptr() as usize, in_list);
        let back: Vec<u32> = (0..4).map(|v| graph.out_degree(v)).collect();
        assert_eq!(back, out_deg);
        assert_eq!(graph.metrics(), metrics);
    });
}

#[test]
fn transposed_rounds_walk_reversed_edges() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "reverse.bin", &[(0, 1), (1, 2), (2, 3)]);
    let topo = ClusterTopology::all_compute(1);
    Cluster::launch(topo, |ctx| {
        let mut graph = Graph::<Empty>::load_directed(ctx, &path, 4, test_config(1)).unwrap();
        graph.transpose();
        let depths = algo::bfs(&graph, 3);
        assert_eq!(depths, vec![3, 2, 1, 0]);
    });
}

#[test]
fn betweenness_weights_the_middle_of_a_path() {
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "bc_path.bin", &[(0, 1), (1, 2), (2, 3)]);
    let topo = ClusterTopology::all_compute(1);
    Cluster::launch(topo, |ctx| {
        let mut graph = Graph::<Empty>::load_directed(ctx, &path, 4, test_config(1)).unwrap();
        let deps = algo::betweenness(&mut graph, 0);
        // Dependencies of 0: vertex 1 sits on paths to 2 and 3, vertex 2
        // on the path to 3, the endpoints on none.
        assert_eq!(deps, vec![0.0, 2.0, 1.0, 0.0]);
    });
}

#[test]
fn random_graph_components_agree_across_topologies() {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let vertices = 32u32;
    let edges: Vec<(u32, u32)> = (0..48)
        .map(|_| (rng.gen_range(0..vertices), rng.gen_range(0..vertices)))
        .collect();
    let dir = TempDir::new().unwrap();
    let path = write_edges(&dir, "random.bin", &edges);

    let run = |topo: ClusterTopology, config: GraphConfig| -> Vec<u32> {
        let path = &path;
        let results = Cluster::launch(topo, move |ctx| {
            let rank = ctx.rank();
            let graph =
                Graph::<Empty>::load_undirected_from_directed(ctx, path, vertices, config.clone())
                    .unwrap();
            (rank, algo::connected_components(&graph))
        });
        results.into_iter().find(|(r, _)| *r == 0).unwrap().1
    };

    let single = run(ClusterTopology::all_compute(1), test_config(1));
    let spread = run(ClusterTopology::all_compute(3), test_config(2));
    let delegated = run(ClusterTopology::new(4, 3), test_config(1));
    assert_eq!(single, spread);
    assert_eq!(single, delegated);
}

#[test]
fn malformed_file_size_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ragged.bin");
    std::fs::write(&path, vec![0u8; 13]).unwrap();
    let topo = ClusterTopology::all_compute(1);
    Cluster::launch(topo, |ctx| {
        let err = Graph::<Empty>::load_directed(ctx, &path, 4, test_config(1)).unwrap_err();
        assert!(matches!(err, umbrage::GraphError::MalformedInput(_)));
    });
}

#[test]
fn weighted_payloads_survive_the_shuffle() {
    let dir = TempDir::new().unwrap();
    let path = write_weighted_edges(&dir, "payload.bin", &[(0, 1, 2.5), (1, 0, -1.25)]);
    let topo = ClusterTopology::all_compute(1);
    Cluster::launch(topo, |ctx| {
        let graph = Graph::<f64>::load_directed(ctx, &path, 2, test_config(1)).unwrap();
        let csr = graph.outgoing_socket(0);
        let view = umbrage::AdjView::<f64>::new(csr.list_bytes(0));
        let units: Vec<_> = view.iter().map(|u| (u.neighbour, u.data)).collect();
        assert_eq!(units, vec![(1, 2.5)]);
        let view = umbrage::AdjView::<f64>::new(csr.list_bytes(1));
        let units: Vec<_> = view.iter().map(|u| (u.neighbour, u.data)).collect();
        assert_eq!(units, vec![(0, -1.25)]);
    });
}

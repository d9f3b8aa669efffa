use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};

use umbrage::algo;
use umbrage::{Cluster, ClusterTopology, Empty, Graph, GraphConfig, Result, VertexId};

#[derive(Parser)]
#[command(name = "umbrage", version, about = "Graph analytics over a compute / far-memory split")]
struct Cli {
    /// World size: compute ranks plus far-memory ranks.
    #[arg(long, default_value_t = 1)]
    partitions: usize,
    /// Compute ranks; the rest of the world serves far memory.
    #[arg(long)]
    compute: Option<usize>,
    /// Worker threads per rank.
    #[arg(long)]
    threads: Option<usize>,
    /// NUMA sockets per rank.
    #[arg(long, default_value_t = 2)]
    sockets: usize,
    /// Vertex alignment of partition boundaries.
    #[arg(long, default_value_t = 4096)]
    page_size: u32,
    /// Disable the bitmap, index, and edge caches.
    #[arg(long)]
    no_cache: bool,
    /// Direct-mapped edge cache entries per partition and socket.
    #[arg(long, default_value_t = 1 << 16)]
    edge_cache_entries: usize,
    /// Log filter, e.g. "info" or "umbrage=debug".
    #[arg(long, default_value = "info")]
    log: String,
    /// Print cache metrics after the run.
    #[arg(long)]
    metrics: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GraphArgs {
    /// Binary edge file.
    graph: PathBuf,
    /// Number of vertices.
    vertices: VertexId,
    /// Dump the result array here.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// PageRank over an unweighted graph.
    Pagerank {
        #[command(flatten)]
        common: GraphArgs,
        #[arg(long, default_value_t = 20)]
        iterations: usize,
        #[arg(long, default_value_t = 0.85)]
        damping: f64,
    },
    /// Breadth-first distances from a root.
    Bfs {
        #[command(flatten)]
        common: GraphArgs,
        root: VertexId,
    },
    /// Single-source shortest paths over f64-weighted edges.
    Sssp {
        #[command(flatten)]
        common: GraphArgs,
        root: VertexId,
    },
    /// Connected components of an undirected graph.
    Cc {
        #[command(flatten)]
        common: GraphArgs,
    },
    /// Single-source betweenness dependency.
    Bc {
        #[command(flatten)]
        common: GraphArgs,
        root: VertexId,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = umbrage::logging::init_logging(&cli.log) {
        eprintln!("warning: {err}");
    }
    let compute = cli.compute.unwrap_or(cli.partitions);
    if compute == 0 || compute > cli.partitions {
        eprintln!("error: --compute must be in [1, --partitions]");
        process::exit(2);
    }
    let topology = ClusterTopology::new(cli.partitions, compute);
    let mut config = if cli.no_cache {
        GraphConfig::cache_off()
    } else {
        GraphConfig::default()
    };
    config.sockets = cli.sockets;
    config.page_size = cli.page_size;
    config.edge_cache_entries = cli.edge_cache_entries;
    if let Some(threads) = cli.threads {
        config.threads = threads;
    }

    let cli = &cli;
    let config = &config;
    let outcomes: Vec<Result<()>> = Cluster::launch(topology, |ctx| run(ctx, cli, config));
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        if let Err(err) = outcome {
            eprintln!("rank {rank}: {err}");
            process::exit(1);
        }
    }
}

fn run(ctx: umbrage::NodeCtx, cli: &Cli, config: &GraphConfig) -> Result<()> {
    let rank = ctx.rank();
    match &cli.command {
        Command::Pagerank {
            common,
            iterations,
            damping,
        } => {
            let graph =
                Graph::<Empty>::load_directed(ctx, &common.graph, common.vertices, config.clone())?;
            let ranks = algo::pagerank(&graph, *iterations, *damping);
            finish(&graph, rank, cli, common, &ranks, |v| format!("{v:.6}"))
        }
        Command::Bfs { common, root } => {
            let graph =
                Graph::<Empty>::load_directed(ctx, &common.graph, common.vertices, config.clone())?;
            let depths = algo::bfs(&graph, *root);
            finish(&graph, rank, cli, common, &depths, |v| {
                if *v == u32::MAX {
                    "unreachable".into()
                } else {
                    v.to_string()
                }
            })
        }
        Command::Sssp { common, root } => {
            let graph =
                Graph::<f64>::load_directed(ctx, &common.graph, common.vertices, config.clone())?;
            let dists = algo::sssp(&graph, *root);
            finish(&graph, rank, cli, common, &dists, |v| format!("{v:.3}"))
        }
        Command::Cc { common } => {
            let graph = Graph::<Empty>::load_undirected_from_directed(
                ctx,
                &common.graph,
                common.vertices,
                config.clone(),
            )?;
            let labels = algo::connected_components(&graph);
            finish(&graph, rank, cli, common, &labels, |v| v.to_string())
        }
        Command::Bc { common, root } => {
            let mut graph =
                Graph::<Empty>::load_directed(ctx, &common.graph, common.vertices, config.clone())?;
            let deps = algo::betweenness(&mut graph, *root);
            finish(&graph, rank, cli, common, &deps, |v| format!("{v:.6}"))
        }
    }
}

fn finish<E, T>(
    graph: &Graph<E>,
    rank: usize,
    cli: &Cli,
    common: &GraphArgs,
    values: &[T],
    render: impl Fn(&T) -> String,
) -> Result<()>
where
    E: umbrage::EdgeData,
    T: umbrage::Codec,
{
    if let Some(path) = &common.output {
        graph.dump_vertex_array(values, path)?;
    }
    if rank == 0 {
        let shown = values.len().min(16);
        for (v, value) in values.iter().enumerate().take(shown) {
            println!("{v}\t{}", render(value));
        }
        if values.len() > shown {
            println!("... ({} vertices total)", values.len());
        }
        if cli.metrics {
            graph.metrics().print_report();
        }
    }
    Ok(())
}

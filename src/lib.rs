pub mod algo;
pub mod bitmap;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod partition;
pub mod primitives;
pub mod storage;
pub mod types;

pub use crate::bitmap::{Bitmap, BASIC_CHUNK};
pub use crate::cluster::{Cluster, NodeCtx, Scope};
pub use crate::config::{ClusterTopology, GraphConfig};
pub use crate::engine::messaging::SignalCtx;
pub use crate::engine::Graph;
pub use crate::error::{GraphError, Result};
pub use crate::metrics::{CacheMetrics, EngineMetrics};
pub use crate::types::{AdjUnit, AdjView, Codec, EdgeData, EdgeId, Empty, VertexId};

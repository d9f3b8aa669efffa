//! Locality-aware vertex chunking.
//!
//! Partition boundaries are chosen so every chunk carries roughly the
//! same cost `sum(degree(v) + alpha)`; alpha is a per-vertex constant
//! that keeps low-degree regions from fragmenting. The same sweep
//! produces the global partition offsets and the per-socket sub-offsets
//! inside a partition. Boundaries are aligned down to `page_size`
//! vertices so vertex arrays split on page boundaries.

use crate::cluster::{NodeCtx, Scope};
use crate::error::{GraphError, Result};
use crate::types::VertexId;

/// Splits `[begin, end)` into `chunks` ranges balanced by
/// `degree + alpha`, returning `chunks + 1` offsets. The final chunk
/// absorbs the remainder left over by page alignment.
pub fn chunk_offsets(
    begin: VertexId,
    end: VertexId,
    chunks: usize,
    degrees: &[VertexId],
    alpha: u64,
    page_size: VertexId,
) -> Vec<VertexId> {
    debug_assert!(begin <= end);
    debug_assert!(chunks >= 1);
    let page = page_size.max(1);
    let mut offsets = vec![begin; chunks + 1];
    let mut remaining: u64 = (begin..end)
        .map(|v| degrees[v as usize] as u64 + alpha)
        .sum();
    for i in 0..chunks {
        let remaining_chunks = (chunks - i) as u64;
        if remaining_chunks == 1 {
            offsets[i + 1] = end;
        } else {
            let expected = remaining / remaining_chunks;
            let mut got: u64 = 0;
            offsets[i + 1] = end;
            for v in offsets[i]..end {
                got += degrees[v as usize] as u64 + alpha;
                if got > expected {
                    offsets[i + 1] = v;
                    break;
                }
            }
            offsets[i + 1] = (offsets[i + 1] / page * page).max(offsets[i]);
        }
        for v in offsets[i]..offsets[i + 1] {
            remaining -= degrees[v as usize] as u64 + alpha;
        }
    }
    debug_assert_eq!(offsets[chunks], end);
    offsets
}

/// Verifies every rank computed identical offsets: an all-reduce by max
/// and another by min must both reproduce the local values.
pub fn verify_offsets(ctx: &NodeCtx, offsets: &[VertexId]) -> Result<()> {
    for combine in [u32::max as fn(u32, u32) -> u32, u32::min] {
        let mut reduced = offsets.to_vec();
        ctx.all_reduce(Scope::World, &mut reduced, combine);
        if let Some(i) = (0..offsets.len()).find(|&i| reduced[i] != offsets[i]) {
            return Err(GraphError::InconsistentOffsets(i));
        }
    }
    Ok(())
}

/// Partition index owning vertex `v`.
pub fn partition_of(offsets: &[VertexId], v: VertexId) -> usize {
    debug_assert!(v < *offsets.last().unwrap());
    match offsets.binary_search(&v) {
        Ok(i) => {
            // `v` sits on a boundary; empty partitions share it, the
            // owner is the one whose range starts here.
            let mut i = i;
            while offsets[i + 1] == v {
                i += 1;
            }
            i
        }
        Err(i) => i - 1,
    }
}

//! Neighbor sampling kernels.
//!
//! Every kernel shares the same shape: CSR topology in, a frontier of input
//! ids and a fanout `k`, and two preallocated output slices of
//! `input.len() * k` slots. Slot `i*k + j` holds the input node in
//! `out_src` and its `j`-th sampled neighbor in `out_dst`. Nodes with fewer
//! than `k` neighbors emit all of them — no padding, no replacement — and
//! the unsampled slots are compacted away before the kernel returns the
//! final edge count.

pub mod khop;
pub mod random_walk;
pub mod weighted;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::common::{IdType, EMPTY_KEY};
use crate::config::{RandomWalkConfig, SampleType};
use crate::error::{Error, Result};

pub use random_walk::FrequencyArena;

/// Borrowed topology handed to the kernel dispatcher. The weight tables are
/// present only for weighted sampling.
pub struct GraphTables<'a> {
    pub indptr: &'a [IdType],
    pub indices: &'a [IdType],
    pub prob_table: Option<&'a [f32]>,
    pub alias_table: Option<&'a [IdType]>,
}

/// Run the configured kernel for one layer. `out_src`/`out_dst` must hold
/// `input.len() * fanout` slots; returns the compacted edge count.
#[allow(clippy::too_many_arguments)]
pub fn sample_one_layer(
    tables: &GraphTables<'_>,
    sample_type: SampleType,
    walk: &RandomWalkConfig,
    arena: &mut FrequencyArena,
    input: &[IdType],
    fanout: usize,
    out_src: &mut [IdType],
    out_dst: &mut [IdType],
    seed: u64,
    task_key: u64,
) -> Result<usize> {
    let num = match sample_type {
        SampleType::KhopReservoir => khop::sample_khop_reservoir(
            tables.indptr, tables.indices, input, fanout, out_src, out_dst, seed, task_key,
        ),
        SampleType::KhopSampleParallel => khop::sample_khop_parallel(
            tables.indptr, tables.indices, input, fanout, out_src, out_dst, seed, task_key,
        ),
        SampleType::WeightedKhop => {
            let (Some(prob), Some(alias)) = (tables.prob_table, tables.alias_table) else {
                return Err(Error::invariant(
                    "weighted k-hop dispatched without alias tables",
                ));
            };
            weighted::sample_weighted_khop(
                tables.indptr, tables.indices, prob, alias, input, fanout, out_src, out_dst, seed,
                task_key,
            )
        }
        SampleType::RandomWalk => random_walk::sample_random_walk(
            tables.indptr, tables.indices, input, walk, arena, out_src, out_dst, seed, task_key,
        ),
    };
    Ok(num)
}

/// Per-lane RNG: deterministic for a fixed `(seed, task_key, lane)` triple
/// regardless of which worker thread runs the lane.
pub(crate) fn derive_rng(seed: u64, task_key: u64, lane: u64) -> SmallRng {
    // splitmix64 over the combined stream id.
    let mut z = seed ^ task_key.rotate_left(17) ^ lane.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    SmallRng::seed_from_u64(z ^ (z >> 31))
}

/// Stable in-place removal of sentinel slots from a `(src, dst)` pair.
/// Slots are written together, so the `src` sentinel decides for both.
pub(crate) fn compact_pairs(src: &mut [IdType], dst: &mut [IdType]) -> usize {
    debug_assert_eq!(src.len(), dst.len());
    let mut write = 0;
    for read in 0..src.len() {
        if src[read] != EMPTY_KEY {
            src[write] = src[read];
            dst[write] = dst[read];
            write += 1;
        }
    }
    write
}

#[inline]
pub(crate) fn neighbor_range(indptr: &[IdType], node: IdType) -> (usize, usize) {
    let off = indptr[node as usize] as usize;
    let end = indptr[node as usize + 1] as usize;
    (off, end - off)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_is_stable() {
        let mut src = vec![1, EMPTY_KEY, 2, EMPTY_KEY, 3];
        let mut dst = vec![10, EMPTY_KEY, 20, EMPTY_KEY, 30];
        let n = compact_pairs(&mut src, &mut dst);
        assert_eq!(n, 3);
        assert_eq!(&src[..n], &[1, 2, 3]);
        assert_eq!(&dst[..n], &[10, 20, 30]);
    }

    #[test]
    fn derive_rng_is_schedule_independent() {
        use rand::Rng;
        let a: u64 = derive_rng(1, 2, 3).random();
        let b: u64 = derive_rng(1, 2, 3).random();
        let c: u64 = derive_rng(1, 2, 4).random();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

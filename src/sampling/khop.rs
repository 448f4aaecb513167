//! Unweighted k-hop sampling: vertex-parallel reservoir and slot-parallel
//! variants.

use rand::Rng;
use rayon::prelude::*;

use crate::common::{IdType, EMPTY_KEY};

use super::{compact_pairs, derive_rng, neighbor_range};

/// Vertex-parallel reservoir sampling: one worker lane per input node.
///
/// A node with degree `<= fanout` emits all neighbors. Otherwise the first
/// `fanout` neighbors seed the reservoir and each later neighbor at
/// position `j` replaces a uniformly chosen slot with probability
/// `fanout / (j + 1)`, which leaves every neighbor in the sample with
/// probability exactly `fanout / degree`.
pub fn sample_khop_reservoir(
    indptr: &[IdType],
    indices: &[IdType],
    input: &[IdType],
    fanout: usize,
    out_src: &mut [IdType],
    out_dst: &mut [IdType],
    seed: u64,
    task_key: u64,
) -> usize {
    debug_assert_eq!(out_src.len(), input.len() * fanout);
    debug_assert_eq!(out_dst.len(), input.len() * fanout);

    let all_has_fanout = input
        .par_iter()
        .zip(out_src.par_chunks_mut(fanout).zip(out_dst.par_chunks_mut(fanout)))
        .enumerate()
        .map(|(i, (&rid, (src, dst)))| {
            let (off, deg) = neighbor_range(indptr, rid);
            if deg <= fanout {
                for j in 0..deg {
                    src[j] = rid;
                    dst[j] = indices[off + j];
                }
                for j in deg..fanout {
                    src[j] = EMPTY_KEY;
                    dst[j] = EMPTY_KEY;
                }
                deg == fanout
            } else {
                let mut rng = derive_rng(seed, task_key, i as u64);
                for j in 0..fanout {
                    src[j] = rid;
                    dst[j] = indices[off + j];
                }
                for j in fanout..deg {
                    let r = rng.random_range(0..=j);
                    if r < fanout {
                        dst[r] = indices[off + j];
                    }
                }
                true
            }
        })
        .reduce(|| true, |a, b| a && b);

    if all_has_fanout {
        input.len() * fanout
    } else {
        compact_pairs(out_src, out_dst)
    }
}

/// Slot-parallel k-hop: one worker lane per `(input, slot)` pair, suited to
/// massively parallel execution. Each slot draws its neighbor independently,
/// so a high-degree node can sample the same neighbor in two slots; the
/// duplicates collapse during remap dedup. Deterministic per
/// `(input_idx, slot_idx)` under a fixed seed.
pub fn sample_khop_parallel(
    indptr: &[IdType],
    indices: &[IdType],
    input: &[IdType],
    fanout: usize,
    out_src: &mut [IdType],
    out_dst: &mut [IdType],
    seed: u64,
    task_key: u64,
) -> usize {
    debug_assert_eq!(out_src.len(), input.len() * fanout);
    debug_assert_eq!(out_dst.len(), input.len() * fanout);

    out_src
        .par_iter_mut()
        .zip(out_dst.par_iter_mut())
        .enumerate()
        .for_each(|(slot, (src, dst))| {
            let i = slot / fanout;
            let j = slot % fanout;
            let rid = input[i];
            let (off, deg) = neighbor_range(indptr, rid);
            if deg <= fanout {
                if j < deg {
                    *src = rid;
                    *dst = indices[off + j];
                } else {
                    *src = EMPTY_KEY;
                    *dst = EMPTY_KEY;
                }
            } else {
                let mut rng = derive_rng(seed, task_key, slot as u64);
                *src = rid;
                *dst = indices[off + rng.random_range(0..deg)];
            }
        });

    compact_pairs(out_src, out_dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::csr_from_edges;

    /// Star: node 0 is the center with `leaves` out-neighbors 1..=leaves.
    fn star(leaves: usize) -> (Vec<IdType>, Vec<IdType>) {
        let mut edges = Vec::new();
        for leaf in 1..=leaves as IdType {
            edges.push((0, leaf));
            edges.push((leaf, 0));
        }
        csr_from_edges(leaves + 1, edges)
    }

    #[test]
    fn undersampled_nodes_emit_all_neighbors_compacted() {
        let (indptr, indices) = star(2);
        // Center has degree 2, each leaf degree 1; fanout 3 over all nodes.
        let input = vec![0, 1, 2];
        let fanout = 3;
        let mut src = vec![0; input.len() * fanout];
        let mut dst = vec![0; input.len() * fanout];
        let n = sample_khop_reservoir(&indptr, &indices, &input, fanout, &mut src, &mut dst, 1, 0);
        assert_eq!(n, 4, "2 center edges + 1 per leaf");
        assert_eq!(&src[..n], &[0, 0, 1, 2]);
        assert_eq!(&dst[..n], &[1, 2, 0, 0]);
    }

    #[test]
    fn cardinality_never_exceeds_frontier_times_fanout() {
        let (indptr, indices) = star(10);
        let input = vec![0];
        let fanout = 3;
        let mut src = vec![0; fanout];
        let mut dst = vec![0; fanout];
        for seed in 0..50 {
            let n = sample_khop_reservoir(
                &indptr, &indices, &input, fanout, &mut src, &mut dst, seed, 0,
            );
            assert_eq!(n, fanout, "degree 10 >= fanout 3 must fill every slot");
            // Sampled neighbors are distinct leaves.
            let mut picked = dst[..n].to_vec();
            picked.sort_unstable();
            picked.dedup();
            assert_eq!(picked.len(), n);
        }
    }

    #[test]
    fn reservoir_is_uniform_over_neighbors() {
        // Star with 10 leaves, fanout 3: every leaf should appear in the
        // sample with probability 0.3.
        let (indptr, indices) = star(10);
        let input = vec![0];
        let fanout = 3;
        let trials = 10_000;
        let mut hits = vec![0usize; 11];
        let mut src = vec![0; fanout];
        let mut dst = vec![0; fanout];
        for trial in 0..trials {
            sample_khop_reservoir(
                &indptr, &indices, &input, fanout, &mut src, &mut dst, trial as u64, 7,
            );
            for &leaf in &dst {
                hits[leaf as usize] += 1;
            }
        }
        for leaf in 1..=10 {
            let freq = hits[leaf] as f64 / trials as f64;
            assert!(
                (freq - 0.3).abs() < 0.02,
                "leaf {leaf} sampled with frequency {freq:.3}, expected 0.3 +/- 0.02"
            );
        }
    }

    #[test]
    fn slot_parallel_is_deterministic_for_fixed_seed() {
        let (indptr, indices) = star(10);
        let input = vec![0, 3, 0];
        let fanout = 4;
        let run = |seed| {
            let mut src = vec![0; input.len() * fanout];
            let mut dst = vec![0; input.len() * fanout];
            let n =
                sample_khop_parallel(&indptr, &indices, &input, fanout, &mut src, &mut dst, seed, 9);
            (src[..n].to_vec(), dst[..n].to_vec())
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }
}

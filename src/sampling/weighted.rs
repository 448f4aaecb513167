//! Weighted k-hop sampling via precomputed alias tables, plus the offline
//! alias-table construction used by the dataset writer.

use rand::Rng;
use rayon::prelude::*;

use crate::common::{IdType, EMPTY_KEY};

use super::{compact_pairs, derive_rng, neighbor_range};

/// Attempts at re-drawing a duplicate alias pick before falling back to a
/// linear scan for the first unchosen neighbor.
const MAX_REDRAW: usize = 16;

/// Weighted k-hop: each draw picks edge slot `e` uniformly in the node's
/// range and keeps it with probability `prob_table[off + e]`, otherwise
/// takes `alias_table[off + e]`. Draws are made without replacement over
/// edge slots; nodes with degree `<= fanout` copy all neighbors, sidestepping
/// the double-counting bias of repeated alias draws over a tiny support.
#[allow(clippy::too_many_arguments)]
pub fn sample_weighted_khop(
    indptr: &[IdType],
    indices: &[IdType],
    prob_table: &[f32],
    alias_table: &[IdType],
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
                return deg == fanout;
            }

            let mut rng = derive_rng(seed, task_key, i as u64);
            let mut picked: Vec<usize> = Vec::with_capacity(fanout);
            'slots: for j in 0..fanout {
                for _ in 0..MAX_REDRAW {
                    let e = rng.random_range(0..deg);
                    let e = if rng.random::<f32>() < prob_table[off + e] {
                        e
                    } else {
                        alias_table[off + e] as usize - off
                    };
                    if !picked.contains(&e) {
                        picked.push(e);
                        src[j] = rid;
                        dst[j] = indices[off + e];
                        continue 'slots;
                    }
                }
                // Degenerate weights keep aliasing onto already-picked
                // slots; finish the draw without replacement linearly.
                for e in 0..deg {
                    if !picked.contains(&e) {
                        picked.push(e);
                        src[j] = rid;
                        dst[j] = indices[off + e];
                        break;
                    }
                }
            }
            true
        })
        .reduce(|| true, |a, b| a && b);

    if all_has_fanout {
        input.len() * fanout
    } else {
        compact_pairs(out_src, out_dst)
    }
}

/// Build per-edge alias tables for every node's neighbor segment.
///
/// Classic two-stack construction: scale each segment's weights so they
/// average 1, then pair each under-full slot with an over-full donor. A
/// single draw is then `O(1)`: uniform slot, biased coin, alias on tails.
/// Alias entries are absolute edge indices (offset into `indices`).
pub fn build_alias_tables(indptr: &[IdType], weights: &[f32]) -> (Vec<f32>, Vec<IdType>) {
    let num_edge = weights.len();
    let mut prob = vec![0.0f32; num_edge];
    let mut alias = vec![0 as IdType; num_edge];

    let num_node = indptr.len() - 1;
    for v in 0..num_node {
        let off = indptr[v] as usize;
        let end = indptr[v + 1] as usize;
        let deg = end - off;
        if deg == 0 {
            continue;
        }
        let seg = &weights[off..end];
        let total: f64 = seg.iter().map(|&w| w as f64).sum();
        if total <= 0.0 {
            // Zero-weight segment degrades to uniform.
            for e in 0..deg {
                prob[off + e] = 1.0;
                alias[off + e] = (off + e) as IdType;
            }
            continue;
        }

        let scaled: Vec<f64> = seg.iter().map(|&w| w as f64 * deg as f64 / total).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        let mut remaining = scaled.clone();
        for (e, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(e);
            } else {
                large.push(e);
            }
        }
        loop {
            match (small.pop(), large.pop()) {
                (Some(s), Some(l)) => {
                    prob[off + s] = remaining[s] as f32;
                    alias[off + s] = (off + l) as IdType;
                    remaining[l] -= 1.0 - remaining[s];
                    if remaining[l] < 1.0 {
                        small.push(l);
                    } else {
                        large.push(l);
                    }
                }
                // Rounding leaves stragglers on one side; they saturate.
                (Some(e), None) | (None, Some(e)) => {
                    prob[off + e] = 1.0;
                    alias[off + e] = (off + e) as IdType;
                }
                (None, None) => break,
            }
        }
    }
    (prob, alias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::csr_from_edges;

    fn star(leaves: usize) -> (Vec<IdType>, Vec<IdType>) {
        let mut edges = Vec::new();
        for leaf in 1..=leaves as IdType {
            edges.push((0, leaf));
            edges.push((leaf, 0));
        }
        csr_from_edges(leaves + 1, edges)
    }

    #[test]
    fn alias_tables_preserve_draw_frequencies() {
        let (indptr, indices) = star(4);
        // Center's 4 edges weighted 1:2:3:4; leaves weighted 1.
        let mut weights = vec![1.0f32; indices.len()];
        for (e, w) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            weights[indptr[0] as usize + e] = *w;
        }
        let (prob, alias) = build_alias_tables(&indptr, &weights);

        let mut rng = derive_rng(5, 0, 0);
        let trials = 40_000;
        let mut hits = [0usize; 4];
        let off = indptr[0] as usize;
        let deg = 4;
        for _ in 0..trials {
            let e = rng.random_range(0..deg);
            let e = if rng.random::<f32>() < prob[off + e] {
                e
            } else {
                alias[off + e] as usize - off
            };
            hits[e] += 1;
        }
        for (e, &h) in hits.iter().enumerate() {
            let expected = (e + 1) as f64 / 10.0;
            let freq = h as f64 / trials as f64;
            assert!(
                (freq - expected).abs() < 0.02,
                "edge {e}: drawn with frequency {freq:.3}, expected {expected:.3}"
            );
        }
    }

    #[test]
    fn weighted_khop_is_deterministic_for_fixed_seed() {
        let (indptr, indices) = star(8);
        let weights: Vec<f32> = (0..indices.len()).map(|e| 1.0 + (e % 5) as f32).collect();
        let (prob, alias) = build_alias_tables(&indptr, &weights);
        let input = vec![0, 2, 0];
        let fanout = 3;
        let run = |seed| {
            let mut src = vec![0; input.len() * fanout];
            let mut dst = vec![0; input.len() * fanout];
            let n = sample_weighted_khop(
                &indptr, &indices, &prob, &alias, &input, fanout, &mut src, &mut dst, seed, 11,
            );
            (src[..n].to_vec(), dst[..n].to_vec())
        };
        assert_eq!(run(123), run(123));
    }

    #[test]
    fn weighted_khop_draws_without_replacement() {
        let (indptr, indices) = star(8);
        // One overwhelming edge: without-replacement must still yield
        // distinct neighbors.
        let mut weights = vec![1.0f32; indices.len()];
        weights[indptr[0] as usize] = 1.0e9;
        let (prob, alias) = build_alias_tables(&indptr, &weights);
        let input = vec![0];
        let fanout = 4;
        let mut src = vec![0; fanout];
        let mut dst = vec![0; fanout];
        for seed in 0..100 {
            let n = sample_weighted_khop(
                &indptr, &indices, &prob, &alias, &input, fanout, &mut src, &mut dst, seed, 0,
            );
            assert_eq!(n, fanout);
            let mut picked = dst[..n].to_vec();
            picked.sort_unstable();
            picked.dedup();
            assert_eq!(picked.len(), fanout, "duplicate neighbor in seed {seed}");
            assert_eq!(dst[0], indices[indptr[0] as usize], "heavy edge must win slot 0");
        }
    }

    #[test]
    fn small_degree_copies_all_neighbors() {
        let (indptr, indices) = star(2);
        let weights = vec![1.0f32; indices.len()];
        let (prob, alias) = build_alias_tables(&indptr, &weights);
        let input = vec![1]; // leaf with a single neighbor
        let fanout = 4;
        let mut src = vec![0; fanout];
        let mut dst = vec![0; fanout];
        let n = sample_weighted_khop(
            &indptr, &indices, &prob, &alias, &input, fanout, &mut src, &mut dst, 3, 0,
        );
        assert_eq!(n, 1);
        assert_eq!((src[0], dst[0]), (1, 0));
    }
}

//! Truncated random walk with frequency top-k.
//!
//! Each seed runs `num_walks` independent walks of `walk_length` steps; at
//! every step the walk either restarts to its seed (probability
//! `restart_prob`) or moves to a uniform out-neighbor. Visits are counted in
//! a versioned arena — one open-addressed partition per seed, cleared by a
//! version bump between batches — and the `num_neighbor` most frequent
//! visited nodes become the seed's sampled neighbors.

use rand::Rng;
use rayon::prelude::*;

use crate::common::{IdType, EMPTY_KEY};
use crate::config::RandomWalkConfig;

use super::{compact_pairs, derive_rng, neighbor_range};

#[derive(Clone, Copy)]
struct ArenaSlot {
    node: IdType,
    count: u32,
    version: u32,
}

/// Reusable visit-frequency scratch. Sized once for
/// `(seed_count, walks * length)` and recycled across batches; a slot is
/// live only if its version matches the arena's.
pub struct FrequencyArena {
    slots: Vec<ArenaSlot>,
    stride: usize,
    version: u32,
}

impl FrequencyArena {
    pub fn new() -> FrequencyArena {
        FrequencyArena { slots: Vec::new(), stride: 0, version: 0 }
    }

    /// Make room for `num_seeds` partitions of `visits_per_seed` counted
    /// nodes and start a fresh logical epoch.
    fn begin(&mut self, num_seeds: usize, visits_per_seed: usize) {
        // Power-of-two partitions keep the probe mask cheap; 2x headroom
        // keeps chains short.
        let stride = (visits_per_seed * 2).next_power_of_two().max(16);
        let needed = num_seeds * stride;
        if stride != self.stride || self.slots.len() < needed {
            self.slots = vec![ArenaSlot { node: EMPTY_KEY, count: 0, version: 0 }; needed];
            self.stride = stride;
            self.version = 0;
        }
        self.version = self.version.wrapping_add(1);
        if self.version == 0 {
            for s in self.slots.iter_mut() {
                s.version = 0;
            }
            self.version = 1;
        }
    }
}

impl Default for FrequencyArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Count one visit in a seed's partition. Linear probing; the partition is
/// sized so a full table cannot happen within one batch.
fn bump(partition: &mut [ArenaSlot], version: u32, node: IdType) {
    let mask = partition.len() - 1;
    let mut pos = (node.wrapping_mul(0x9e37_79b1)) as usize & mask;
    loop {
        let slot = &mut partition[pos];
        if slot.version != version {
            *slot = ArenaSlot { node, count: 1, version };
            return;
        }
        if slot.node == node {
            slot.count += 1;
            return;
        }
        pos = (pos + 1) & mask;
    }
}

/// Run the walks for one frontier and emit each seed's top-k visited nodes
/// as its sampled neighbors. Output slices hold `input.len() * num_neighbor`
/// slots; the compacted edge count is returned.
pub fn sample_random_walk(
    indptr: &[IdType],
    indices: &[IdType],
    input: &[IdType],
    cfg: &RandomWalkConfig,
    arena: &mut FrequencyArena,
    out_src: &mut [IdType],
    out_dst: &mut [IdType],
    seed: u64,
    task_key: u64,
) -> usize {
    let k = cfg.num_neighbor;
    debug_assert_eq!(out_src.len(), input.len() * k);
    debug_assert_eq!(out_dst.len(), input.len() * k);

    arena.begin(input.len(), cfg.num_walks * cfg.walk_length);
    let version = arena.version;
    let stride = arena.stride;

    arena.slots[..input.len() * stride]
        .par_chunks_mut(stride)
        .zip(input.par_iter())
        .zip(out_src.par_chunks_mut(k).zip(out_dst.par_chunks_mut(k)))
        .enumerate()
        .for_each(|(i, ((partition, &root), (src, dst)))| {
            let mut rng = derive_rng(seed, task_key, i as u64);

            for _ in 0..cfg.num_walks {
                let mut cur = root;
                for _ in 0..cfg.walk_length {
                    let restart = rng.random::<f64>() < cfg.restart_prob;
                    if restart {
                        cur = root;
                        continue;
                    }
                    let (off, deg) = neighbor_range(indptr, cur);
                    if deg == 0 {
                        cur = root;
                        continue;
                    }
                    cur = indices[off + rng.random_range(0..deg)];
                    if cur != root {
                        bump(partition, version, cur);
                    }
                }
            }

            // Frequency top-k; ties resolve to the smaller node id so the
            // output is stable under a fixed seed.
            let mut visited: Vec<(u32, IdType)> = partition
                .iter()
                .filter(|s| s.version == version)
                .map(|s| (s.count, s.node))
                .collect();
            visited.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            visited.truncate(k);

            for j in 0..k {
                if let Some(&(_, node)) = visited.get(j) {
                    src[j] = root;
                    dst[j] = node;
                } else {
                    src[j] = EMPTY_KEY;
                    dst[j] = EMPTY_KEY;
                }
            }
        });

    compact_pairs(out_src, out_dst)
}

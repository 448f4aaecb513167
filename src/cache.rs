//! Trainer-device feature cache.
//!
//! A configurable fraction of feature rows lives on the trainer device,
//! ranked by a selectable policy. `extract` splits a frontier into cached
//! and missed ids, gathers the two halves on separate streams, and merges
//! them into one output tensor in the original input order via an event on
//! the cache stream.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::common::{predict_num_nodes, IdType, Tensor, EMPTY_KEY};
use crate::config::{CachePolicy, RunConfig};
use crate::dataset::Dataset;
use crate::device::{Device, StreamHandle};
use crate::error::{Error, Result};
use crate::extractor::Extractor;
use crate::hashtable::OrderedHashTable;
use crate::sampling::{sample_one_layer, FrequencyArena, GraphTables};
use crate::shuffler::Shuffler;

pub struct CacheManager {
    device: Arc<dyn Device>,
    /// Cached rows, `[num_cached, feat_dim]` on the trainer device.
    cached_feat: Tensor,
    /// Device-resident open-addressed id table: `2 * slots` words of
    /// `[global, slot]` pairs, `EMPTY_KEY` globals marking free buckets.
    table: Tensor,
    table_mask: usize,
    num_cached: usize,
    feat_dim: usize,
    row_bytes: usize,
    cache_stream: StreamHandle,
    miss_stream: StreamHandle,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl CacheManager {
    /// Build the cache for the configured policy, or `None` when caching is
    /// disabled. Runs on the loader path, never during steady state.
    pub fn build(
        config: &RunConfig,
        dataset: &Dataset,
        device: &Arc<dyn Device>,
        extractor: &Extractor,
    ) -> Result<Option<CacheManager>> {
        let num_cached =
            (config.cache_percentage * dataset.num_node as f64).round() as usize;
        if config.cache_policy == CachePolicy::None || num_cached == 0 {
            return Ok(None);
        }

        let ranking = rank_nodes(config.cache_policy, dataset, config)?;
        debug_assert_eq!(ranking.len(), dataset.num_node);
        let cached_ids = &ranking[..num_cached];

        // Stage the cached rows on the host, then move them over in one copy.
        let host_rows = extractor.extract(&dataset.feat, cached_ids, dataset.feat_dim)?;
        let cached_feat = host_rows.copy_to(device, crate::device::DEFAULT_STREAM)?;

        let slots = (num_cached * 2).next_power_of_two().max(16);
        let mut table = vec![EMPTY_KEY; slots * 2];
        for (slot, &id) in cached_ids.iter().enumerate() {
            let mask = slots - 1;
            let mut pos = (id.wrapping_mul(0x9e37_79b1)) as usize & mask;
            while table[pos * 2] != EMPTY_KEY {
                pos = (pos + 1) & mask;
            }
            table[pos * 2] = id;
            table[pos * 2 + 1] = slot as IdType;
        }
        let table = Tensor::from_vec(table, vec![slots * 2])
            .copy_to(device, crate::device::DEFAULT_STREAM)?;

        tracing::info!(
            policy = ?config.cache_policy,
            num_cached,
            percentage = config.cache_percentage,
            size = %crate::common::to_readable_size(num_cached * dataset.feat_dim * 4),
            "feature cache built"
        );

        Ok(Some(CacheManager {
            device: device.clone(),
            cached_feat,
            table,
            table_mask: slots - 1,
            num_cached,
            feat_dim: dataset.feat_dim,
            row_bytes: dataset.feat_dim * dataset.feat.dtype().bytes(),
            cache_stream: device.stream_create(),
            miss_stream: device.stream_create(),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }))
    }

    pub fn num_cached(&self) -> usize {
        self.num_cached
    }

    /// Cache slot of `id`, or `None` on a miss.
    fn lookup(&self, table: &[IdType], id: IdType) -> Option<IdType> {
        let mut pos = (id.wrapping_mul(0x9e37_79b1)) as usize & self.table_mask;
        loop {
            let global = table[pos * 2];
            if global == EMPTY_KEY {
                return None;
            }
            if global == id {
                return Some(table[pos * 2 + 1]);
            }
            pos = (pos + 1) & self.table_mask;
        }
    }

    /// Lifetime hit fraction across all lookups.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            0.0
        } else {
            self.hits.load(Ordering::Relaxed) as f64 / lookups as f64
        }
    }

    /// Gather `feat[input[i]]` for every `i` into one device tensor in input
    /// order. Cached rows scatter from the device copy on the cache stream;
    /// missed rows take the host-gather + upload path on the miss stream;
    /// the two merge through a stream event.
    pub fn extract(
        &self,
        input: &[IdType],
        dataset: &Dataset,
        extractor: &Extractor,
    ) -> Result<Tensor> {
        let table = self.table.as_slice::<IdType>();
        let mut hit: Vec<(usize, IdType)> = Vec::with_capacity(input.len());
        let mut miss_pos: Vec<usize> = Vec::new();
        let mut miss_ids: Vec<IdType> = Vec::new();
        for (i, &id) in input.iter().enumerate() {
            match self.lookup(table, id) {
                Some(slot) => hit.push((i, slot)),
                None => {
                    miss_pos.push(i);
                    miss_ids.push(id);
                }
            }
        }
        self.lookups.fetch_add(input.len() as u64, Ordering::Relaxed);
        self.hits.fetch_add(hit.len() as u64, Ordering::Relaxed);

        let mut out =
            Tensor::empty(dataset.feat.dtype(), vec![input.len(), self.feat_dim], &self.device)?;
        let out_base = out.as_mut_ptr();
        let row = self.row_bytes;

        // Hit path: device-to-device row scatter.
        for &(i, slot) in &hit {
            // SAFETY: slot < num_cached and i < input.len(); both regions
            // are `row` bytes inside their tensors.
            unsafe {
                self.device.copy(
                    self.cached_feat.as_ptr().add(slot as usize * row),
                    out_base.add(i * row),
                    row,
                    self.cached_feat.ctx(),
                    out.ctx(),
                    self.cache_stream,
                )?;
            }
        }

        // Miss path: host gather, upload, scatter into place.
        if !miss_ids.is_empty() {
            let staged = extractor.extract(&dataset.feat, &miss_ids, self.feat_dim)?;
            let staged_dev = staged.copy_to(&self.device, self.miss_stream)?;
            for (j, &i) in miss_pos.iter().enumerate() {
                // SAFETY: as above; `staged_dev` holds `miss_ids.len()` rows.
                unsafe {
                    self.device.copy(
                        staged_dev.as_ptr().add(j * row),
                        out_base.add(i * row),
                        row,
                        staged_dev.ctx(),
                        out.ctx(),
                        self.miss_stream,
                    )?;
                }
            }
        }

        // Merge: the miss stream adopts the cache stream's work, then one
        // sync covers both.
        let event = self.device.event_record(self.cache_stream);
        self.device.event_wait(self.miss_stream, event);
        self.device.stream_sync(self.miss_stream);

        Ok(out)
    }
}

// ============================================================================
// Ranking Policies
// ============================================================================

/// All node ids ordered best-to-cache first under `policy`.
pub fn rank_nodes(
    policy: CachePolicy,
    dataset: &Dataset,
    config: &RunConfig,
) -> Result<Vec<IdType>> {
    let degrees = out_degrees(dataset);
    match policy {
        CachePolicy::None => Err(Error::config("rank_nodes called with caching disabled")),
        CachePolicy::ByDegree => Ok(order_by_score(&degrees, &degrees)),
        CachePolicy::ByHeuristic => Ok(rank_by_heuristic(dataset, &degrees)),
        CachePolicy::ByDegreeHop => Ok(rank_by_degree_hop(dataset, &degrees, config.fanout.len())),
        CachePolicy::ByPresample => {
            let freq = presample_frequency(dataset, config, 1)?;
            Ok(order_by_score(&freq, &degrees))
        }
        CachePolicy::ByFakeOptimal => {
            // The oracle: exact access frequencies over the whole run.
            let freq = presample_frequency(dataset, config, config.num_epoch)?;
            Ok(order_by_score(&freq, &degrees))
        }
        CachePolicy::ByPresampleStatic => {
            let ranking = dataset.ranking_nodes.as_ref().ok_or_else(|| {
                Error::config("cache_by_presample.bin is required for the static presample policy")
            })?;
            Ok(ranking.as_slice::<IdType>().to_vec())
        }
    }
}

fn out_degrees(dataset: &Dataset) -> Vec<u64> {
    if let Some(t) = &dataset.out_degrees {
        t.as_slice::<u32>().iter().map(|&d| d as u64).collect()
    } else {
        dataset.indptr().windows(2).map(|w| (w[1] - w[0]) as u64).collect()
    }
}

/// Sort all nodes by score descending, degree then id breaking ties.
fn order_by_score(score: &[u64], degrees: &[u64]) -> Vec<IdType> {
    let mut nodes: Vec<IdType> = (0..score.len() as IdType).collect();
    nodes.par_sort_unstable_by_key(|&v| {
        (Reverse(score[v as usize]), Reverse(degrees[v as usize]), v)
    });
    nodes
}

/// Training seeds, then their one-hop neighborhood, then everything else by
/// degree.
fn rank_by_heuristic(dataset: &Dataset, degrees: &[u64]) -> Vec<IdType> {
    // 0 = seed, 1 = one-hop neighbor, 2 = rest; degree orders within tiers.
    let mut tier = vec![2u8; dataset.num_node];
    let indptr = dataset.indptr();
    let indices = dataset.indices();
    for &seed in dataset.train_set() {
        tier[seed as usize] = 0;
    }
    for &seed in dataset.train_set() {
        let (off, end) = (indptr[seed as usize] as usize, indptr[seed as usize + 1] as usize);
        for &nbr in &indices[off..end] {
            if tier[nbr as usize] == 2 {
                tier[nbr as usize] = 1;
            }
        }
    }
    let mut nodes: Vec<IdType> = (0..dataset.num_node as IdType).collect();
    nodes.par_sort_unstable_by_key(|&v| {
        (tier[v as usize], Reverse(degrees[v as usize]), v)
    });
    nodes
}

/// BFS hop distance from the training set out to `num_hops`, degree
/// breaking ties within a hop.
fn rank_by_degree_hop(dataset: &Dataset, degrees: &[u64], num_hops: usize) -> Vec<IdType> {
    let unreached = u32::MAX;
    let mut hop = vec![unreached; dataset.num_node];
    let indptr = dataset.indptr();
    let indices = dataset.indices();
    let mut frontier: Vec<IdType> = dataset.train_set().to_vec();
    for &seed in &frontier {
        hop[seed as usize] = 0;
    }
    for h in 1..=num_hops as u32 {
        let mut next = Vec::new();
        for &v in &frontier {
            let (off, end) = (indptr[v as usize] as usize, indptr[v as usize + 1] as usize);
            for &nbr in &indices[off..end] {
                if hop[nbr as usize] == unreached {
                    hop[nbr as usize] = h;
                    next.push(nbr);
                }
            }
        }
        frontier = next;
    }
    let mut nodes: Vec<IdType> = (0..dataset.num_node as IdType).collect();
    nodes.par_sort_unstable_by_key(|&v| {
        (hop[v as usize], Reverse(degrees[v as usize]), v)
    });
    nodes
}

/// Dry-run `epochs` of sampling and count how often each node lands in the
/// final input frontier — the rows the extractor will actually fetch.
fn presample_frequency(dataset: &Dataset, config: &RunConfig, epochs: usize) -> Result<Vec<u64>> {
    let mut freq = vec![0u64; dataset.num_node];
    let fanouts = config.effective_fanouts();
    let tables = GraphTables {
        indptr: dataset.indptr(),
        indices: dataset.indices(),
        prob_table: dataset.prob_table.as_ref().map(|t| t.as_slice::<f32>()),
        alias_table: dataset.alias_table.as_ref().map(|t| t.as_slice::<IdType>()),
    };
    let table = OrderedHashTable::new(predict_num_nodes(config.batch_size, &fanouts));
    let mut arena = FrequencyArena::new();
    let mut shuffler =
        Shuffler::new(dataset.train_set(), config.batch_size, epochs, config.seed);

    while let Some((key, seeds)) = shuffler.next_batch() {
        table.reset();
        table.fill_with_unique(&seeds)?;
        let mut frontier = seeds;
        for &fanout in fanouts.iter().rev() {
            let mut src = vec![0 as IdType; frontier.len() * fanout];
            let mut dst = vec![0 as IdType; frontier.len() * fanout];
            let num = sample_one_layer(
                &tables,
                config.sample_type,
                &config.random_walk,
                &mut arena,
                &frontier,
                fanout,
                &mut src,
                &mut dst,
                config.seed,
                key,
            )?;
            let (next, _) = table.fill_with_duplicates(&dst[..num])?;
            frontier = next;
        }
        for &v in &frontier {
            freq[v as usize] += 1;
        }
    }
    Ok(freq)
}

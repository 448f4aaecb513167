//! Step-keyed pipeline timings and counters, reported through `tracing`.
//!
//! Entries are single-writer-per-key: a stage only logs items for task keys
//! it currently owns, so the per-step rows need no finer locking than the
//! map itself.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::common::{key_epoch, IdType};

pub const NUM_LOG_ITEMS: usize = LogItem::L3RemapMapEdgeTime as usize + 1;

/// What gets measured. L1 items are whole-stage, L2 per-operation, L3
/// kernel-internal; higher profile levels unlock finer items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LogItem {
    // L1
    L1NumSample = 0,
    L1NumNode,
    L1SampleTime,
    L1CopyTime,
    L1FeatureBytes,
    L1LabelBytes,
    L1IdBytes,
    L1GraphBytes,
    // L2
    L2ShuffleTime,
    L2CoreSampleTime,
    L2IdRemapTime,
    L2GraphCopyTime,
    L2IdCopyTime,
    L2ExtractTime,
    L2FeatCopyTime,
    L2CacheHitRate,
    // L3
    L3RemapPopulateTime,
    L3RemapMapEdgeTime,
}

impl LogItem {
    fn level(self) -> u8 {
        use LogItem::*;
        match self {
            L1NumSample | L1NumNode | L1SampleTime | L1CopyTime | L1FeatureBytes
            | L1LabelBytes | L1IdBytes | L1GraphBytes => 1,
            L2ShuffleTime | L2CoreSampleTime | L2IdRemapTime | L2GraphCopyTime | L2IdCopyTime
            | L2ExtractTime | L2FeatCopyTime | L2CacheHitRate => 2,
            L3RemapPopulateTime | L3RemapMapEdgeTime => 3,
        }
    }
}

#[derive(Clone, Copy)]
struct StepLog {
    vals: [f64; NUM_LOG_ITEMS],
}

impl StepLog {
    fn new() -> StepLog {
        StepLog { vals: [0.0; NUM_LOG_ITEMS] }
    }
}

pub struct Profiler {
    level: u8,
    steps: Mutex<HashMap<u64, StepLog>>,
    /// Per-node access counts, populated only under `LOG_NODE_ACCESS`.
    node_access: Option<Mutex<Vec<u64>>>,
}

impl Profiler {
    pub fn new(level: u8, log_node_access: bool, num_node: usize) -> Profiler {
        Profiler {
            level,
            steps: Mutex::new(HashMap::new()),
            node_access: log_node_access.then(|| Mutex::new(vec![0u64; num_node])),
        }
    }

    pub fn enabled(&self, item: LogItem) -> bool {
        self.level >= item.level()
    }

    /// Set an item's value for a step.
    pub fn log(&self, key: u64, item: LogItem, value: f64) {
        if !self.enabled(item) {
            return;
        }
        self.steps.lock().entry(key).or_insert_with(StepLog::new).vals[item as usize] = value;
    }

    /// Accumulate into an item (layers of one step, for example).
    pub fn log_add(&self, key: u64, item: LogItem, value: f64) {
        if !self.enabled(item) {
            return;
        }
        self.steps.lock().entry(key).or_insert_with(StepLog::new).vals[item as usize] += value;
    }

    pub fn value(&self, key: u64, item: LogItem) -> f64 {
        self.steps.lock().get(&key).map(|s| s.vals[item as usize]).unwrap_or(0.0)
    }

    pub fn log_node_access(&self, nodes: &[IdType]) {
        if let Some(access) = &self.node_access {
            let mut access = access.lock();
            for &v in nodes {
                access[v as usize] += 1;
            }
        }
    }

    /// Emit one step's row.
    pub fn report_step(&self, key: u64) {
        if self.level == 0 {
            return;
        }
        let steps = self.steps.lock();
        let Some(log) = steps.get(&key) else { return };
        tracing::info!(
            key,
            num_sample = log.vals[LogItem::L1NumSample as usize],
            num_node = log.vals[LogItem::L1NumNode as usize],
            sample_s = log.vals[LogItem::L1SampleTime as usize],
            copy_s = log.vals[LogItem::L1CopyTime as usize],
            shuffle_s = log.vals[LogItem::L2ShuffleTime as usize],
            core_sample_s = log.vals[LogItem::L2CoreSampleTime as usize],
            remap_s = log.vals[LogItem::L2IdRemapTime as usize],
            extract_s = log.vals[LogItem::L2ExtractTime as usize],
            cache_hit_rate = log.vals[LogItem::L2CacheHitRate as usize],
            "profile step"
        );
    }

    /// Emit the running average over every logged step of `epoch`.
    pub fn report_epoch_average(&self, epoch: u64) {
        if self.level == 0 {
            return;
        }
        let steps = self.steps.lock();
        let mut sum = StepLog::new();
        let mut count = 0usize;
        for (&key, log) in steps.iter() {
            if key_epoch(key) != epoch {
                continue;
            }
            for (acc, v) in sum.vals.iter_mut().zip(log.vals.iter()) {
                *acc += v;
            }
            count += 1;
        }
        if count == 0 {
            return;
        }
        let n = count as f64;
        tracing::info!(
            epoch,
            steps = count,
            sample_s = sum.vals[LogItem::L1SampleTime as usize] / n,
            copy_s = sum.vals[LogItem::L1CopyTime as usize] / n,
            extract_s = sum.vals[LogItem::L2ExtractTime as usize] / n,
            feature_mb =
                sum.vals[LogItem::L1FeatureBytes as usize] / n / (1024.0 * 1024.0),
            "profile epoch average"
        );
    }

    /// Dump the node-access histogram summary.
    pub fn report_node_access(&self) {
        let Some(access) = &self.node_access else { return };
        let access = access.lock();
        let touched = access.iter().filter(|&&c| c > 0).count();
        let total: u64 = access.iter().sum();
        let max = access.iter().copied().max().unwrap_or(0);
        tracing::info!(
            touched,
            total_accesses = total,
            max_per_node = max,
            "node access summary"
        );
    }
}

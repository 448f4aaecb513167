//! Run configuration: immutable after `Engine::init`.

use serde::{Deserialize, Serialize};

use crate::common::Context;
use crate::error::{Error, Result};

/// Pipeline wiring variant, distinguished by where each stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunArch {
    /// Single-device fallback: sampling and extraction both on the CPU.
    Arch0,
    /// Co-located: sampler and trainer share one accelerator.
    Arch1,
    /// Offload: accelerator sampling + copy, extraction on the CPU.
    Arch2,
    /// Dedicated: sampler and trainer on distinct accelerators; extraction
    /// overlaps graph copy behind the `graph_remapped` handshake.
    Arch3,
    /// Distributed: sampler feeds the trainer process through the shared
    /// memory queue.
    Arch5,
}

/// Neighbor sampling kernel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    KhopReservoir,
    KhopSampleParallel,
    WeightedKhop,
    RandomWalk,
}

/// Feature cache ranking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    None,
    ByDegree,
    ByHeuristic,
    ByPresample,
    ByPresampleStatic,
    ByDegreeHop,
    ByFakeOptimal,
}

/// Parameters of the random-walk kernel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RandomWalkConfig {
    /// Steps per walk.
    pub walk_length: usize,
    /// Probability of teleporting back to the walk's seed at each step.
    pub restart_prob: f64,
    /// Independent walks per seed.
    pub num_walks: usize,
    /// Top-k cutoff: neighbors kept per seed after frequency counting.
    pub num_neighbor: usize,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        RandomWalkConfig { walk_length: 3, restart_prob: 0.5, num_walks: 4, num_neighbor: 5 }
    }
}

/// Everything the engine needs to build a pipeline. Constructed by the
/// caller, validated once, then read-only for the life of the process.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset_path: String,
    pub run_arch: RunArch,
    pub sample_type: SampleType,
    /// Per-layer neighbor cap; `fanout[0]` is the layer closest to the
    /// features, `fanout[L-1]` the layer closest to the seeds.
    pub fanout: Vec<usize>,
    pub batch_size: usize,
    pub num_epoch: usize,
    pub sampler_ctx: Context,
    pub trainer_ctx: Context,
    pub cache_policy: CachePolicy,
    /// Fraction of nodes whose features are cached on the trainer device.
    pub cache_percentage: f64,
    /// Bound of the sampler-to-copier queue.
    pub max_sampling_jobs: usize,
    /// Bound of the copier-to-trainer pool.
    pub max_copying_jobs: usize,
    /// Worker threads for the parallel kernels (0 = one per core).
    pub omp_thread_num: usize,
    pub random_walk: RandomWalkConfig,
    /// 0 disables the profiler; higher levels add finer-grained items.
    pub profile_level: u8,
    pub seed: u64,

    // Diagnostics, settable only through the environment.
    pub log_node_access: bool,
    pub sanity_check: bool,
    pub dump_trace: bool,
    pub barrier_epoch: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            dataset_path: String::new(),
            run_arch: RunArch::Arch0,
            sample_type: SampleType::KhopReservoir,
            fanout: vec![25, 10],
            batch_size: 8000,
            num_epoch: 1,
            sampler_ctx: Context::host(),
            trainer_ctx: Context::host(),
            cache_policy: CachePolicy::None,
            cache_percentage: 0.0,
            max_sampling_jobs: 10,
            max_copying_jobs: 10,
            omp_thread_num: 0,
            random_walk: RandomWalkConfig::default(),
            profile_level: 0,
            seed: 0x2021_0711,
            log_node_access: false,
            sanity_check: false,
            dump_trace: false,
            barrier_epoch: false,
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

impl RunConfig {
    /// Fold the diagnostic environment variables in. These affect only
    /// profiling and logging output, never pipeline behavior.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PROFILE_LEVEL") {
            if let Ok(level) = v.parse::<u8>() {
                self.profile_level = level.min(3);
            }
        }
        self.log_node_access |= env_flag("LOG_NODE_ACCESS");
        self.sanity_check |= env_flag("SANITY_CHECK");
        self.dump_trace |= env_flag("DUMP_TRACE");
        self.barrier_epoch |= env_flag("BARRIER_EPOCH");
    }

    /// Reject configurations the selected topology cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.dataset_path.is_empty() {
            return Err(Error::config("dataset_path is empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.num_epoch == 0 {
            return Err(Error::config("num_epoch must be positive"));
        }
        if self.fanout.is_empty() || self.fanout.iter().any(|&f| f == 0) {
            return Err(Error::config(format!(
                "fanout {:?} must be non-empty with positive entries",
                self.fanout
            )));
        }
        if !(0.0..=1.0).contains(&self.cache_percentage) {
            return Err(Error::config(format!(
                "cache_percentage {} outside [0, 1]",
                self.cache_percentage
            )));
        }
        if self.max_sampling_jobs == 0 || self.max_copying_jobs == 0 {
            return Err(Error::config("queue bounds must be positive"));
        }
        if self.sample_type == SampleType::RandomWalk {
            let rw = &self.random_walk;
            if rw.walk_length == 0 || rw.num_walks == 0 || rw.num_neighbor == 0 {
                return Err(Error::config("random_walk lengths and counts must be positive"));
            }
            if !(0.0..=1.0).contains(&rw.restart_prob) {
                return Err(Error::config(format!(
                    "random_walk.restart_prob {} outside [0, 1]",
                    rw.restart_prob
                )));
            }
        }
        if self.cache_policy == CachePolicy::None && self.cache_percentage > 0.0 {
            return Err(Error::config("cache_percentage > 0 requires a cache_policy"));
        }

        use crate::common::DeviceKind;
        match self.run_arch {
            RunArch::Arch0 => {
                if self.sampler_ctx.kind != DeviceKind::Host {
                    return Err(Error::config("arch0 samples on the host"));
                }
            }
            RunArch::Arch1 => {
                if self.sampler_ctx != self.trainer_ctx {
                    return Err(Error::config(
                        "arch1 co-locates sampler and trainer on one device",
                    ));
                }
            }
            RunArch::Arch2 => {
                if self.sampler_ctx.kind != DeviceKind::Accel {
                    return Err(Error::config("arch2 requires an accelerator sampler_ctx"));
                }
            }
            RunArch::Arch3 => {
                if self.sampler_ctx.kind != DeviceKind::Accel {
                    return Err(Error::config("arch3 requires an accelerator sampler_ctx"));
                }
                if self.sampler_ctx == self.trainer_ctx {
                    return Err(Error::config(
                        "arch3 requires distinct sampler and trainer devices",
                    ));
                }
            }
            RunArch::Arch5 => {}
        }
        Ok(())
    }

    /// Per-layer expansion width the kernels actually produce. The random
    /// walk emits `num_neighbor` top-k edges per frontier node regardless of
    /// the configured fanout values.
    pub fn effective_fanouts(&self) -> Vec<usize> {
        match self.sample_type {
            SampleType::RandomWalk => vec![self.random_walk.num_neighbor; self.fanout.len()],
            _ => self.fanout.clone(),
        }
    }

    /// Kernel worker count with the `0 = all cores` default applied.
    pub fn worker_threads(&self) -> usize {
        if self.omp_thread_num == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.omp_thread_num
        }
    }
}

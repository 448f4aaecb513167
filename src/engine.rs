//! The pipeline engine: owns the dataset, queues, streams, shared tables,
//! and stage workers, and wires them into one of the supported topologies.
//!
//! Stage chains per topology:
//!
//! ```text
//! A0/A1  shuffle+sample+remap -> queue -> graph copy, id copy, extract, feat copy -> pool
//! A2     same chain; sampling on the accelerator, extraction on the host
//! A3     shuffle+sample -> queue (before remap) -> id copy, extract, feat copy,
//!        wait graph_remapped, graph copy -> pool
//! A5     shuffle+sample+remap -> shared-memory ring -> extract, copies -> pool
//! ```
//!
//! The sample worker and the copy worker pipeline across tasks; within one
//! task the queue hand-off is the happens-before edge. Any steady-state
//! error latches into the fatal cell, raises shutdown, and surfaces from
//! every later `next_batch`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::common::{
    batch_key, get_set, key_step, predict_num_nodes, set_once, DataType, IdType, Task, Tensor,
    TrainGraph,
};
use crate::config::{RunArch, RunConfig};
use crate::dataset::Dataset;
use crate::device::{Device, HostDevice, StreamHandle, WorkspacePool};
use crate::error::{Error, Result};
use crate::extractor::Extractor;
use crate::hashtable::OrderedHashTable;
use crate::memory_queue::{deserialize_task, max_frame_bytes, serialize_task, MemoryQueue};
use crate::profiler::{LogItem, Profiler};
use crate::queue::{BatchPool, TaskQueue, POLL_INTERVAL};
use crate::sampling::{sample_one_layer, FrequencyArena, GraphTables};
use crate::shuffler::Shuffler;

/// Bound on how long `shutdown` waits for workers to drain before joining.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct EngineInner {
    config: RunConfig,
    dataset: Arc<Dataset>,
    sampler_device: Arc<dyn Device>,
    trainer_device: Arc<dyn Device>,
    sampler_pool: Arc<WorkspacePool>,
    sample_stream: StreamHandle,
    copy_stream: StreamHandle,
    shuffler: Mutex<Shuffler>,
    hashtable: OrderedHashTable,
    walk_arena: Mutex<FrequencyArena>,
    copy_queue: TaskQueue,
    mem_queue: Option<MemoryQueue>,
    batch_pool: BatchPool,
    cache: Option<crate::cache::CacheManager>,
    extractor: Extractor,
    profiler: Profiler,
    kernel_pool: rayon::ThreadPool,
    shutdown: Arc<AtomicBool>,
    fatal: OnceLock<Error>,
    joined: AtomicUsize,
}

/// One sampled layer before edge remapping. The endpoint buffers come from
/// the workspace pool and recycle when the layer is dropped.
struct RawLayer {
    src: Tensor,
    dst: Tensor,
    num_edge: usize,
    num_src: usize,
    num_dst: usize,
}

pub struct Engine {
    inner: Arc<EngineInner>,
    threads: Vec<JoinHandle<()>>,
    torn_down: bool,
}

impl Engine {
    /// Build the pipeline against the in-tree host backend for both
    /// contexts.
    pub fn init(config: RunConfig) -> Result<Engine> {
        let sampler_device = HostDevice::new(config.sampler_ctx);
        let trainer_device = HostDevice::new(config.trainer_ctx);
        Self::init_with_devices(config, sampler_device, trainer_device)
    }

    /// Build the pipeline against caller-provided device backends (the
    /// accelerator runtime is an external collaborator).
    pub fn init_with_devices(
        mut config: RunConfig,
        sampler_device: Arc<dyn Device>,
        trainer_device: Arc<dyn Device>,
    ) -> Result<Engine> {
        config.apply_env();
        config.validate()?;
        if sampler_device.ctx() != config.sampler_ctx {
            return Err(Error::config("sampler device does not serve sampler_ctx"));
        }
        if trainer_device.ctx() != config.trainer_ctx {
            return Err(Error::config("trainer device does not serve trainer_ctx"));
        }

        let kernel_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads())
            .thread_name(|i| format!("confluence-worker-{i}"))
            .build()
            .map_err(|e| Error::resource(format!("worker pool: {e}")))?;

        let dataset = Arc::new(Dataset::load(
            std::path::Path::new(&config.dataset_path),
            &config,
            &sampler_device,
        )?);

        let fanouts = config.effective_fanouts();
        let predicted = predict_num_nodes(config.batch_size, &fanouts);
        let hashtable = OrderedHashTable::new(predicted);

        let shutdown = Arc::new(AtomicBool::new(false));
        let copy_queue = TaskQueue::new(config.max_sampling_jobs, shutdown.clone());
        let batch_pool = BatchPool::new(config.max_copying_jobs, shutdown.clone());
        let mem_queue = if config.run_arch == RunArch::Arch5 {
            let slot_bytes = max_frame_bytes(predicted, predicted, fanouts.len());
            Some(MemoryQueue::new(config.max_sampling_jobs, slot_bytes, shutdown.clone())?)
        } else {
            None
        };

        let extractor = Extractor::new();
        let cache =
            crate::cache::CacheManager::build(&config, &dataset, &trainer_device, &extractor)?;
        let profiler =
            Profiler::new(config.profile_level, config.log_node_access, dataset.num_node);
        let shuffler = Shuffler::new(
            dataset.train_set(),
            config.batch_size,
            config.num_epoch,
            config.seed,
        );

        let sample_stream = sampler_device.stream_create();
        let copy_stream = trainer_device.stream_create();
        let sampler_pool = WorkspacePool::new(sampler_device.clone());

        tracing::info!(
            arch = ?config.run_arch,
            sample_type = ?config.sample_type,
            fanout = ?config.fanout,
            batch_size = config.batch_size,
            steps_per_epoch = shuffler.steps_per_epoch(),
            predicted_nodes = predicted,
            "engine initialized"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                dataset,
                sampler_device,
                trainer_device,
                sampler_pool,
                sample_stream,
                copy_stream,
                shuffler: Mutex::new(shuffler),
                hashtable,
                walk_arena: Mutex::new(FrequencyArena::new()),
                copy_queue,
                mem_queue,
                batch_pool,
                cache,
                extractor,
                profiler,
                kernel_pool,
                shutdown,
                fatal: OnceLock::new(),
                joined: AtomicUsize::new(0),
            }),
            threads: Vec::new(),
            torn_down: false,
        })
    }

    /// Spawn the stage workers.
    pub fn start(&mut self) -> Result<()> {
        if !self.threads.is_empty() {
            return Ok(());
        }
        let spawn = |name: &str,
                     inner: Arc<EngineInner>,
                     f: fn(&EngineInner) -> Result<bool>|
         -> Result<JoinHandle<()>> {
            Ok(std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || worker_loop(&inner, f))?)
        };
        self.threads.push(spawn("confluence-sample", self.inner.clone(), run_sample_once)?);
        self.threads.push(spawn("confluence-copy", self.inner.clone(), run_copy_once)?);
        tracing::debug!(workers = self.threads.len(), "stage workers started");
        Ok(())
    }

    /// Advance the pipeline by exactly one batch, synchronously. Driver and
    /// test-harness entry point; no workers needed.
    pub fn sample_once(&self) -> Result<()> {
        match run_sample_once(&self.inner) {
            Ok(true) => match run_copy_once(&self.inner) {
                Ok(_) => Ok(()),
                Err(e) => {
                    self.inner.fail(&e);
                    Err(e)
                }
            },
            Ok(false) => Ok(()), // epoch sequence exhausted
            Err(e) => {
                self.inner.fail(&e);
                Err(e)
            }
        }
    }

    /// Block until the batch keyed `(epoch, step)` is delivered. After a
    /// steady-state failure this returns the latched cause instead.
    pub fn next_batch(&self, epoch: u64, step: u64) -> Result<Arc<Task>> {
        if let Some(cause) = self.inner.fatal.get() {
            return Err(cause.clone());
        }
        match self.inner.batch_pool.get(batch_key(epoch, step)) {
            Ok(task) => Ok(task),
            Err(e) => match self.inner.fatal.get() {
                Some(cause) => Err(cause.clone()),
                None => Err(e),
            },
        }
    }

    /// Cooperative teardown: raise the flag, wait bounded for workers to
    /// park, then join them and tear down the streams.
    pub fn shutdown(&mut self) {
        if self.torn_down {
            return; // Drop re-enters here after an explicit shutdown
        }
        self.torn_down = true;
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.inner.joined.load(Ordering::Acquire) < self.threads.len()
            && Instant::now() < deadline
        {
            std::thread::sleep(POLL_INTERVAL);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.inner.sampler_device.stream_destroy(self.inner.sample_stream);
        self.inner.trainer_device.stream_destroy(self.inner.copy_stream);
        self.inner.profiler.report_node_access();
        tracing::info!("engine shut down");
    }

    pub fn num_epoch(&self) -> u64 {
        self.inner.config.num_epoch as u64
    }

    pub fn steps_per_epoch(&self) -> u64 {
        self.inner.shuffler.lock().steps_per_epoch() as u64
    }

    pub fn num_class(&self) -> u64 {
        self.inner.dataset.num_class as u64
    }

    pub fn feat_dim(&self) -> u64 {
        self.inner.dataset.feat_dim as u64
    }

    pub fn dataset(&self) -> &Dataset {
        &self.inner.dataset
    }

    pub fn config(&self) -> &RunConfig {
        &self.inner.config
    }

    pub fn report_step(&self, epoch: u64, step: u64) {
        self.inner.profiler.report_step(batch_key(epoch, step));
    }

    pub fn report_epoch(&self, epoch: u64) {
        self.inner.profiler.report_epoch_average(epoch);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineInner {
    /// Latch the first fatal cause and bring the pipeline down.
    fn fail(&self, cause: &Error) {
        if !cause.is_cancelled() {
            let _ = self.fatal.set(cause.clone());
            tracing::error!(%cause, "fatal pipeline error; shutting down");
        }
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn graph_tables(&self) -> GraphTables<'_> {
        GraphTables {
            indptr: self.dataset.indptr(),
            indices: self.dataset.indices(),
            prob_table: self.dataset.prob_table.as_ref().map(|t| t.as_slice::<f32>()),
            alias_table: self.dataset.alias_table.as_ref().map(|t| t.as_slice::<IdType>()),
        }
    }

    /// Move a freshly built host tensor onto the sampler context when the
    /// sampler runs on an accelerator.
    fn to_sampler(&self, tensor: Tensor) -> Result<Tensor> {
        if self.config.sampler_ctx.kind == crate::common::DeviceKind::Accel {
            tensor.copy_to(&self.sampler_device, self.sample_stream)
        } else {
            Ok(tensor)
        }
    }
}

fn worker_loop(inner: &EngineInner, f: fn(&EngineInner) -> Result<bool>) {
    while !inner.shutdown.load(Ordering::Relaxed) {
        match f(inner) {
            Ok(true) => {}
            Ok(false) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                if !e.is_cancelled() {
                    inner.fail(&e);
                }
                break;
            }
        }
    }
    inner.joined.fetch_add(1, Ordering::AcqRel);
}

// ============================================================================
// Sample Stage
// ============================================================================

fn run_sample_once(inner: &EngineInner) -> Result<bool> {
    if inner.config.run_arch != RunArch::Arch5 && inner.copy_queue.is_full() {
        return Ok(false);
    }

    let t_shuffle = Instant::now();
    let next = inner.shuffler.lock().next_batch();
    let Some((key, seeds)) = next else {
        return Ok(false);
    };
    let shuffle_time = t_shuffle.elapsed().as_secs_f64();

    let num_seeds = seeds.len();
    let task = Arc::new(Task::new(key, Tensor::from_vec(seeds, vec![num_seeds])));
    tracing::debug!(key, num_seeds, "sample: begin task");

    let t_sample = Instant::now();
    let raw = sample_layers(inner, &task)?;

    // A3 hands the task downstream before edge remapping so host-side
    // extraction overlaps with it; everything else enqueues when done.
    if inner.config.run_arch == RunArch::Arch3 {
        inner.copy_queue.enqueue(task.clone())?;
    }
    finish_remap(inner, &task, raw)?;

    let sample_time = t_sample.elapsed().as_secs_f64();
    inner.profiler.log(key, LogItem::L1SampleTime, shuffle_time + sample_time);
    inner.profiler.log(key, LogItem::L2ShuffleTime, shuffle_time);

    match inner.config.run_arch {
        RunArch::Arch3 => {}
        RunArch::Arch5 => {
            let Some(ring) = &inner.mem_queue else {
                return Err(Error::invariant("arch5 engine has no memory queue"));
            };
            ring.send(&serialize_task(&task)?)?;
        }
        _ => inner.copy_queue.enqueue(task)?,
    }
    Ok(true)
}

/// Expand the seed frontier layer by layer: sample a raw COO per layer and
/// fold its destinations into the running frontier through the hash table.
/// Publishes `input_nodes`; edge remapping is left to [`finish_remap`].
fn sample_layers(inner: &EngineInner, task: &Task) -> Result<Vec<RawLayer>> {
    let config = &inner.config;
    let table = &inner.hashtable;
    table.reset();

    let seeds = task.output_nodes.as_slice::<IdType>();
    table.fill_with_unique(seeds)?;

    let fanouts = config.effective_fanouts();
    let tables = inner.graph_tables();
    let mut raw: Vec<RawLayer> = Vec::with_capacity(fanouts.len());
    let mut frontier: Vec<IdType> = seeds.to_vec();
    let mut total_edges = 0usize;

    // Layer L-1 (seed side) first, layer 0 (feature side) last.
    for &fanout in fanouts.iter().rev() {
        let num_input = frontier.len();
        let mut out_src =
            Tensor::workspace(DataType::I32, vec![num_input * fanout], &inner.sampler_pool)?;
        let mut out_dst =
            Tensor::workspace(DataType::I32, vec![num_input * fanout], &inner.sampler_pool)?;

        let t_core = Instant::now();
        let num_edge = {
            let src = out_src.as_mut_slice::<IdType>();
            let dst = out_dst.as_mut_slice::<IdType>();
            let mut guard = inner.walk_arena.lock();
            let arena = &mut *guard;
            let tables = &tables;
            let input = &frontier;
            inner.kernel_pool.install(move || {
                sample_one_layer(
                    tables,
                    config.sample_type,
                    &config.random_walk,
                    arena,
                    input,
                    fanout,
                    src,
                    dst,
                    config.seed,
                    task.key,
                )
            })?
        };
        inner.profiler.log_add(task.key, LogItem::L2CoreSampleTime, t_core.elapsed().as_secs_f64());

        let t_populate = Instant::now();
        let (next_frontier, num_unique) = inner
            .kernel_pool
            .install(|| table.fill_with_duplicates(&out_dst.as_slice::<IdType>()[..num_edge]))?;
        let populate_time = t_populate.elapsed().as_secs_f64();
        inner.profiler.log_add(task.key, LogItem::L2IdRemapTime, populate_time);
        inner.profiler.log_add(task.key, LogItem::L3RemapPopulateTime, populate_time);

        tracing::debug!(
            key = task.key,
            num_input,
            fanout,
            num_edge,
            num_unique,
            "sample: layer done"
        );
        total_edges += num_edge;
        raw.push(RawLayer { src: out_src, dst: out_dst, num_edge, num_src: num_unique, num_dst: num_input });
        frontier = next_frontier;
    }

    inner.profiler.log(task.key, LogItem::L1NumSample, total_edges as f64);
    inner.profiler.log(task.key, LogItem::L1NumNode, frontier.len() as f64);
    inner.profiler.log_node_access(&frontier);
    if config.sanity_check {
        let num_node = inner.dataset.num_node as IdType;
        if let Some(&bad) = frontier.iter().find(|&&v| v >= num_node) {
            return Err(Error::invariant(format!("sampled node id {bad} out of range")));
        }
    }

    let num_input = frontier.len();
    let input_nodes = inner.to_sampler(Tensor::from_vec(frontier, vec![num_input]))?;
    set_once(&task.input_nodes, input_nodes, "input_nodes")?;
    Ok(raw)
}

/// Rewrite every layer's endpoints into dense local ids and publish the
/// per-layer train graphs, then raise `graph_remapped`.
fn finish_remap(inner: &EngineInner, task: &Task, raw: Vec<RawLayer>) -> Result<()> {
    let table = &inner.hashtable;
    let num_layers = raw.len();
    let mut graphs: Vec<Option<TrainGraph>> = (0..num_layers).map(|_| None).collect();

    for (pos, layer) in raw.into_iter().enumerate() {
        // raw[0] is layer L-1; graphs[] is indexed by layer.
        let layer_idx = num_layers - 1 - pos;
        let t_map = Instant::now();
        let (new_src, new_dst) = inner.kernel_pool.install(|| {
            table.map_edges(
                &layer.src.as_slice::<IdType>()[..layer.num_edge],
                &layer.dst.as_slice::<IdType>()[..layer.num_edge],
            )
        })?;
        inner.profiler.log_add(
            task.key,
            LogItem::L3RemapMapEdgeTime,
            t_map.elapsed().as_secs_f64(),
        );

        // Sampled neighbors are the layer's source frontier, input nodes its
        // destination frontier.
        let row = inner.to_sampler(Tensor::from_vec(new_dst, vec![layer.num_edge]))?;
        let col = inner.to_sampler(Tensor::from_vec(new_src, vec![layer.num_edge]))?;
        graphs[layer_idx] = Some(TrainGraph {
            row,
            col,
            num_src: layer.num_src,
            num_dst: layer.num_dst,
            num_edge: layer.num_edge,
        });
    }

    let graphs: Vec<TrainGraph> = graphs
        .into_iter()
        .map(|g| g.ok_or_else(|| Error::invariant("layer missing after remap")))
        .collect::<Result<_>>()?;
    set_once(&task.graphs, graphs, "graphs")?;
    inner.sampler_device.stream_sync(inner.sample_stream);
    task.graph_remapped.store(true, Ordering::Release);
    tracing::debug!(key = task.key, "sample: remap complete");
    Ok(())
}

// ============================================================================
// Copy Stage
// ============================================================================

fn run_copy_once(inner: &EngineInner) -> Result<bool> {
    let task: Arc<Task> = match inner.config.run_arch {
        RunArch::Arch5 => {
            let Some(ring) = &inner.mem_queue else {
                return Err(Error::invariant("arch5 engine has no memory queue"));
            };
            Arc::new(deserialize_task(&ring.recv()?)?)
        }
        _ => inner.copy_queue.dequeue()?,
    };

    let t_copy = Instant::now();
    match inner.config.run_arch {
        RunArch::Arch3 => {
            // Overlap: ids and features move while the sampler is still
            // remapping; the graph copy alone waits for the handshake.
            do_id_copy(inner, &task)?;
            do_feature_extract(inner, &task)?;
            do_feature_copy(inner, &task)?;
            wait_graph_remapped(inner, &task)?;
            do_graph_copy(inner, &task)?;
        }
        _ => {
            do_graph_copy(inner, &task)?;
            do_id_copy(inner, &task)?;
            do_feature_extract(inner, &task)?;
            do_feature_copy(inner, &task)?;
        }
    }
    inner.profiler.log(task.key, LogItem::L1CopyTime, t_copy.elapsed().as_secs_f64());

    let key = task.key;
    let epoch = task.epoch();
    inner.batch_pool.submit(task)?;
    tracing::debug!(key, "copy: task submitted");
    if inner.config.dump_trace {
        tracing::info!(key, epoch, step = key_step(key), "batch delivered");
    }
    if key_step(key) + 1 == inner.shuffler.lock().steps_per_epoch() as u64
        && (inner.config.barrier_epoch || inner.config.profile_level > 0)
    {
        inner.profiler.report_epoch_average(epoch);
    }
    Ok(true)
}

/// Spin until the sampler publishes the remapped graphs, polling shutdown.
fn wait_graph_remapped(inner: &EngineInner, task: &Task) -> Result<()> {
    while !task.graph_remapped.load(Ordering::Acquire) {
        if inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn do_graph_copy(inner: &EngineInner, task: &Task) -> Result<()> {
    let t = Instant::now();
    let graphs = get_set(&task.graphs, "graphs")?;
    let mut out = Vec::with_capacity(graphs.len());
    let mut bytes = 0usize;
    for g in graphs {
        let row = g.row.copy_to(&inner.trainer_device, inner.copy_stream)?;
        let col = g.col.copy_to(&inner.trainer_device, inner.copy_stream)?;
        bytes += g.row.nbytes() + g.col.nbytes();
        out.push(TrainGraph {
            row,
            col,
            num_src: g.num_src,
            num_dst: g.num_dst,
            num_edge: g.num_edge,
        });
    }
    inner.trainer_device.stream_sync(inner.copy_stream);
    set_once(&task.train_graphs, out, "train_graphs")?;
    inner.profiler.log(task.key, LogItem::L1GraphBytes, bytes as f64);
    inner.profiler.log(task.key, LogItem::L2GraphCopyTime, t.elapsed().as_secs_f64());
    Ok(())
}

fn do_id_copy(inner: &EngineInner, task: &Task) -> Result<()> {
    let t = Instant::now();
    let input_nodes = get_set(&task.input_nodes, "input_nodes")?;
    let train_input = input_nodes.copy_to(&inner.trainer_device, inner.copy_stream)?;
    let train_output = task.output_nodes.copy_to(&inner.trainer_device, inner.copy_stream)?;
    inner.trainer_device.stream_sync(inner.copy_stream);
    inner.profiler.log(
        task.key,
        LogItem::L1IdBytes,
        (input_nodes.nbytes() + task.output_nodes.nbytes()) as f64,
    );
    set_once(&task.train_input_nodes, train_input, "train_input_nodes")?;
    set_once(&task.train_output_nodes, train_output, "train_output_nodes")?;
    inner.profiler.log(task.key, LogItem::L2IdCopyTime, t.elapsed().as_secs_f64());
    Ok(())
}

fn do_feature_extract(inner: &EngineInner, task: &Task) -> Result<()> {
    let t = Instant::now();
    let dataset = &inner.dataset;
    let input_ids = get_set(&task.input_nodes, "input_nodes")?.as_slice::<IdType>();
    let output_ids = task.output_nodes.as_slice::<IdType>();

    if let Some(cache) = &inner.cache {
        // Cached extraction lands directly on the trainer device; only the
        // labels still take the host staging path.
        let feat = cache.extract(input_ids, dataset, &inner.extractor)?;
        inner.profiler.log(task.key, LogItem::L1FeatureBytes, feat.nbytes() as f64);
        set_once(&task.train_feat, feat, "train_feat")?;
        inner.profiler.log(task.key, LogItem::L2CacheHitRate, cache.hit_rate());
    } else {
        let feat = inner
            .kernel_pool
            .install(|| inner.extractor.extract(&dataset.feat, input_ids, dataset.feat_dim))?;
        inner.profiler.log(task.key, LogItem::L1FeatureBytes, feat.nbytes() as f64);
        set_once(&task.input_feat, feat, "input_feat")?;
    }

    let label = inner
        .kernel_pool
        .install(|| inner.extractor.extract(&dataset.label, output_ids, 1))?;
    inner.profiler.log(task.key, LogItem::L1LabelBytes, label.nbytes() as f64);
    set_once(&task.output_label, label, "output_label")?;
    inner.profiler.log(task.key, LogItem::L2ExtractTime, t.elapsed().as_secs_f64());
    Ok(())
}

fn do_feature_copy(inner: &EngineInner, task: &Task) -> Result<()> {
    let t = Instant::now();
    if task.train_feat.get().is_none() {
        let feat = get_set(&task.input_feat, "input_feat")?
            .copy_to(&inner.trainer_device, inner.copy_stream)?;
        set_once(&task.train_feat, feat, "train_feat")?;
    }
    let label = get_set(&task.output_label, "output_label")?
        .copy_to(&inner.trainer_device, inner.copy_stream)?;
    inner.trainer_device.stream_sync(inner.copy_stream);
    set_once(&task.train_label, label, "train_label")?;
    inner.profiler.log(task.key, LogItem::L2FeatCopyTime, t.elapsed().as_secs_f64());
    Ok(())
}

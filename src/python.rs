//! PyO3 bindings for the sampling engine.
//!
//! Exposes `confluence.Engine` as a Python class via maturin. Batch tensors
//! come back as a dict of numpy arrays on the trainer context.

use numpy::{PyArray1, PyArrayMethods};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::common::{Context, IdType, Task};
use crate::config::{CachePolicy, RandomWalkConfig, RunArch, RunConfig, SampleType};
use crate::engine::Engine;

fn parse_arch(value: &str) -> PyResult<RunArch> {
    match value {
        "arch0" => Ok(RunArch::Arch0),
        "arch1" => Ok(RunArch::Arch1),
        "arch2" => Ok(RunArch::Arch2),
        "arch3" => Ok(RunArch::Arch3),
        "arch5" => Ok(RunArch::Arch5),
        other => Err(PyRuntimeError::new_err(format!("unknown run_arch: {other}"))),
    }
}

fn parse_sample_type(value: &str) -> PyResult<SampleType> {
    match value {
        "khop_reservoir" => Ok(SampleType::KhopReservoir),
        "khop_sample_parallel" => Ok(SampleType::KhopSampleParallel),
        "weighted_khop" => Ok(SampleType::WeightedKhop),
        "random_walk" => Ok(SampleType::RandomWalk),
        other => Err(PyRuntimeError::new_err(format!("unknown sample_type: {other}"))),
    }
}

fn parse_cache_policy(value: &str) -> PyResult<CachePolicy> {
    match value {
        "none" => Ok(CachePolicy::None),
        "by_degree" => Ok(CachePolicy::ByDegree),
        "by_heuristic" => Ok(CachePolicy::ByHeuristic),
        "by_presample" => Ok(CachePolicy::ByPresample),
        "by_presample_static" => Ok(CachePolicy::ByPresampleStatic),
        "by_degree_hop" => Ok(CachePolicy::ByDegreeHop),
        "by_fake_optimal" => Ok(CachePolicy::ByFakeOptimal),
        other => Err(PyRuntimeError::new_err(format!("unknown cache_policy: {other}"))),
    }
}

/// A delivered-batch field, or a clear error naming what is missing.
fn delivered<'t>(
    field: &'t std::sync::OnceLock<crate::common::Tensor>,
    name: &str,
) -> PyResult<&'t crate::common::Tensor> {
    field
        .get()
        .ok_or_else(|| PyRuntimeError::new_err(format!("batch field {name} not delivered")))
}

/// Convert a delivered task into a dict of numpy arrays.
fn batch_to_dict<'py>(py: Python<'py>, task: &Task) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("key", task.key)?;

    let input_nodes = delivered(&task.train_input_nodes, "input_nodes")?;
    dict.set_item(
        "input_nodes",
        PyArray1::from_slice(py, input_nodes.as_slice::<IdType>()),
    )?;
    let output_nodes = delivered(&task.train_output_nodes, "output_nodes")?;
    dict.set_item(
        "output_nodes",
        PyArray1::from_slice(py, output_nodes.as_slice::<IdType>()),
    )?;

    let feat = delivered(&task.train_feat, "input_feat")?;
    let feat_dim = feat.shape()[1];
    dict.set_item(
        "input_feat",
        PyArray1::from_slice(py, feat.as_slice::<f32>())
            .reshape([feat.shape()[0], feat_dim])?,
    )?;
    let label = delivered(&task.train_label, "output_label")?;
    dict.set_item("output_label", PyArray1::from_slice(py, label.as_slice::<i64>()))?;

    let graphs = task
        .train_graphs
        .get()
        .ok_or_else(|| PyRuntimeError::new_err("batch graphs not delivered"))?;
    let mut rows = Vec::with_capacity(graphs.len());
    let mut cols = Vec::with_capacity(graphs.len());
    let mut sizes = Vec::with_capacity(graphs.len());
    for g in graphs {
        rows.push(PyArray1::from_slice(py, g.row.as_slice::<IdType>()));
        cols.push(PyArray1::from_slice(py, g.col.as_slice::<IdType>()));
        sizes.push((g.num_src as u64, g.num_dst as u64, g.num_edge as u64));
    }
    dict.set_item("graph_rows", rows)?;
    dict.set_item("graph_cols", cols)?;
    dict.set_item("graph_sizes", sizes)?;
    Ok(dict)
}

/// The sampling pipeline, driven from the training script.
#[pyclass(name = "Engine")]
struct PyEngine {
    inner: Option<Engine>,
}

#[pymethods]
impl PyEngine {
    #[new]
    #[pyo3(signature = (
        dataset_path,
        run_arch = "arch0".to_string(),
        sample_type = "khop_reservoir".to_string(),
        fanout = vec![25, 10],
        batch_size = 8000,
        num_epoch = 1,
        sampler_device = -1,
        trainer_device = -1,
        cache_policy = "none".to_string(),
        cache_percentage = 0.0,
        max_sampling_jobs = 10,
        max_copying_jobs = 10,
        omp_thread_num = 0,
        random_walk_length = 3,
        random_walk_restart_prob = 0.5,
        num_random_walk = 4,
        num_neighbor = 5,
        seed = 0x2021_0711,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        py: Python<'_>,
        dataset_path: String,
        run_arch: String,
        sample_type: String,
        fanout: Vec<usize>,
        batch_size: usize,
        num_epoch: usize,
        sampler_device: i32,
        trainer_device: i32,
        cache_policy: String,
        cache_percentage: f64,
        max_sampling_jobs: usize,
        max_copying_jobs: usize,
        omp_thread_num: usize,
        random_walk_length: usize,
        random_walk_restart_prob: f64,
        num_random_walk: usize,
        num_neighbor: usize,
        seed: u64,
    ) -> PyResult<Self> {
        let device_ctx = |ordinal: i32| {
            if ordinal < 0 {
                Context::host()
            } else {
                Context::accel(ordinal as u32)
            }
        };
        let config = RunConfig {
            dataset_path,
            run_arch: parse_arch(&run_arch)?,
            sample_type: parse_sample_type(&sample_type)?,
            fanout,
            batch_size,
            num_epoch,
            sampler_ctx: device_ctx(sampler_device),
            trainer_ctx: device_ctx(trainer_device),
            cache_policy: parse_cache_policy(&cache_policy)?,
            cache_percentage,
            max_sampling_jobs,
            max_copying_jobs,
            omp_thread_num,
            random_walk: RandomWalkConfig {
                walk_length: random_walk_length,
                restart_prob: random_walk_restart_prob,
                num_walks: num_random_walk,
                num_neighbor,
            },
            seed,
            ..RunConfig::default()
        };

        let engine = py
            .detach(|| Engine::init(config))
            .map_err(|e| PyRuntimeError::new_err(format!("failed to init engine: {e}")))?;
        Ok(Self { inner: Some(engine) })
    }

    fn start(&mut self) -> PyResult<()> {
        self.engine_mut()?
            .start()
            .map_err(|e| PyRuntimeError::new_err(format!("{e}")))
    }

    fn num_epoch(&self) -> PyResult<u64> {
        Ok(self.engine()?.num_epoch())
    }

    fn steps_per_epoch(&self) -> PyResult<u64> {
        Ok(self.engine()?.steps_per_epoch())
    }

    fn num_class(&self) -> PyResult<u64> {
        Ok(self.engine()?.num_class())
    }

    fn feat_dim(&self) -> PyResult<u64> {
        Ok(self.engine()?.feat_dim())
    }

    /// Advance the pipeline by one batch without workers (test harness).
    fn sample_once(&self, py: Python<'_>) -> PyResult<()> {
        let engine = self.engine()?;
        py.detach(|| engine.sample_once())
            .map_err(|e| PyRuntimeError::new_err(format!("{e}")))
    }

    /// Block until batch `(epoch, step)` is ready; returns the batch dict.
    /// The GIL is released during the wait.
    fn get_next_batch<'py>(
        &self,
        py: Python<'py>,
        epoch: u64,
        step: u64,
    ) -> PyResult<Bound<'py, PyDict>> {
        let engine = self.engine()?;
        let task = py
            .detach(|| engine.next_batch(epoch, step))
            .map_err(|e| PyRuntimeError::new_err(format!("{e}")))?;
        batch_to_dict(py, &task)
    }

    fn report_step(&self, epoch: u64, step: u64) -> PyResult<()> {
        self.engine()?.report_step(epoch, step);
        Ok(())
    }

    fn report_epoch(&self, epoch: u64) -> PyResult<()> {
        self.engine()?.report_epoch(epoch);
        Ok(())
    }

    /// Stop workers, drain queues, and free pipeline state.
    fn shutdown(&mut self, py: Python<'_>) {
        if let Some(mut engine) = self.inner.take() {
            py.detach(move || engine.shutdown());
        }
    }
}

impl PyEngine {
    fn engine(&self) -> PyResult<&Engine> {
        self.inner
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("engine has been shut down"))
    }

    fn engine_mut(&mut self) -> PyResult<&mut Engine> {
        self.inner
            .as_mut()
            .ok_or_else(|| PyRuntimeError::new_err("engine has been shut down"))
    }
}

/// Register the confluence Python module.
#[pymodule]
fn confluence(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyEngine>()?;
    Ok(())
}

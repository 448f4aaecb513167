//! End-to-end pipeline tests: ordered delivery, remap bijectivity, feature
//! round-trips, and shutdown liveness across the supported topologies.

mod common;

use std::collections::HashSet;

use confluence::common::{Context, IdType, Task};
use confluence::config::{RunArch, RunConfig, SampleType};
use confluence::engine::Engine;
use confluence::error::Error;
use confluence::shuffler::Shuffler;

use common::{base_config, synthetic_dataset};

/// Every delivered batch must carry the exact seeds the shuffler produced
/// for its key, the remapped layers must form dense local id spaces, and
/// `input_feat` must reproduce `feat[input_nodes[i]]` element-for-element.
fn check_full_run(config: RunConfig) {
    let mut engine = Engine::init(config.clone()).expect("engine init");
    let steps = engine.steps_per_epoch();
    assert!(steps > 0);
    engine.start().expect("start workers");

    // An identical shuffler replays the expected seed sequence.
    let mut expected = Shuffler::new(
        engine.dataset().train_set(),
        config.batch_size,
        config.num_epoch,
        config.seed,
    );

    let feat_dim = engine.feat_dim() as usize;
    for epoch in 0..engine.num_epoch() {
        for step in 0..steps {
            let (key, seeds) = expected.next_batch().expect("expected batch");
            let task = engine.next_batch(epoch, step).expect("delivered batch");
            assert_eq!(task.key, key);
            assert_eq!(
                task.output_nodes.as_slice::<IdType>(),
                &seeds[..],
                "epoch {epoch} step {step}: delivered seeds diverge from the shuffler"
            );
            check_remap(&task);
            check_features(&task, feat_dim);
        }
    }

    engine.shutdown();
}

/// Locals must be dense per layer: cols in `[0, num_dst)`, rows in
/// `[0, num_src)`, and `input_nodes[local]` must invert every local back to
/// its global id, meaning each recovered edge exists in the graph... which
/// the feature check covers via the frontier, so here we assert the id
/// spaces and the frontier inversion.
fn check_remap(task: &Task) {
    let graphs = task.train_graphs.get().expect("graphs delivered");
    let frontier = task.train_input_nodes.get().expect("input nodes delivered");
    let frontier = frontier.as_slice::<IdType>();
    let seeds = task.output_nodes.as_slice::<IdType>();

    // The frontier starts with the seeds, in order.
    assert!(frontier.len() >= seeds.len());
    assert_eq!(&frontier[..seeds.len()], seeds);
    // Globals in the frontier are distinct (it is the dedup mapping).
    let distinct: HashSet<_> = frontier.iter().collect();
    assert_eq!(distinct.len(), frontier.len());

    let mut prev_src = seeds.len();
    for (layer, g) in graphs.iter().enumerate().rev() {
        assert_eq!(g.row.len(), g.num_edge);
        assert_eq!(g.col.len(), g.num_edge);
        assert!(
            g.num_dst <= g.num_src,
            "layer {layer}: source frontier must include the destinations"
        );
        // Layers grow the frontier monotonically toward layer 0.
        assert_eq!(g.num_dst, prev_src, "layer {layer}: dst frontier mismatches previous layer");
        prev_src = g.num_src;
        for &c in g.col.as_slice::<IdType>() {
            assert!((c as usize) < g.num_dst, "layer {layer}: col local out of range");
        }
        for &r in g.row.as_slice::<IdType>() {
            assert!((r as usize) < g.num_src, "layer {layer}: row local out of range");
        }
    }
    assert_eq!(prev_src, frontier.len(), "layer 0 sources must span the whole frontier");
}

/// `feat[i][j] = i*dim + j` in the fixture, so the gathered rows are fully
/// determined by `input_nodes`.
fn check_features(task: &Task, feat_dim: usize) {
    let frontier = task.train_input_nodes.get().unwrap().as_slice::<IdType>();
    let feat = task.train_feat.get().expect("features delivered");
    assert_eq!(feat.shape(), &[frontier.len(), feat_dim]);
    let feat = feat.as_slice::<f32>();
    for (i, &node) in frontier.iter().enumerate() {
        for j in 0..feat_dim {
            assert_eq!(
                feat[i * feat_dim + j],
                (node as usize * feat_dim + j) as f32,
                "feature row {i} (node {node}) corrupted at column {j}"
            );
        }
    }

    let labels = task.train_label.get().expect("labels delivered");
    let labels = labels.as_slice::<i64>();
    for (i, &seed) in task.output_nodes.as_slice::<IdType>().iter().enumerate() {
        assert_eq!(labels[i], seed as i64 % 8);
    }
}

#[test]
fn arch0_delivers_ordered_correct_batches() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    check_full_run(base_config(&dir));
}

#[test]
fn arch1_colocated_devices() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    let config = RunConfig {
        run_arch: RunArch::Arch1,
        sampler_ctx: Context::accel(0),
        trainer_ctx: Context::accel(0),
        ..base_config(&dir)
    };
    check_full_run(config);
}

#[test]
fn arch2_offloaded_extraction() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    let config = RunConfig {
        run_arch: RunArch::Arch2,
        sampler_ctx: Context::accel(0),
        trainer_ctx: Context::accel(0),
        ..base_config(&dir)
    };
    check_full_run(config);
}

#[test]
fn arch3_overlapped_graph_copy() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    let config = RunConfig {
        run_arch: RunArch::Arch3,
        sampler_ctx: Context::accel(0),
        trainer_ctx: Context::accel(1),
        ..base_config(&dir)
    };
    check_full_run(config);
}

#[test]
fn arch5_ships_tasks_through_the_ring() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    let config = RunConfig { run_arch: RunArch::Arch5, ..base_config(&dir) };
    check_full_run(config);
}

#[test]
fn sample_parallel_kernel_runs_the_pipeline() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    let config =
        RunConfig { sample_type: SampleType::KhopSampleParallel, ..base_config(&dir) };
    check_full_run(config);
}

#[test]
fn random_walk_kernel_runs_the_pipeline() {
    let dir = synthetic_dataset(64, 3, 4, 24, false);
    let config = RunConfig { sample_type: SampleType::RandomWalk, ..base_config(&dir) };
    check_full_run(config);
}

#[test]
fn sample_once_advances_without_workers() {
    let dir = synthetic_dataset(32, 3, 4, 8, false);
    let engine = Engine::init(base_config(&dir)).unwrap();
    engine.sample_once().unwrap();
    engine.sample_once().unwrap();
    let first = engine.next_batch(0, 0).unwrap();
    let second = engine.next_batch(0, 1).unwrap();
    assert_eq!(first.key, 0);
    assert_eq!(second.key, 1);
}

#[test]
fn init_rejects_missing_dataset() {
    let config = RunConfig {
        dataset_path: "/nonexistent/confluence-dataset".into(),
        ..RunConfig::default()
    };
    let err = Engine::init(config).err().expect("init must fail on a missing dataset");
    assert!(matches!(err, Error::Io(_)), "expected an i/o error, got {err:?}");
}

#[test]
fn shutdown_completes_promptly_from_any_state() {
    let dir = synthetic_dataset(64, 3, 4, 32, false);
    // A tiny pool and an absent trainer leave workers blocked everywhere.
    let config = RunConfig {
        max_sampling_jobs: 2,
        max_copying_jobs: 2,
        num_epoch: 50,
        ..base_config(&dir)
    };
    let mut engine = Engine::init(config).unwrap();
    engine.start().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));

    let start = std::time::Instant::now();
    engine.shutdown();
    assert!(
        start.elapsed() < std::time::Duration::from_secs(5),
        "shutdown took {:?}",
        start.elapsed()
    );
}

#[test]
fn next_batch_reports_cancellation_after_shutdown() {
    let dir = synthetic_dataset(32, 3, 4, 8, false);
    let mut engine = Engine::init(base_config(&dir)).unwrap();
    engine.shutdown();
    let err = engine.next_batch(0, 0).err().expect("next_batch must fail after shutdown");
    assert!(err.is_cancelled(), "expected cancellation, got {err:?}");
}

//! Back-pressure: a slow (or absent) trainer must stall the pipeline at its
//! queue bounds without dropping or reordering batches.

mod common;

use std::time::Duration;

use confluence::common::IdType;
use confluence::config::RunConfig;
use confluence::engine::Engine;
use confluence::shuffler::Shuffler;

use common::{base_config, synthetic_dataset};

#[test]
fn stalled_trainer_bounds_inflight_batches_and_drops_nothing() {
    let dir = synthetic_dataset(96, 3, 4, 64, false);
    let config = RunConfig {
        batch_size: 4,
        num_epoch: 1,
        max_sampling_jobs: 2,
        max_copying_jobs: 3,
        ..base_config(&dir)
    };
    let mut engine = Engine::init(config.clone()).unwrap();
    let steps = engine.steps_per_epoch();
    assert_eq!(steps, 16);
    engine.start().unwrap();

    // Let the producers run far ahead of a trainer that never shows up. If
    // the bounds leaked, the whole epoch would be sampled here.
    std::thread::sleep(Duration::from_millis(200));

    // Now consume everything, slowly, in order. Every batch must arrive and
    // carry exactly the shuffler's seeds for its key.
    let mut expected = Shuffler::new(
        engine.dataset().train_set(),
        config.batch_size,
        config.num_epoch,
        config.seed,
    );
    for step in 0..steps {
        let (key, seeds) = expected.next_batch().unwrap();
        let task = engine.next_batch(0, step).unwrap();
        assert_eq!(task.key, key);
        assert_eq!(task.output_nodes.as_slice::<IdType>(), &seeds[..]);
        std::thread::sleep(Duration::from_millis(5));
    }
    engine.shutdown();
}

#[test]
fn tiny_bounds_still_complete_a_multi_epoch_run() {
    let dir = synthetic_dataset(48, 3, 4, 20, false);
    let config = RunConfig {
        batch_size: 4,
        num_epoch: 3,
        max_sampling_jobs: 1,
        max_copying_jobs: 1,
        ..base_config(&dir)
    };
    let mut engine = Engine::init(config).unwrap();
    let steps = engine.steps_per_epoch();
    engine.start().unwrap();
    for epoch in 0..engine.num_epoch() {
        for step in 0..steps {
            let task = engine.next_batch(epoch, step).unwrap();
            assert_eq!(task.epoch(), epoch);
            assert_eq!(task.step(), step);
        }
    }
    engine.shutdown();
}

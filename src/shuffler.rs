//! Seed-batch production: a permuted pass over the training set per epoch.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::common::{batch_key, IdType};

/// Produces `batch_size`-sized seed id vectors covering the train set
/// exactly once per epoch, in an order reshuffled with `seed ^ epoch`. The
/// short final batch of an epoch is kept, so an epoch has
/// `ceil(train / batch_size)` steps.
///
/// The distributed variant strides the batch sequence: worker `w` of `W`
/// observes batches `w, w + W, w + 2W, ...` of each epoch, so workers see
/// disjoint seed sets whose union is the full epoch.
pub struct Shuffler {
    order: Vec<IdType>,
    batch_size: usize,
    num_epoch: u64,
    seed: u64,
    worker_id: usize,
    num_workers: usize,
    epoch: u64,
    step: u64,
}

impl Shuffler {
    pub fn new(train_set: &[IdType], batch_size: usize, num_epoch: usize, seed: u64) -> Shuffler {
        Self::new_distributed(train_set, batch_size, num_epoch, seed, 0, 1)
    }

    pub fn new_distributed(
        train_set: &[IdType],
        batch_size: usize,
        num_epoch: usize,
        seed: u64,
        worker_id: usize,
        num_workers: usize,
    ) -> Shuffler {
        assert!(batch_size > 0);
        assert!(num_workers > 0 && worker_id < num_workers);
        let mut shuffler = Shuffler {
            order: train_set.to_vec(),
            batch_size,
            num_epoch: num_epoch as u64,
            seed,
            worker_id,
            num_workers,
            epoch: 0,
            step: 0,
        };
        shuffler.reshuffle();
        shuffler
    }

    /// Batches in one epoch across all workers.
    pub fn global_steps_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Batches this worker produces per epoch.
    pub fn steps_per_epoch(&self) -> usize {
        let total = self.global_steps_per_epoch();
        if total <= self.worker_id {
            0
        } else {
            (total - self.worker_id).div_ceil(self.num_workers)
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn num_epoch(&self) -> u64 {
        self.num_epoch
    }

    fn reshuffle(&mut self) {
        let mut rng = SmallRng::seed_from_u64(self.seed ^ self.epoch);
        self.order.shuffle(&mut rng);
    }

    /// The next `(key, seeds)` pair, or `None` once `num_epoch` epochs have
    /// been exhausted.
    pub fn next_batch(&mut self) -> Option<(u64, Vec<IdType>)> {
        if self.epoch >= self.num_epoch || self.steps_per_epoch() == 0 {
            return None;
        }

        let global_idx = self.worker_id + self.step as usize * self.num_workers;
        let start = global_idx * self.batch_size;
        let end = (start + self.batch_size).min(self.order.len());
        let batch = self.order[start..end].to_vec();
        let key = batch_key(self.epoch, self.step);

        self.step += 1;
        if self.step as usize >= self.steps_per_epoch() {
            self.epoch += 1;
            self.step = 0;
            if self.epoch < self.num_epoch {
                self.reshuffle();
            }
        }
        Some((key, batch))
    }
}

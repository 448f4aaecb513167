//! Bounded stage queues and the keyed batch pool.
//!
//! Both primitives block with back-pressure and poll the engine's shutdown
//! flag at least once a millisecond while suspended, so `shutdown()` can
//! always make progress no matter where a worker is parked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::common::Task;
use crate::error::{Error, Result};

/// Suspension poll interval: the longest any blocked worker goes without
/// re-checking the cancellation flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bounded FIFO of task handles between two stages. Multi-producer,
/// multi-consumer; tasks leave in the order they entered.
pub struct TaskQueue {
    tx: Sender<Arc<Task>>,
    rx: Receiver<Arc<Task>>,
    shutdown: Arc<AtomicBool>,
}

impl TaskQueue {
    pub fn new(capacity: usize, shutdown: Arc<AtomicBool>) -> TaskQueue {
        let (tx, rx) = bounded(capacity);
        TaskQueue { tx, rx, shutdown }
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocking enqueue; full queues exert back-pressure on the producer.
    pub fn enqueue(&self, task: Arc<Task>) -> Result<()> {
        let mut task = task;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            match self.tx.send_timeout(task, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(t)) => task = t,
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::Cancelled),
            }
        }
    }

    /// Blocking dequeue.
    pub fn dequeue(&self) -> Result<Arc<Task>> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(task) => return Ok(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Cancelled),
            }
        }
    }
}

/// Completed batches indexed by key for retrieval by the trainer. Bounded:
/// `submit` blocks while the pool is full, which is the back-pressure that
/// stalls the whole pipeline under a slow trainer.
pub struct BatchPool {
    inner: Mutex<HashMap<u64, Arc<Task>>>,
    cond: Condvar,
    capacity: usize,
    shutdown: Arc<AtomicBool>,
}

impl BatchPool {
    pub fn new(capacity: usize, shutdown: Arc<AtomicBool>) -> BatchPool {
        BatchPool {
            inner: Mutex::new(HashMap::with_capacity(capacity)),
            cond: Condvar::new(),
            capacity,
            shutdown,
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Park the finished task under its key.
    pub fn submit(&self, task: Arc<Task>) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.len() >= self.capacity {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            self.cond.wait_for(&mut inner, POLL_INTERVAL);
        }
        if inner.insert(task.key, task).is_some() {
            return Err(Error::invariant("two tasks submitted under one batch key"));
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Block until the task with `key` arrives, then take it. Keys release
    /// in whatever order the trainer asks for them, so minor out-of-order
    /// completion upstream is invisible as long as keys are requested in
    /// production order.
    pub fn get(&self, key: u64) -> Result<Arc<Task>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.remove(&key) {
                self.cond.notify_all();
                return Ok(task);
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            self.cond.wait_for(&mut inner, POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{batch_key, Tensor};

    fn task(key: u64) -> Arc<Task> {
        Arc::new(Task::new(key, Tensor::from_vec(vec![key as u32], vec![1])))
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let q = TaskQueue::new(8, shutdown);
        for k in 0..5 {
            q.enqueue(task(k)).unwrap();
        }
        for k in 0..5 {
            assert_eq!(q.dequeue().unwrap().key, k);
        }
    }

    #[test]
    fn full_queue_blocks_until_a_consumer_drains() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let q = Arc::new(TaskQueue::new(1, shutdown));
        q.enqueue(task(0)).unwrap();
        assert!(q.is_full());

        let producer = {
            let q = q.clone();
            std::thread::spawn(move || q.enqueue(task(1)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished(), "producer must block on the full queue");
        assert_eq!(q.dequeue().unwrap().key, 0);
        producer.join().unwrap().unwrap();
        assert_eq!(q.dequeue().unwrap().key, 1);
    }

    #[test]
    fn blocked_enqueue_observes_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let q = Arc::new(TaskQueue::new(1, shutdown.clone()));
        q.enqueue(task(0)).unwrap();

        let producer = {
            let q = q.clone();
            std::thread::spawn(move || q.enqueue(task(1)))
        };
        std::thread::sleep(Duration::from_millis(10));
        shutdown.store(true, Ordering::Relaxed);
        let err = producer.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn pool_releases_by_key_not_arrival_order() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = BatchPool::new(4, shutdown);
        pool.submit(task(batch_key(0, 1))).unwrap();
        pool.submit(task(batch_key(0, 0))).unwrap();
        assert_eq!(pool.get(batch_key(0, 0)).unwrap().key, batch_key(0, 0));
        assert_eq!(pool.get(batch_key(0, 1)).unwrap().key, batch_key(0, 1));
        assert!(pool.is_empty());
    }

    #[test]
    fn pool_get_blocks_until_submit() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(BatchPool::new(4, shutdown));
        let getter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get(7).map(|t| t.key))
        };
        std::thread::sleep(Duration::from_millis(10));
        pool.submit(task(7)).unwrap();
        assert_eq!(getter.join().unwrap().unwrap(), 7);
    }
}

//! Cross-process task transport for the distributed topology.
//!
//! A fixed ring of descriptor slots over a shared memory mapping, guarded by
//! a semaphore pair (`items` counts readable slots, `space` writable ones).
//! Producers reserve a sequence number, write their frame, then publish it
//! by stamping the slot's sequence marker; consumers spin on the marker, so
//! a slot can never be read half-written or overwritten before its reader
//! releases it.
//!
//! Task payloads are framed manually: seed ids, the final frontier, and one
//! `(num_src, num_dst, row[], col[])` record per layer, all little-endian.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::common::{set_once, IdType, Task, Tensor, TrainGraph};
use crate::error::{Error, Result};
use crate::queue::POLL_INTERVAL;

const HEADER_BYTES: usize = 64;
/// Per-slot prefix: the publish marker and the frame length.
const SLOT_PREFIX: usize = 16;

#[repr(C)]
struct Header {
    /// Next sequence number a producer will reserve.
    tail: AtomicU64,
    /// Next sequence number a consumer will take.
    head: AtomicU64,
    /// Published, unconsumed frames.
    sem_items: AtomicU64,
    /// Free slots.
    sem_space: AtomicU64,
}

pub struct MemoryQueue {
    region: MmapMut,
    num_slots: usize,
    slot_bytes: usize,
    shutdown: Arc<AtomicBool>,
}

// SAFETY: all shared-region access goes through atomics or happens inside
// the reserve/publish window the semaphore pair serializes.
unsafe impl Send for MemoryQueue {}
unsafe impl Sync for MemoryQueue {}

impl MemoryQueue {
    /// `slot_bytes` bounds one serialized task; `num_slots` bounds the
    /// in-flight tasks, giving the queue its back-pressure.
    pub fn new(
        num_slots: usize,
        slot_bytes: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Result<MemoryQueue> {
        // Slot stride stays 8-byte aligned so every marker and length word
        // is a legal atomic location.
        let slot_bytes = slot_bytes.div_ceil(8) * 8;
        let total = HEADER_BYTES + num_slots * (SLOT_PREFIX + slot_bytes);
        let region = MmapMut::map_anon(total)?;
        let queue = MemoryQueue { region, num_slots, slot_bytes, shutdown };
        queue.header().sem_space.store(num_slots as u64, Ordering::Release);
        Ok(queue)
    }

    fn base(&self) -> *mut u8 {
        // The region is logically shared and mutated through raw pointers;
        // every write site is serialized by the ring protocol.
        self.region.as_ptr() as *mut u8
    }

    fn header(&self) -> &Header {
        // SAFETY: the mapping is page-aligned, at least HEADER_BYTES long,
        // and zero-initialized, which is a valid Header.
        unsafe { &*(self.base() as *const Header) }
    }

    fn slot_marker(&self, slot: usize) -> &AtomicU64 {
        let off = HEADER_BYTES + slot * (SLOT_PREFIX + self.slot_bytes);
        // SAFETY: `slot < num_slots`, so the marker word is inside the
        // mapping and 8-byte aligned.
        unsafe { &*(self.base().add(off) as *const AtomicU64) }
    }

    fn slot_body(&self, slot: usize) -> *mut u8 {
        let off = HEADER_BYTES + slot * (SLOT_PREFIX + self.slot_bytes) + SLOT_PREFIX;
        // SAFETY: in-bounds by construction.
        unsafe { self.base().add(off) }
    }

    /// Decrement `sem` once it is positive, polling cancellation.
    fn acquire(&self, sem: &AtomicU64) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let available = sem.load(Ordering::Acquire);
            if available > 0
                && sem
                    .compare_exchange(available, available - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Copy one frame into the ring, blocking while it is full.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.slot_bytes {
            return Err(Error::resource(format!(
                "task frame of {} bytes exceeds the {}-byte ring slot",
                frame.len(),
                self.slot_bytes
            )));
        }
        let header = self.header();
        self.acquire(&header.sem_space)?;

        let seq = header.tail.fetch_add(1, Ordering::AcqRel);
        let slot = (seq % self.num_slots as u64) as usize;
        let body = self.slot_body(slot);
        // SAFETY: the space semaphore guarantees this slot's previous frame
        // was consumed, and no other producer holds this sequence number.
        unsafe {
            (body.sub(8) as *mut u64).write((frame.len() as u64).to_le());
            std::ptr::copy_nonoverlapping(frame.as_ptr(), body, frame.len());
        }
        // Publish. The marker carries seq+1 so zero always means "never
        // written".
        self.slot_marker(slot).store(seq + 1, Ordering::Release);
        header.sem_items.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Take the next frame in FIFO order, blocking while the ring is empty.
    pub fn recv(&self) -> Result<Vec<u8>> {
        let header = self.header();
        self.acquire(&header.sem_items)?;

        let seq = header.head.fetch_add(1, Ordering::AcqRel);
        let slot = (seq % self.num_slots as u64) as usize;
        let marker = self.slot_marker(slot);
        while marker.load(Ordering::Acquire) != seq + 1 {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            std::hint::spin_loop();
        }
        let body = self.slot_body(slot);
        // SAFETY: the marker proves the producer finished writing this
        // frame, and `len` was bounds-checked on the send side.
        let frame = unsafe {
            let len = u64::from_le((body.sub(8) as *const u64).read()) as usize;
            std::slice::from_raw_parts(body as *const u8, len).to_vec()
        };
        header.sem_space.fetch_add(1, Ordering::AcqRel);
        Ok(frame)
    }
}

// ============================================================================
// Task Framing
// ============================================================================

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_ids(buf: &mut Vec<u8>, ids: &[IdType]) {
    put_u32(buf, ids.len() as u32);
    for &id in ids {
        put_u32(buf, id);
    }
}

struct FrameReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> FrameReader<'a> {
    fn u32(&mut self) -> Result<u32> {
        let end = self.at + 4;
        if end > self.bytes.len() {
            return Err(Error::invariant("truncated task frame"));
        }
        let v = u32::from_le_bytes(self.bytes[self.at..end].try_into().unwrap_or_default());
        self.at = end;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        let end = self.at + 8;
        if end > self.bytes.len() {
            return Err(Error::invariant("truncated task frame"));
        }
        let v = u64::from_le_bytes(self.bytes[self.at..end].try_into().unwrap_or_default());
        self.at = end;
        Ok(v)
    }

    fn ids(&mut self) -> Result<Vec<IdType>> {
        let n = self.u32()? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.u32()?);
        }
        Ok(out)
    }
}

/// Worst-case frame size for the given pipeline shape, used to size ring
/// slots.
pub fn max_frame_bytes(max_nodes: usize, max_edges_per_layer: usize, num_layers: usize) -> usize {
    // key + seed/frontier vectors + per-layer counts and endpoint vectors.
    8 + 2 * (4 + max_nodes * 4) + 4 + num_layers * (12 + 2 * max_edges_per_layer * 4)
}

/// Flatten a fully sampled and remapped task for the ring. Feature tensors
/// are never shipped: the trainer-side process re-extracts from its own
/// mapping of the feature table.
pub fn serialize_task(task: &Task) -> Result<Vec<u8>> {
    let graphs = crate::common::get_set(&task.graphs, "graphs")?;
    let input_nodes = crate::common::get_set(&task.input_nodes, "input_nodes")?;

    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(&task.key.to_le_bytes());
    put_ids(&mut buf, task.output_nodes.as_slice::<IdType>());
    put_ids(&mut buf, input_nodes.as_slice::<IdType>());
    put_u32(&mut buf, graphs.len() as u32);
    for g in graphs {
        put_u32(&mut buf, g.num_src as u32);
        put_u32(&mut buf, g.num_dst as u32);
        put_ids(&mut buf, g.row.as_slice::<IdType>());
        put_ids(&mut buf, g.col.as_slice::<IdType>());
    }
    Ok(buf)
}

/// Rebuild a task on the consumer side. The deserialized task is already
/// remapped, so `graph_remapped` starts raised.
pub fn deserialize_task(bytes: &[u8]) -> Result<Task> {
    let mut r = FrameReader { bytes, at: 0 };
    let key = r.u64()?;
    let output_nodes = r.ids()?;
    let input_nodes = r.ids()?;
    let num_layers = r.u32()? as usize;

    let n_out = output_nodes.len();
    let task = Task::new(key, Tensor::from_vec(output_nodes, vec![n_out]));
    let n_in = input_nodes.len();
    set_once(&task.input_nodes, Tensor::from_vec(input_nodes, vec![n_in]), "input_nodes")?;

    let mut graphs = Vec::with_capacity(num_layers);
    for _ in 0..num_layers {
        let num_src = r.u32()? as usize;
        let num_dst = r.u32()? as usize;
        let row = r.ids()?;
        let col = r.ids()?;
        if row.len() != col.len() {
            return Err(Error::invariant("task frame: row/col length mismatch"));
        }
        let num_edge = row.len();
        graphs.push(TrainGraph {
            row: Tensor::from_vec(row, vec![num_edge]),
            col: Tensor::from_vec(col, vec![num_edge]),
            num_src,
            num_dst,
            num_edge,
        });
    }
    set_once(&task.graphs, graphs, "graphs")?;
    task.graph_remapped.store(true, Ordering::Release);
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_round_trips_frames_in_order() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let q = MemoryQueue::new(4, 64, shutdown).unwrap();
        for i in 0..10u8 {
            q.send(&[i, i + 1, i + 2]).unwrap();
            assert_eq!(q.recv().unwrap(), vec![i, i + 1, i + 2]);
        }
    }

    #[test]
    fn ring_blocks_producer_when_full() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let q = Arc::new(MemoryQueue::new(2, 16, shutdown).unwrap());
        q.send(&[1]).unwrap();
        q.send(&[2]).unwrap();

        let producer = {
            let q = q.clone();
            std::thread::spawn(move || q.send(&[3]))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!producer.is_finished(), "third send must block on the full ring");
        assert_eq!(q.recv().unwrap(), vec![1]);
        producer.join().unwrap().unwrap();
        assert_eq!(q.recv().unwrap(), vec![2]);
        assert_eq!(q.recv().unwrap(), vec![3]);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let q = MemoryQueue::new(2, 8, shutdown).unwrap();
        assert!(matches!(q.send(&[0u8; 9]), Err(Error::Resource(_))));
    }

    #[test]
    fn task_frame_round_trips() {
        let task = Task::new(crate::common::batch_key(2, 5), Tensor::from_vec(vec![8u32, 3], vec![2]));
        set_once(
            &task.input_nodes,
            Tensor::from_vec(vec![8u32, 3, 1, 4], vec![4]),
            "input_nodes",
        )
        .unwrap();
        set_once(
            &task.graphs,
            vec![TrainGraph {
                row: Tensor::from_vec(vec![2u32, 3], vec![2]),
                col: Tensor::from_vec(vec![0u32, 1], vec![2]),
                num_src: 4,
                num_dst: 2,
                num_edge: 2,
            }],
            "graphs",
        )
        .unwrap();

        let frame = serialize_task(&task).unwrap();
        assert!(frame.len() <= max_frame_bytes(4, 2, 1));
        let back = deserialize_task(&frame).unwrap();
        assert_eq!(back.key, task.key);
        assert_eq!(back.output_nodes.as_slice::<u32>(), &[8, 3]);
        assert_eq!(back.input_nodes.get().unwrap().as_slice::<u32>(), &[8, 3, 1, 4]);
        let graphs = back.graphs.get().unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].row.as_slice::<u32>(), &[2, 3]);
        assert_eq!(graphs[0].col.as_slice::<u32>(), &[0, 1]);
        assert_eq!((graphs[0].num_src, graphs[0].num_dst, graphs[0].num_edge), (4, 2, 2));
        assert!(back.graph_remapped.load(Ordering::Acquire));
    }
}

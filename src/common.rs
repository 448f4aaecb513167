//! Core data model shared by every pipeline stage: element types, contexts,
//! the tagged tensor buffer, per-layer COO subgraphs, and the task descriptor
//! that flows through the stage queues.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

use half::f16;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceBuffer, StreamHandle, WorkspaceBuffer, WorkspacePool};
use crate::error::{Error, Result};

/// Node identifier. `u32` matches the on-disk CSR encoding and supports up
/// to ~4B nodes.
pub type IdType = u32;

/// Sentinel id: never a valid node, used for unsampled slots and probe
/// misses.
pub const EMPTY_KEY: IdType = IdType::MAX;

// ============================================================================
// Element Types
// ============================================================================

/// Element type of a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F64,
    F16,
    U8,
    I32,
    I8,
    I64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::F16 => 2,
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
        }
    }
}

/// Rust types that can live inside a [`Tensor`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}
impl Element for f64 {
    const DTYPE: DataType = DataType::F64;
}
impl Element for f16 {
    const DTYPE: DataType = DataType::F16;
}
impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}
impl Element for i8 {
    const DTYPE: DataType = DataType::I8;
}
impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}
impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}
impl Element for u32 {
    // Node ids share the I32 wire encoding; the sign bit is never set for a
    // valid id.
    const DTYPE: DataType = DataType::I32;
}

// ============================================================================
// Execution Contexts
// ============================================================================

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Host RAM, owned by this process.
    Host,
    /// Host RAM backed by a shared read-only file mapping.
    Mmap,
    /// An accelerator device managed through the [`Device`] contract.
    Accel,
}

/// Execution context tag: device kind plus device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub kind: DeviceKind,
    pub id: u32,
}

impl Context {
    pub const fn host() -> Self {
        Context { kind: DeviceKind::Host, id: 0 }
    }

    pub const fn mmap() -> Self {
        Context { kind: DeviceKind::Mmap, id: 0 }
    }

    pub const fn accel(id: u32) -> Self {
        Context { kind: DeviceKind::Accel, id }
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DeviceKind::Host => write!(f, "cpu:{}", self.id),
            DeviceKind::Mmap => write!(f, "mmap:{}", self.id),
            DeviceKind::Accel => write!(f, "accel:{}", self.id),
        }
    }
}

// ============================================================================
// Tensor
// ============================================================================

enum Storage {
    /// Host allocation, 8-byte aligned so every element type can view it.
    HostBuf(Vec<u64>),
    /// Shared read-only file mapping. Never freed on drop; the `Arc` keeps
    /// the map alive across clones of views into it.
    Mmap(Arc<Mmap>),
    /// Long-lived allocation owned by a device, freed through the device
    /// allocator on drop.
    Owned(DeviceBuffer),
    /// Transient allocation from a per-device workspace pool, returned to
    /// the pool's free list on drop.
    Workspace(WorkspaceBuffer),
}

/// A typed, shaped, contiguous byte buffer tagged with its execution
/// context.
///
/// Shape and dtype are fixed at creation. `nbytes` always equals
/// `shape.product() * dtype.bytes()`. Cross-device movement goes through
/// [`Tensor::copy_to`]; nothing else touches raw pointers across the device
/// boundary.
pub struct Tensor {
    storage: Storage,
    dtype: DataType,
    shape: Vec<usize>,
    ctx: Context,
}

fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    /// Host tensor taking ownership of `data`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: Vec<usize>) -> Tensor {
        assert_eq!(
            data.len(),
            shape_size(&shape),
            "tensor shape {:?} does not cover {} elements",
            shape,
            data.len(),
        );
        Self::from_slice(&data, shape)
    }

    /// Host tensor copied from a slice.
    pub fn from_slice<T: Element>(data: &[T], shape: Vec<usize>) -> Tensor {
        assert_eq!(data.len(), shape_size(&shape));
        let nbytes = data.len() * std::mem::size_of::<T>();
        let mut buf = vec![0u64; nbytes.div_ceil(8)];
        // SAFETY: both regions are at least `nbytes` long and do not overlap;
        // T is a plain scalar with no padding.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                buf.as_mut_ptr() as *mut u8,
                nbytes,
            );
        }
        Tensor {
            storage: Storage::HostBuf(buf),
            dtype: T::DTYPE,
            shape,
            ctx: Context::host(),
        }
    }

    /// Zero-initialized host tensor.
    pub fn zeros(dtype: DataType, shape: Vec<usize>) -> Tensor {
        let nbytes = shape_size(&shape) * dtype.bytes();
        Tensor {
            storage: Storage::HostBuf(vec![0u64; nbytes.div_ceil(8)]),
            dtype,
            shape,
            ctx: Context::host(),
        }
    }

    /// Map a dataset file read-only. The file length must match the tensor
    /// size exactly.
    pub fn from_mmap(path: &Path, dtype: DataType, shape: Vec<usize>) -> Result<Tensor> {
        let nbytes = shape_size(&shape) * dtype.bytes();
        let file = std::fs::File::open(path)?;
        let file_nbytes = file.metadata()?.len() as usize;
        if file_nbytes != nbytes {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "{}: expected {} bytes for shape {:?} ({:?}), file has {}",
                    path.display(),
                    nbytes,
                    shape,
                    dtype,
                    file_nbytes,
                ),
            )));
        }
        // SAFETY: the dataset files are written once by the preprocessor and
        // treated as immutable for the life of the process.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Tensor {
            storage: Storage::Mmap(Arc::new(mmap)),
            dtype,
            shape,
            ctx: Context::mmap(),
        })
    }

    /// Uninitialized long-lived tensor on `device`.
    pub fn empty(dtype: DataType, shape: Vec<usize>, device: &Arc<dyn Device>) -> Result<Tensor> {
        let nbytes = shape_size(&shape) * dtype.bytes();
        let buffer = DeviceBuffer::alloc(device.clone(), nbytes)?;
        Ok(Tensor { storage: Storage::Owned(buffer), dtype, shape, ctx: device.ctx() })
    }

    /// Uninitialized transient tensor served by the workspace pool.
    pub fn workspace(
        dtype: DataType,
        shape: Vec<usize>,
        pool: &Arc<WorkspacePool>,
    ) -> Result<Tensor> {
        let nbytes = shape_size(&shape) * dtype.bytes();
        let buffer = pool.alloc(nbytes)?;
        Ok(Tensor { storage: Storage::Workspace(buffer), dtype, shape, ctx: pool.ctx() })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ctx(&self) -> Context {
        self.ctx
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        shape_size(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype.bytes()
    }

    pub fn as_ptr(&self) -> *const u8 {
        match &self.storage {
            Storage::HostBuf(buf) => buf.as_ptr() as *const u8,
            Storage::Mmap(m) => m.as_ptr(),
            Storage::Owned(b) => b.as_ptr(),
            Storage::Workspace(b) => b.as_ptr(),
        }
    }

    /// Mutable base pointer.
    ///
    /// # Panics
    /// Panics on mmap-backed tensors, which are always read-only.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.storage {
            Storage::HostBuf(buf) => buf.as_mut_ptr() as *mut u8,
            Storage::Mmap(_) => panic!("mmap-backed tensors are read-only"),
            Storage::Owned(b) => b.as_mut_ptr(),
            Storage::Workspace(b) => b.as_mut_ptr(),
        }
    }

    /// Typed view of the full buffer.
    ///
    /// # Panics
    /// Panics if `T` does not match the tensor's dtype.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        assert_eq!(T::DTYPE, self.dtype, "dtype mismatch in tensor view");
        // SAFETY: every storage variant is at least 8-byte aligned (mmap is
        // page aligned, host buffers are u64-backed, device buffers are
        // allocated with 64-byte alignment) and holds exactly `len()`
        // elements of the tagged dtype.
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const T, self.len()) }
    }

    /// Typed mutable view of the full buffer.
    pub fn as_mut_slice<T: Element>(&mut self) -> &mut [T] {
        assert_eq!(T::DTYPE, self.dtype, "dtype mismatch in tensor view");
        let len = self.len();
        // SAFETY: see `as_slice`; `&mut self` guarantees unique access.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr() as *mut T, len) }
    }

    /// Copy this tensor onto `device` through `stream`, returning the new
    /// tensor. The source may live on any context the device can read.
    pub fn copy_to(&self, device: &Arc<dyn Device>, stream: StreamHandle) -> Result<Tensor> {
        let mut dst = Tensor::empty(self.dtype, self.shape.clone(), device)?;
        // SAFETY: freshly allocated destination of identical byte length.
        unsafe {
            device.copy(self.as_ptr(), dst.as_mut_ptr(), self.nbytes(), self.ctx, dst.ctx, stream)?;
        }
        Ok(dst)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("ctx", &self.ctx)
            .finish()
    }
}

// SAFETY: all storage variants are either plain host memory or device
// allocations whose handles are thread-safe; mutation is gated by `&mut`.
unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

// ============================================================================
// Train Graph & Task
// ============================================================================

/// One sampled layer as a COO subgraph after remapping into dense local
/// ids. `row` indexes the source (expanded) frontier, `col` the destination
/// (seed) frontier of the layer.
pub struct TrainGraph {
    pub row: Tensor,
    pub col: Tensor,
    pub num_src: usize,
    pub num_dst: usize,
    pub num_edge: usize,
}

/// The per-step unit of work flowing through the pipeline.
///
/// `key` and `output_nodes` are fixed at creation by the shuffler. Every
/// other field is assigned exactly once by exactly one downstream stage,
/// which is what lets two stages share the task during the overlapped A3
/// copy phase: the extractor only reads fields its upstream has already
/// published, and waits on `graph_remapped` for the rest.
pub struct Task {
    /// `(epoch << 32) | step`.
    pub key: u64,
    /// Seed frontier: destination ids of layer `L-1`.
    pub output_nodes: Tensor,

    /// Remapped per-layer subgraphs on the sampler context. Set by the
    /// remap stage.
    pub graphs: OnceLock<Vec<TrainGraph>>,
    /// Final source frontier (global ids) on the sampler context. Set by
    /// the remap stage before the task is handed downstream.
    pub input_nodes: OnceLock<Tensor>,
    /// Raised after `graphs` is published; the A3 copy worker spins on this
    /// before touching the subgraphs.
    pub graph_remapped: AtomicBool,

    /// Host-side gather results, produced by the feature extractor.
    pub input_feat: OnceLock<Tensor>,
    pub output_label: OnceLock<Tensor>,

    /// Trainer-context tensors, produced by the copy stages.
    pub train_graphs: OnceLock<Vec<TrainGraph>>,
    pub train_input_nodes: OnceLock<Tensor>,
    pub train_output_nodes: OnceLock<Tensor>,
    pub train_feat: OnceLock<Tensor>,
    pub train_label: OnceLock<Tensor>,
}

impl Task {
    pub fn new(key: u64, output_nodes: Tensor) -> Task {
        Task {
            key,
            output_nodes,
            graphs: OnceLock::new(),
            input_nodes: OnceLock::new(),
            graph_remapped: AtomicBool::new(false),
            input_feat: OnceLock::new(),
            output_label: OnceLock::new(),
            train_graphs: OnceLock::new(),
            train_input_nodes: OnceLock::new(),
            train_output_nodes: OnceLock::new(),
            train_feat: OnceLock::new(),
            train_label: OnceLock::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        key_epoch(self.key)
    }

    pub fn step(&self) -> u64 {
        key_step(self.key)
    }
}

/// Assign a once-only task field; a second assignment is a pipeline bug.
pub(crate) fn set_once<T>(cell: &OnceLock<T>, value: T, what: &str) -> Result<()> {
    cell.set(value)
        .map_err(|_| Error::invariant(format!("task field `{what}` assigned twice")))
}

/// Read a once-only task field that the stage contract says must be set.
pub(crate) fn get_set<'a, T>(cell: &'a OnceLock<T>, what: &str) -> Result<&'a T> {
    cell.get()
        .ok_or_else(|| Error::invariant(format!("task field `{what}` read before assignment")))
}

// ============================================================================
// Batch Keys & Size Prediction
// ============================================================================

/// Pack `(epoch, step)` into the batch key the pool indexes by.
pub const fn batch_key(epoch: u64, step: u64) -> u64 {
    (epoch << 32) | step
}

pub const fn key_epoch(key: u64) -> u64 {
    key >> 32
}

pub const fn key_step(key: u64) -> u64 {
    key & 0xffff_ffff
}

/// Upper bound on distinct nodes a batch can touch: the seed frontier plus
/// one fully-fanned-out expansion per layer. Sizes the remapping table.
pub fn predict_num_nodes(batch_size: usize, fanout: &[usize]) -> usize {
    let mut frontier = batch_size;
    let mut total = batch_size;
    for &f in fanout.iter().rev() {
        frontier *= f;
        total += frontier;
    }
    total
}

/// Upper bound on edges a random-walk layer can emit before top-k
/// truncation. Sizes the frequency arena.
pub fn predict_num_random_walk_edges(
    batch_size: usize,
    num_layers: usize,
    num_walks: usize,
    walk_length: usize,
    num_neighbor: usize,
) -> usize {
    let mut frontier = batch_size;
    let mut total = 0;
    for _ in 0..num_layers {
        total += frontier * num_walks * walk_length;
        frontier *= num_neighbor;
    }
    total
}

/// Human-readable byte count for debug logs.
pub fn to_readable_size(nbytes: usize) -> String {
    const KB: f64 = 1024.0;
    let n = nbytes as f64;
    if n >= KB * KB * KB {
        format!("{:.2} GiB", n / (KB * KB * KB))
    } else if n >= KB * KB {
        format!("{:.2} MiB", n / (KB * KB))
    } else if n >= KB {
        format!("{:.2} KiB", n / KB)
    } else {
        format!("{nbytes} B")
    }
}

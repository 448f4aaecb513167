//! Accelerator abstraction and the host implementation of it.
//!
//! The pipeline core never calls a vendor API directly: every stage talks to
//! a [`Device`] — allocate/free, stream-ordered async copy, stream and event
//! management. The in-tree [`HostDevice`] backs plain host RAM and is what
//! every test runs against; an accelerator runtime plugs in by implementing
//! the same trait.
//!
//! Transient sampling/remap allocations go through the per-device
//! [`WorkspacePool`]: page-rounded blocks recycled through a best-fit free
//! list, returned to the device allocator only when the pool is dropped at
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::Context;
use crate::error::{Error, Result};

/// Opaque per-stage stream token. Stream 0 is the device's default stream.
pub type StreamHandle = u64;

/// Opaque event token returned by [`Device::event_record`].
pub type EventHandle = u64;

pub const DEFAULT_STREAM: StreamHandle = 0;

/// Alignment for all device allocations. Covers every element type and the
/// widest SIMD loads the gather kernels use.
pub const ALLOC_ALIGNMENT: usize = 64;

/// Contract the core requires from an execution backend.
pub trait Device: Send + Sync {
    /// The context this device instance serves.
    fn ctx(&self) -> Context;

    /// Allocate `nbytes` of device memory aligned to [`ALLOC_ALIGNMENT`].
    fn alloc(&self, nbytes: usize) -> Result<*mut u8>;

    /// Free memory previously returned by [`Device::alloc`].
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this device with the same `nbytes`,
    /// and must not be used afterwards.
    unsafe fn free(&self, ptr: *mut u8, nbytes: usize);

    /// Stream-ordered copy of `nbytes` between contexts this device can
    /// address. Completion is observed via [`Device::stream_sync`] or an
    /// event recorded after the copy.
    ///
    /// # Safety
    /// Both pointers must be valid for `nbytes` and must not overlap.
    unsafe fn copy(
        &self,
        src: *const u8,
        dst: *mut u8,
        nbytes: usize,
        src_ctx: Context,
        dst_ctx: Context,
        stream: StreamHandle,
    ) -> Result<()>;

    fn stream_create(&self) -> StreamHandle;
    fn stream_destroy(&self, stream: StreamHandle);
    /// Block until all work submitted to `stream` has completed.
    fn stream_sync(&self, stream: StreamHandle);

    /// Record an event capturing all work submitted to `stream` so far.
    fn event_record(&self, stream: StreamHandle) -> EventHandle;
    /// Make `stream` wait until `event` has completed.
    fn event_wait(&self, stream: StreamHandle, event: EventHandle);
}

// ============================================================================
// Host Device
// ============================================================================

/// Host-RAM backend. Copies are synchronous, so streams and events reduce to
/// token bookkeeping while preserving the ordering contract callers rely on.
///
/// The context is injectable: topology tests run "accelerator" stages on
/// host memory by constructing a `HostDevice` with an accel context.
pub struct HostDevice {
    ctx: Context,
    next_stream: AtomicU64,
    next_event: AtomicU64,
}

impl HostDevice {
    pub fn new(ctx: Context) -> Arc<dyn Device> {
        Arc::new(HostDevice {
            ctx,
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
        })
    }

    fn layout(nbytes: usize) -> std::alloc::Layout {
        // SAFETY-adjacent: ALLOC_ALIGNMENT is a nonzero power of two and the
        // rounded size cannot overflow isize for any tensor this crate
        // builds.
        std::alloc::Layout::from_size_align(nbytes.max(1), ALLOC_ALIGNMENT)
            .expect("invalid allocation layout")
    }
}

impl Device for HostDevice {
    fn ctx(&self) -> Context {
        self.ctx
    }

    fn alloc(&self, nbytes: usize) -> Result<*mut u8> {
        // SAFETY: layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc(Self::layout(nbytes)) };
        if ptr.is_null() {
            return Err(Error::resource(format!(
                "host allocation of {} failed on {}",
                crate::common::to_readable_size(nbytes),
                self.ctx,
            )));
        }
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: *mut u8, nbytes: usize) {
        std::alloc::dealloc(ptr, Self::layout(nbytes));
    }

    unsafe fn copy(
        &self,
        src: *const u8,
        dst: *mut u8,
        nbytes: usize,
        _src_ctx: Context,
        _dst_ctx: Context,
        _stream: StreamHandle,
    ) -> Result<()> {
        std::ptr::copy_nonoverlapping(src, dst, nbytes);
        Ok(())
    }

    fn stream_create(&self) -> StreamHandle {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }

    fn stream_destroy(&self, _stream: StreamHandle) {}

    fn stream_sync(&self, _stream: StreamHandle) {
        // Host copies complete before `copy` returns.
    }

    fn event_record(&self, _stream: StreamHandle) -> EventHandle {
        self.next_event.fetch_add(1, Ordering::Relaxed)
    }

    fn event_wait(&self, _stream: StreamHandle, _event: EventHandle) {}
}

// ============================================================================
// Owned Buffers
// ============================================================================

/// Long-lived allocation freed through its device on drop.
pub struct DeviceBuffer {
    ptr: *mut u8,
    nbytes: usize,
    device: Arc<dyn Device>,
}

impl DeviceBuffer {
    pub fn alloc(device: Arc<dyn Device>, nbytes: usize) -> Result<DeviceBuffer> {
        let ptr = device.alloc(nbytes)?;
        Ok(DeviceBuffer { ptr, nbytes, device })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/nbytes are exactly what `alloc` returned.
        unsafe { self.device.free(self.ptr, self.nbytes) };
    }
}

// SAFETY: the buffer is a unique handle to device memory; aliasing is
// prevented by ownership, and the device itself is Send + Sync.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

/// Transient allocation returned to its pool's free list on drop.
pub struct WorkspaceBuffer {
    ptr: *mut u8,
    pool: Arc<WorkspacePool>,
}

impl WorkspaceBuffer {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for WorkspaceBuffer {
    fn drop(&mut self) {
        self.pool.recycle(self.ptr as usize);
    }
}

// SAFETY: see `DeviceBuffer`.
unsafe impl Send for WorkspaceBuffer {}
unsafe impl Sync for WorkspaceBuffer {}

// ============================================================================
// Workspace Pool
// ============================================================================

/// Allocation granularity of the workspace pool.
const WORKSPACE_PAGE_SIZE: usize = 4 << 10;

#[derive(Clone, Copy)]
struct PoolEntry {
    ptr: usize,
    size: usize,
}

struct PoolInner {
    /// Recycled blocks, kept sorted by size ascending for best-fit lookup.
    free_list: Vec<PoolEntry>,
    /// Live allocations, keyed by base pointer.
    allocated: HashMap<usize, usize>,
}

/// Slab-style allocator for the transient buffers sampling and remap churn
/// through every batch. Requests round up to whole pages; freed blocks are
/// reinserted into a size-sorted free list and only handed back to the
/// device allocator when the pool itself is dropped.
pub struct WorkspacePool {
    device: Arc<dyn Device>,
    inner: Mutex<PoolInner>,
}

impl WorkspacePool {
    pub fn new(device: Arc<dyn Device>) -> Arc<WorkspacePool> {
        Arc::new(WorkspacePool {
            device,
            inner: Mutex::new(PoolInner {
                free_list: Vec::with_capacity(64),
                allocated: HashMap::with_capacity(64),
            }),
        })
    }

    pub fn ctx(&self) -> Context {
        self.device.ctx()
    }

    pub fn alloc(self: &Arc<Self>, nbytes: usize) -> Result<WorkspaceBuffer> {
        let size = nbytes.div_ceil(WORKSPACE_PAGE_SIZE).max(1) * WORKSPACE_PAGE_SIZE;

        let mut inner = self.inner.lock();
        let entry = {
            // Best fit: smallest free block that can hold the request.
            let idx = inner.free_list.partition_point(|e| e.size < size);
            if idx < inner.free_list.len() {
                inner.free_list.remove(idx)
            } else {
                let ptr = self.device.alloc(size)? as usize;
                PoolEntry { ptr, size }
            }
        };
        inner.allocated.insert(entry.ptr, entry.size);
        drop(inner);

        Ok(WorkspaceBuffer { ptr: entry.ptr as *mut u8, pool: self.clone() })
    }

    fn recycle(&self, ptr: usize) {
        let mut inner = self.inner.lock();
        let size = inner
            .allocated
            .remove(&ptr)
            .expect("workspace free of a pointer the pool never allocated");
        let idx = inner.free_list.partition_point(|e| e.size < size);
        inner.free_list.insert(idx, PoolEntry { ptr, size });
    }

    /// Bytes currently parked in the free list.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free_list.iter().map(|e| e.size).sum()
    }
}

impl Drop for WorkspacePool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.allocated.is_empty() {
            tracing::warn!(
                live = inner.allocated.len(),
                "workspace pool dropped with live allocations; leaking them"
            );
        }
        for e in inner.free_list.drain(..) {
            // SAFETY: every free-list entry came from this device's alloc.
            unsafe { self.device.free(e.ptr as *mut u8, e.size) };
        }
    }
}

//! DMA buffer registry.
//!
//! Central bookkeeping for every live DMA allocation: which bus address
//! backs which handle, and how many bytes are currently pinned (the sweep
//! planner budgets against that total). Buffers are RAII — dropping the
//! handle is the only way memory returns to the pool — while lookups go
//! through copyable [`BufferId`]s so a stale reference degrades to a
//! [`DriverError::NotFound`] instead of a dangling pointer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::cma::{CmaAllocator, DmaRegion};
use crate::error::{DriverError, Result};
use seqmatch_hw::addr::PhysAddr;

/// Opaque handle naming one live allocation. Unique per registry for the
/// registry's lifetime; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    /// Raw id value, for log and error context.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    phys: PhysAddr,
    len: usize,
}

struct RegistryInner {
    allocator: Box<dyn CmaAllocator>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    live_bytes: u64,
}

/// Registry of live DMA allocations over one platform allocator.
///
/// Shared state sits behind one mutex; buffer handles keep the state alive
/// through an `Arc`, so a buffer may safely outlive the registry value
/// itself — its memory still returns to the pool on drop.
pub struct DmaRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for DmaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("DmaRegistry")
            .field("live_buffers", &inner.entries.len())
            .field("live_bytes", &inner.live_bytes)
            .finish_non_exhaustive()
    }
}

impl DmaRegistry {
    /// Create a registry over the given platform allocator.
    #[must_use]
    pub fn new(allocator: Box<dyn CmaAllocator>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                allocator,
                entries: HashMap::new(),
                next_id: 1,
                live_bytes: 0,
            })),
        }
    }

    /// Allocate `size` bytes of DMA-capable memory and register the result.
    ///
    /// The grant is page rounded; `len()` on the returned buffer reports the
    /// requested size. `cacheable` is carried as allocation metadata (the
    /// pool decides actual cache policy at map time).
    ///
    /// # Errors
    ///
    /// [`DriverError::AllocationFailed`] when the pool cannot fit the
    /// request — including the resolution-failure path inside the
    /// allocator, which releases the partial grant before reporting.
    pub fn allocate(&self, size: usize, cacheable: bool) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(DriverError::allocation_failed(0, "zero-size allocation"));
        }

        let mut inner = self.inner.lock().unwrap();
        let region = inner.allocator.alloc(size)?;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live_bytes += region.len() as u64;
        inner.entries.insert(
            id,
            Entry {
                phys: region.phys(),
                len: region.len(),
            },
        );

        tracing::debug!(
            "DMA alloc id={id}: {size} bytes ({} granted) at {}",
            region.len(),
            region.phys()
        );

        Ok(DmaBuffer {
            id,
            region: Some(region),
            len: size,
            cacheable,
            shared: Arc::clone(&self.inner),
        })
    }

    /// Bus address registered for `id`.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotFound`] once the buffer has been dropped, or for
    /// an id from another registry.
    pub fn resolve_physical(&self, id: BufferId) -> Result<PhysAddr> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&id.0)
            .map(|e| e.phys)
            .ok_or(DriverError::NotFound { id: id.0 })
    }

    /// Bytes currently granted to live buffers (page rounded).
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.inner.lock().unwrap().live_bytes
    }

    /// Number of live buffers.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Drop for DmaRegistry {
    fn drop(&mut self) {
        let Ok(inner) = self.inner.lock() else {
            return;
        };
        if !inner.entries.is_empty() {
            tracing::warn!(
                "DMA memory not freed before registry teardown: {} buffers, {} bytes — \
                 memory returns to the pool when the handles drop",
                inner.entries.len(),
                inner.live_bytes
            );
        }
    }
}

/// One live DMA allocation.
///
/// Owns its extent: dropping the buffer unregisters it and returns the
/// memory to the pool. Slice access covers the requested length; the page
/// padding beyond it belongs to the grant but is not exposed.
pub struct DmaBuffer {
    id: u64,
    /// Invariant: `Some` until `Drop` takes it.
    region: Option<DmaRegion>,
    len: usize,
    cacheable: bool,
    shared: Arc<Mutex<RegistryInner>>,
}

// SAFETY: Send - the buffer owns its extent exclusively; the registry Arc
// it carries is itself Send+Sync, and the pointer stays valid wherever the
// buffer moves.
unsafe impl Send for DmaBuffer {}

// SAFETY: Sync - reads go through &self, writes require &mut self, so the
// usual exclusive-reference rules protect the extent.
unsafe impl Sync for DmaBuffer {}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("phys", &self.region().phys())
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

impl DmaBuffer {
    fn region(&self) -> &DmaRegion {
        self.region.as_ref().expect("region lives until drop")
    }

    /// Registry handle for this buffer.
    #[must_use]
    pub const fn id(&self) -> BufferId {
        BufferId(self.id)
    }

    /// Bus address of the first byte.
    #[must_use]
    pub fn phys(&self) -> PhysAddr {
        self.region().phys()
    }

    /// Requested length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for an empty buffer (never produced by `allocate`).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the allocation was requested cacheable.
    #[must_use]
    pub const fn cacheable(&self) -> bool {
        self.cacheable
    }

    /// Byte view of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: (1) ptr valid for the granted length, of which len is a
        // prefix; (2) &self excludes concurrent mutation through this
        // handle; (3) extent is private to this buffer until drop.
        unsafe { std::slice::from_raw_parts(self.region().ptr.as_ptr(), self.len) }
    }

    /// Mutable byte view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.region().ptr.as_ptr();
        // SAFETY: (1) ptr valid for len bytes; (2) &mut self gives
        // exclusive access; (3) no other safe path aliases the extent.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.len) }
    }

    /// u32 view of the buffer (length and score arrays).
    ///
    /// # Panics
    ///
    /// Panics if the buffer length is not a multiple of four. Grants are
    /// page aligned, so alignment always holds.
    #[must_use]
    pub fn as_u32_slice(&self) -> &[u32] {
        bytemuck::cast_slice(self.as_slice())
    }

    /// Mutable u32 view of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer length is not a multiple of four.
    pub fn as_u32_slice_mut(&mut self) -> &mut [u32] {
        bytemuck::cast_slice_mut(self.as_mut_slice())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let Some(region) = self.region.take() else {
            return;
        };
        // Keep freeing even if a holder of the registry lock panicked.
        let mut inner = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = inner.entries.remove(&self.id) {
            inner.live_bytes -= entry.len as u64;
            tracing::debug!("DMA free id={}: {} bytes at {}", self.id, entry.len, entry.phys);
        } else {
            // Double release cannot happen through handles; tolerate and
            // log in case an entry was externally purged.
            tracing::debug!("DMA free id={}: no registry entry", self.id);
        }
        inner.allocator.free(region);
    }
}

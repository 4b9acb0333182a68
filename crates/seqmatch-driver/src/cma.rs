//! Platform allocators for DMA-capable memory.
//!
//! The scan core addresses physical memory directly, so every job buffer
//! must come from a physically contiguous, pinned region whose bus address
//! is known. Two providers implement the same [`CmaAllocator`] seam:
//!
//! - [`UdmabufHeap`] — the real platform path: one kernel-reserved pool
//!   (u-dma-buf style device node plus a sysfs `phys_addr` attribute),
//!   mapped once and carved into page-granular extents.
//! - [`VirtCma`] — a host-memory arena with a synthetic bus base, used by
//!   the virtual device and every test that needs DMA semantics without
//!   hardware.
//!
//! Both carve with the same first-fit extent allocator, so allocation
//! behaviour in CI matches the board.

#![allow(clippy::cast_possible_truncation)]

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use rustix::fs::OFlags;
use rustix::mm::{mlock, mmap, munlock, munmap, MapFlags, ProtFlags};

use crate::error::{DriverError, Result};
use seqmatch_hw::addr::PhysAddr;

/// Allocation granularity. CMA hands out whole pages; sub-page requests
/// round up.
pub const PAGE: usize = 4096;

/// Default pool device node on the reference platform.
pub const DEFAULT_POOL_DEVICE: &str = "/dev/udmabuf0";
/// Default sysfs attribute holding the pool's physical base.
pub const DEFAULT_POOL_PHYS_ATTR: &str = "/sys/class/u-dma-buf/udmabuf0/phys_addr";
/// Default sysfs attribute holding the pool size in bytes.
pub const DEFAULT_POOL_SIZE_ATTR: &str = "/sys/class/u-dma-buf/udmabuf0/size";

/// Synthetic bus base of the virtual arena. High enough to catch code that
/// confuses offsets with addresses.
pub const VIRT_PHYS_BASE: PhysAddr = PhysAddr::new(0x4000_0000);

/// One granted extent of DMA-capable memory.
///
/// Only allocators create these; the registry wraps them in RAII buffer
/// handles and eventually hands them back through [`CmaAllocator::free`].
#[derive(Debug)]
pub struct DmaRegion {
    pub(crate) ptr: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
}

impl DmaRegion {
    /// Bus address of the first byte.
    #[must_use]
    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Granted length in bytes (page rounded).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length grant (never produced by the allocators).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Provider of DMA-capable, physically resolved memory.
pub trait CmaAllocator: Send {
    /// Grant at least `size` bytes (rounded up to [`PAGE`]).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AllocationFailed`] when no extent fits.
    fn alloc(&mut self, size: usize) -> Result<DmaRegion>;

    /// Return a previously granted region to the pool.
    fn free(&mut self, region: DmaRegion);

    /// Total bytes this allocator manages.
    fn capacity(&self) -> usize;
}

/// First-fit free-extent list, offsets and lengths in bytes, always
/// page-multiples. Freed extents coalesce with their neighbours.
#[derive(Debug)]
struct Extents {
    /// (offset, len), sorted by offset, pairwise disjoint.
    free: Vec<(usize, usize)>,
}

impl Extents {
    fn new(total: usize) -> Self {
        Self {
            free: vec![(0, total)],
        }
    }

    fn alloc(&mut self, len: usize) -> Option<usize> {
        let slot = self.free.iter().position(|&(_, flen)| flen >= len)?;
        let (off, flen) = self.free[slot];
        if flen == len {
            self.free.remove(slot);
        } else {
            self.free[slot] = (off + len, flen - len);
        }
        Some(off)
    }

    fn free(&mut self, off: usize, len: usize) {
        let at = self
            .free
            .iter()
            .position(|&(foff, _)| foff > off)
            .unwrap_or(self.free.len());
        self.free.insert(at, (off, len));
        // Coalesce with the next extent, then the previous one.
        if at + 1 < self.free.len() && self.free[at].0 + self.free[at].1 == self.free[at + 1].0 {
            self.free[at].1 += self.free[at + 1].1;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].0 + self.free[at - 1].1 == self.free[at].0 {
            self.free[at - 1].1 += self.free[at].1;
            self.free.remove(at);
        }
    }

    fn largest(&self) -> usize {
        self.free.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }
}

const fn round_to_page(size: usize) -> usize {
    size.div_ceil(PAGE) * PAGE
}

// ---------------------------------------------------------------------------
// Virtual arena
// ---------------------------------------------------------------------------

/// Host-memory stand-in for the platform CMA region.
///
/// The arena is one page-aligned allocation. Addresses handed out are
/// `VIRT_PHYS_BASE + offset`; the virtual device translates them back when
/// it plays the accelerator's part.
///
/// Between start and done of an invocation the device side reads and writes
/// job buffers through raw pointers, exactly like real DMA. The driver-side
/// contract is the hardware one: software must not touch a job's buffers
/// while that job is in flight.
#[derive(Debug)]
pub struct VirtArena {
    base: PhysAddr,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: Send - the arena owns its allocation exclusively; the pointer is
// valid process-wide and freed exactly once in Drop.
unsafe impl Send for VirtArena {}

// SAFETY: Sync - all access goes through raw pointer reads/writes on
// disjoint granted extents. The in-flight contract (device owns a job's
// buffers between start and done) rules out overlapping access, matching
// the aliasing rules real DMA hardware imposes.
unsafe impl Sync for VirtArena {}

impl VirtArena {
    fn new(len: usize) -> Result<Arc<Self>> {
        let layout = std::alloc::Layout::from_size_align(len, PAGE)
            .map_err(|e| DriverError::allocation_failed(len, format!("bad arena layout: {e}")))?;

        // SAFETY: alloc_zeroed for the page-aligned arena backing store.
        // Invariants: (1) layout from from_size_align, len > 0 checked by
        // caller, PAGE is a power of two; (2) result valid for len bytes or
        // null; (3) dealloc in Drop with the same layout.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DriverError::allocation_failed(len, "arena allocation failed"));
        }

        tracing::debug!("Virtual CMA arena: {len:#x} bytes at synthetic base {VIRT_PHYS_BASE}");

        Ok(Arc::new(Self {
            base: VIRT_PHYS_BASE,
            ptr,
            len,
        }))
    }

    /// Synthetic bus base of the arena.
    #[must_use]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Arena capacity in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-capacity arena.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset_of(&self, phys: PhysAddr, len: usize) -> Option<usize> {
        let off = phys.get().checked_sub(self.base.get())? as usize;
        (off.checked_add(len)? <= self.len).then_some(off)
    }

    /// Device-side read of `dst.len()` bytes at `phys`. False when the
    /// address range falls outside the arena (a misprogrammed pointer).
    pub(crate) fn read_into(&self, phys: PhysAddr, dst: &mut [u8]) -> bool {
        let Some(off) = self.offset_of(phys, dst.len()) else {
            return false;
        };
        // SAFETY: raw copy in place of a DMA read. Invariants: (1) ptr valid
        // for len bytes for the arena's lifetime; (2) off + dst.len() <= len
        // checked above; (3) dst is a local buffer, so the ranges cannot
        // overlap; (4) the in-flight contract keeps software off this range.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(off), dst.as_mut_ptr(), dst.len());
        }
        true
    }

    /// Device-side u32 read at `phys`.
    pub(crate) fn read_u32(&self, phys: PhysAddr) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read_into(phys, &mut bytes).then(|| u32::from_le_bytes(bytes))
    }

    /// Device-side u32 write at `phys`. False outside the arena.
    pub(crate) fn write_u32(&self, phys: PhysAddr, value: u32) -> bool {
        let Some(off) = self.offset_of(phys, 4) else {
            return false;
        };
        let bytes = value.to_le_bytes();
        // SAFETY: raw copy in place of a DMA write; same invariants as
        // read_into, with src a local array.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(off), 4);
        }
        true
    }
}

impl Drop for VirtArena {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.len, PAGE)
            .expect("layout valid: checked in new()");
        // SAFETY: dealloc pairs the alloc_zeroed in new(). Invariants:
        // (1) ptr from alloc_zeroed with this layout; (2) Drop runs at most
        // once; (3) extents into the arena never outlive the Arc.
        unsafe { std::alloc::dealloc(self.ptr, layout) };
    }
}

/// Allocator over a [`VirtArena`].
#[derive(Debug)]
pub struct VirtCma {
    arena: Arc<VirtArena>,
    extents: Extents,
}

impl VirtCma {
    /// Create an arena of `capacity` bytes (rounded up to [`PAGE`]).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AllocationFailed`] when the host cannot back
    /// the arena or `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DriverError::allocation_failed(0, "zero-capacity arena"));
        }
        let total = round_to_page(capacity);
        Ok(Self {
            arena: VirtArena::new(total)?,
            extents: Extents::new(total),
        })
    }

    /// Shared handle to the backing arena, for wiring up a virtual device.
    #[must_use]
    pub fn arena(&self) -> Arc<VirtArena> {
        Arc::clone(&self.arena)
    }
}

impl CmaAllocator for VirtCma {
    fn alloc(&mut self, size: usize) -> Result<DmaRegion> {
        let len = round_to_page(size.max(1));
        let off = self.extents.alloc(len).ok_or_else(|| {
            DriverError::allocation_failed(
                size,
                format!("arena exhausted (largest free extent {} bytes)", self.extents.largest()),
            )
        })?;
        // SAFETY: arena ptr is non-null and off < arena len, so the sum is
        // a valid in-allocation pointer.
        let ptr = unsafe { NonNull::new_unchecked(self.arena.ptr.add(off)) };
        Ok(DmaRegion {
            ptr,
            phys: self.arena.base.offset(off as u64),
            len,
        })
    }

    fn free(&mut self, region: DmaRegion) {
        let off = (region.phys.get() - self.arena.base.get()) as usize;
        self.extents.free(off, region.len);
    }

    fn capacity(&self) -> usize {
        self.arena.len
    }
}

// ---------------------------------------------------------------------------
// Real pool
// ---------------------------------------------------------------------------

/// The platform's reserved DMA pool, mapped once and carved into extents.
///
/// The kernel reserves one physically contiguous block at boot and exposes
/// it as a mappable device node plus sysfs attributes for its bus address
/// and size (u-dma-buf convention). Everything the registry allocates is a
/// slice of that block, so physical resolution is plain offset arithmetic —
/// no per-allocation kernel round trip.
#[derive(Debug)]
pub struct UdmabufHeap {
    ptr: *mut u8,
    len: usize,
    phys: PhysAddr,
    extents: Extents,
}

// SAFETY: Send - the heap owns its mapping exclusively; moving it between
// threads does not invalidate the mapping, and Drop unmaps exactly once.
unsafe impl Send for UdmabufHeap {}

impl UdmabufHeap {
    /// Map the pool described by a device node and its sysfs attributes.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OpenFailed`] when the node or attributes are
    /// missing and [`DriverError::MappingFailed`] when the mapping itself
    /// fails.
    pub fn open(device: &Path, phys_attr: &Path, size_attr: &Path) -> Result<Self> {
        let phys = PhysAddr::new(read_sysfs_hex(phys_attr)?);
        let len = read_sysfs_dec(size_attr)? as usize;

        let sync_flag = OFlags::SYNC.bits() as i32;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag)
            .open(device)
            .map_err(|e| DriverError::open_failed(device, e))?;

        // SAFETY: mmap of the whole pool. Invariants: (1) fd valid from the
        // open above; (2) the kernel driver backs exactly len bytes at
        // offset 0; (3) SHARED mapping so device-visible memory and our
        // view are the same pages; (4) munmap in Drop with the same
        // ptr/len.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| DriverError::mapping_failed(phys.get(), len, e.to_string()))?
        };

        // SAFETY: mlock pins the pool so pages stay resident while the core
        // is scanning. Invariants: (1) ptr from the successful mmap above;
        // (2) len matches the mapping.
        if let Err(e) = unsafe { mlock(ptr, len) } {
            // SAFETY: cleanup of the mapping created above; nothing else
            // references it yet.
            unsafe {
                let _ = munmap(ptr, len);
            }
            return Err(DriverError::mapping_failed(
                phys.get(),
                len,
                format!("mlock failed: {e}"),
            ));
        }

        tracing::info!("Mapped DMA pool: {len:#x} bytes at {phys}");

        Ok(Self {
            ptr: ptr.cast(),
            len,
            phys,
            extents: Extents::new(len),
        })
    }

    /// Map the pool at the platform default paths.
    ///
    /// # Errors
    ///
    /// Same as [`UdmabufHeap::open`].
    pub fn open_default() -> Result<Self> {
        Self::open(
            Path::new(DEFAULT_POOL_DEVICE),
            Path::new(DEFAULT_POOL_PHYS_ATTR),
            Path::new(DEFAULT_POOL_SIZE_ATTR),
        )
    }
}

impl CmaAllocator for UdmabufHeap {
    fn alloc(&mut self, size: usize) -> Result<DmaRegion> {
        let len = round_to_page(size.max(1));
        let off = self.extents.alloc(len).ok_or_else(|| {
            DriverError::allocation_failed(
                size,
                format!("pool exhausted (largest free extent {} bytes)", self.extents.largest()),
            )
        })?;
        // SAFETY: pool ptr is non-null (mmap succeeded) and off < pool len.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.add(off)) };
        Ok(DmaRegion {
            ptr,
            phys: self.phys.offset(off as u64),
            len,
        })
    }

    fn free(&mut self, region: DmaRegion) {
        let off = (region.phys.get() - self.phys.get()) as usize;
        self.extents.free(off, region.len);
    }

    fn capacity(&self) -> usize {
        self.len
    }
}

impl Drop for UdmabufHeap {
    fn drop(&mut self) {
        // SAFETY: ptr/len from the successful mmap+mlock in open(); Drop
        // runs at most once and no extents outlive the registry that owns
        // this allocator.
        unsafe {
            let _ = munlock(self.ptr.cast(), self.len);
            let _ = munmap(self.ptr.cast(), self.len);
        }
        tracing::debug!("Unmapped DMA pool at {}", self.phys);
    }
}

fn read_sysfs_hex(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path).map_err(|e| DriverError::open_failed(path, e))?;
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|e| {
        DriverError::open_failed(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad hex value: {e}")),
        )
    })
}

fn read_sysfs_dec(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path).map_err(|e| DriverError::open_failed(path, e))?;
    text.trim().parse().map_err(|e| {
        DriverError::open_failed(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad decimal value: {e}")),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extents_first_fit_and_coalesce() {
        let mut e = Extents::new(8 * PAGE);
        let a = e.alloc(2 * PAGE).unwrap();
        let b = e.alloc(PAGE).unwrap();
        let c = e.alloc(3 * PAGE).unwrap();
        assert_eq!((a, b, c), (0, 2 * PAGE, 3 * PAGE));

        // Free the middle, then its neighbours; everything must merge back.
        e.free(b, PAGE);
        e.free(a, 2 * PAGE);
        e.free(c, 3 * PAGE);
        assert_eq!(e.largest(), 8 * PAGE);
        let d = e.alloc(8 * PAGE).unwrap();
        assert_eq!(d, 0);
    }

    #[test]
    fn extents_reuse_freed_hole() {
        let mut e = Extents::new(4 * PAGE);
        let a = e.alloc(PAGE).unwrap();
        let _b = e.alloc(PAGE).unwrap();
        e.free(a, PAGE);
        // First fit lands back in the hole.
        assert_eq!(e.alloc(PAGE).unwrap(), a);
    }

    #[test]
    fn virt_alloc_addresses_are_arena_relative() {
        let mut cma = VirtCma::new(16 * PAGE).unwrap();
        let r1 = cma.alloc(100).unwrap();
        let r2 = cma.alloc(PAGE + 1).unwrap();
        assert_eq!(r1.phys(), VIRT_PHYS_BASE);
        assert_eq!(r1.len(), PAGE);
        assert_eq!(r2.phys(), VIRT_PHYS_BASE.offset(PAGE as u64));
        assert_eq!(r2.len(), 2 * PAGE);
    }

    #[test]
    fn virt_exhaustion_is_an_error() {
        let mut cma = VirtCma::new(2 * PAGE).unwrap();
        let _keep = cma.alloc(2 * PAGE).unwrap();
        let err = cma.alloc(1).unwrap_err();
        assert!(matches!(err, DriverError::AllocationFailed { .. }));
    }

    #[test]
    fn arena_device_side_access_round_trips() {
        let cma = VirtCma::new(4 * PAGE).unwrap();
        let arena = cma.arena();
        assert!(arena.write_u32(VIRT_PHYS_BASE.offset(8), 0xDEAD_BEEF));
        assert_eq!(arena.read_u32(VIRT_PHYS_BASE.offset(8)), Some(0xDEAD_BEEF));
        // Out-of-arena pointers are refused, not wrapped.
        assert_eq!(arena.read_u32(PhysAddr::new(0x1000)), None);
        assert!(!arena.write_u32(VIRT_PHYS_BASE.offset(4 * PAGE as u64), 1));
    }
}

//! Memory-mapped register access.
//!
//! The scan core's AXI-Lite window is mapped through `/dev/mem` at its
//! physical base. [`RegisterBlock`] is the seam between "who programs the
//! registers" and "where the registers live": the real window and the
//! virtual device's register file implement the same trait, so the command
//! channel and the direct programming path run unchanged against either.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::Path;

use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{DriverError, Result};
use seqmatch_hw::addr::PhysAddr;

/// 32-bit register window.
///
/// Writes take `&self`: MMIO side effects happen in the device, not in
/// Rust-visible memory, and the implementations are inherently shared
/// (volatile pointer, mutex-guarded word file).
pub trait RegisterBlock {
    /// Read the 32-bit register at byte `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit register at byte `offset`.
    fn write32(&self, offset: usize, value: u32);
}

/// The core's register window mapped into this process.
pub struct MmioRegion {
    /// Memory-mapped pointer
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Physical base the window was mapped at
    base: PhysAddr,
}

impl std::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("base", &self.base)
            .finish()
    }
}

// SAFETY: Send - MmioRegion owns the mapping exclusively. Moving between
// threads doesn't invalidate it (mmap'd memory is process-wide).
unsafe impl Send for MmioRegion {}

// SAFETY: Sync - accesses are bounds-checked volatile word operations;
// concurrent register access is the hardware's concurrency model, and the
// session layer serializes job programming above this type.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Map the register window at `base` via `/dev/mem`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OpenFailed`] when `/dev/mem` is not
    /// accessible (needs root or a devmem group) and
    /// [`DriverError::MappingFailed`] when the mapping itself fails.
    pub fn map(base: PhysAddr, size: usize) -> Result<Self> {
        Self::map_path(Path::new("/dev/mem"), base, size)
    }

    /// Map a register window from an arbitrary file at byte offset
    /// `base.get()`. The `/dev/mem` path in production; a plain file in
    /// tests.
    ///
    /// # Errors
    ///
    /// Same as [`MmioRegion::map`].
    pub fn map_path(path: &Path, base: PhysAddr, size: usize) -> Result<Self> {
        let sync_flag = OFlags::SYNC.bits() as i32;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag) // uncached register access
            .open(path)
            .map_err(|e| DriverError::open_failed(path, e))?;

        // SAFETY: mmap of the register window. Invariants: (1) fd valid
        // from the open above; (2) offset is the page-aligned physical
        // base; (3) SHARED mapping so stores reach the device; (4) ptr
        // valid for size bytes on success; (5) munmap in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                base.get(),
            )
            .map_err(|e| DriverError::mapping_failed(base.get(), size, e.to_string()))?
        };

        tracing::info!("Mapped register window at {base}, size={size:#x}");

        Ok(Self {
            ptr: ptr.cast(),
            size,
            base,
        })
    }

    /// Physical base the window was mapped at.
    #[must_use]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Size of the mapping in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl RegisterBlock for MmioRegion {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change the
        // value. Invariants: (1) ptr from mmap in map_path(), valid for
        // self.size; (2) offset+4 <= size; (3) u32 aligned (AXI-Lite word
        // offsets).
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side
        // effects. Invariants: (1) ptr from mmap; (2) offset+4 <= size;
        // (3) u32 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // SAFETY: munmap pairs the mmap in map_path(); ptr/size unchanged
        // since mapping; Drop runs at most once.
        unsafe {
            // Ignore error in Drop (can't propagate, would need to log)
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped register window at {}", self.base);
    }
}

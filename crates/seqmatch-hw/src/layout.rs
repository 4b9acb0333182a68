//! In-memory sequence layout the scan core expects.
//!
//! The core walks DMA memory with compiled-in strides: one byte per base at
//! a fixed per-sequence stride, u32 cells for lengths and scores. Offsets
//! into those arrays therefore translate to physical addresses with the two
//! helpers below; both the kernel channel and the direct MMIO path use them
//! so a chunk means the same bytes everywhere.

use crate::addr::PhysAddr;

/// Longest sequence the synthesized core accepts, and the per-sequence
/// stride of every sequence array. Compiled into the bitstream.
pub const MAX_SEQ_LENGTH: usize = 360;

/// Longest description line retained per record. Descriptions are host-side
/// metadata only; the core never sees them.
pub const MAX_DESCRIPTION_LENGTH: usize = 724;

/// Bytes per length/score cell.
pub const CELL_BYTES: usize = 4;

/// Fill value for score cells before an invocation. Cells still holding it
/// after a sweep were never written by the core.
pub const SCORE_SENTINEL: u32 = 27334;

/// Address of sequence `index` in an array based at `base`.
#[must_use]
pub const fn seq_ptr(base: PhysAddr, index: u32, max_seq_len: u32) -> PhysAddr {
    base.offset(index as u64 * max_seq_len as u64)
}

/// Address of u32 cell `index` in an array based at `base`.
#[must_use]
pub const fn cell_ptr(base: PhysAddr, index: u32) -> PhysAddr {
    base.offset(index as u64 * CELL_BYTES as u64)
}

/// Two-bit code the comparator reduces a base symbol to.
///
/// The core compares ASCII bits 1..3, which distinguish A/C/G/T without a
/// lookup table. Other symbols alias onto those four codes exactly as the
/// hardware aliases them.
#[must_use]
pub const fn base_code(symbol: u8) -> u8 {
    (symbol >> 1) & 0b11
}

//! Job bindings and direct register-path programming.
//!
//! A [`JobBinding`] pins down where a sweep's five DMA arrays live in
//! physical memory, resolved once through the registry so a stale buffer id
//! fails loudly before any register is touched. Per-chunk messages are then
//! pure address arithmetic over the bound bases.
//!
//! The free functions at the bottom are the direct MMIO path: the same
//! twelve-register programming the kernel channel does, for sessions bound
//! to a `/dev/mem` window instead of the character device.

use crate::channel;
use crate::dma::{BufferId, DmaRegistry};
use crate::error::Result;
use crate::mmio::RegisterBlock;
use seqmatch_hw::addr::PhysAddr;
use seqmatch_hw::layout::{cell_ptr, seq_ptr};
use seqmatch_hw::message::{CommandMessage, WaitMode};
use seqmatch_hw::plan::ChunkDescriptor;
use seqmatch_hw::regs::{self, control};

/// Physical bases of the five arrays a sweep runs over.
///
/// Construction resolves every id through the registry, so holding a
/// `JobBinding` means the addresses were valid at bind time. The buffers
/// themselves stay alive through their RAII handles; the binding only
/// carries addresses.
#[derive(Debug, Clone, Copy)]
pub struct JobBinding {
    target_seq: PhysAddr,
    target_len: PhysAddr,
    query_seq: PhysAddr,
    query_len: PhysAddr,
    output: PhysAddr,
    max_seq_len: u32,
}

impl JobBinding {
    /// Resolve the five buffer ids into a binding.
    ///
    /// `max_seq_len` is the per-sequence stride of both sequence arrays,
    /// normally [`seqmatch_hw::layout::MAX_SEQ_LENGTH`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DriverError::NotFound`] if any id has been
    /// freed or belongs to another registry.
    pub fn new(
        registry: &DmaRegistry,
        target_seq: BufferId,
        target_len: BufferId,
        query_seq: BufferId,
        query_len: BufferId,
        output: BufferId,
        max_seq_len: u32,
    ) -> Result<Self> {
        Ok(Self {
            target_seq: registry.resolve_physical(target_seq)?,
            target_len: registry.resolve_physical(target_len)?,
            query_seq: registry.resolve_physical(query_seq)?,
            query_len: registry.resolve_physical(query_len)?,
            output: registry.resolve_physical(output)?,
            max_seq_len,
        })
    }

    /// Physical base of the score output array.
    #[must_use]
    pub const fn output(&self) -> PhysAddr {
        self.output
    }

    /// Command message for one chunk of the sweep.
    ///
    /// Sequence pointers advance by whole strides, length pointers by u32
    /// cells. The output pointer is always the array base: chunks overwrite
    /// each other there, and the caller snapshots scores between runs when
    /// it wants them.
    #[must_use]
    pub fn chunk_message(&self, chunk: &ChunkDescriptor, wait_mode: WaitMode) -> CommandMessage {
        CommandMessage {
            target_seq: seq_ptr(self.target_seq, chunk.target_offset, self.max_seq_len),
            query_seq: seq_ptr(self.query_seq, chunk.query_offset, self.max_seq_len),
            target_count: chunk.target_count,
            query_count: chunk.query_count,
            target_len: cell_ptr(self.target_len, chunk.target_offset),
            query_len: cell_ptr(self.query_len, chunk.query_offset),
            output: self.output,
            wait_mode,
        }
    }
}

/// Program the twelve job registers from a message.
pub fn program(block: &impl RegisterBlock, msg: &CommandMessage) {
    for (offset, value) in msg.register_values() {
        block.write32(offset, value);
    }
}

/// Set START, preserving the rest of the control register.
pub fn start(block: &impl RegisterBlock) {
    let ctrl = block.read32(regs::CONTROL);
    block.write32(regs::CONTROL, ctrl | control::START);
}

/// Poll until the core raises DONE.
///
/// # Errors
///
/// Returns [`crate::error::DriverError::Timeout`] when the poll budget
/// runs out.
pub fn wait_done(block: &impl RegisterBlock) -> Result<()> {
    channel::poll_done(block)
}

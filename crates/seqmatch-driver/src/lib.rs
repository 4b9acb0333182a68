//! Pure Rust driver for the ZCU104 sequence-scan accelerator.
//!
//! This crate is the full userspace stack for the FPGA scan core: DMA
//! staging, transport, command protocol and measured sweeps. No vendor
//! runtime, no generated HAL.
//!
//! # Transport hierarchy
//!
//! ```text
//! One per session:
//!   KernelDevice — /dev/seqmatch0 write/read (interrupt completion)
//!   Mmio         — /dev/mem register window  (polling only)
//!
//! Development:
//!   VirtDevice   — in-process core model behind the same channel
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use seqmatch_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let (registry, _core, channel) = seqmatch_driver::virt::virtual_setup(64 << 20)?;
//! let mut session = AcceleratorSession::new();
//! session.open_command_device(Box::new(channel))?;
//!
//! let stride = seqmatch_driver::hw::layout::MAX_SEQ_LENGTH;
//! let targets = load_sequences(&registry, "targets.fq".as_ref(), stride)?;
//! let queries = load_sequences(&registry, "queries.fq".as_ref(), stride)?;
//!
//! let mut meter = ConstantMeter::from_watts(5.0);
//! let outcome = run_sweep(
//!     &mut session,
//!     &registry,
//!     &mut meter,
//!     &targets,
//!     &queries,
//!     &SweepConfig::default(),
//! )?;
//! println!("{:?} per sweep, {:.6} J", outcome.sweep_duration, outcome.joules);
//! # Ok(())
//! # }
//! ```
//!
//! # Platform
//!
//! | Item | Value |
//! |------|-------|
//! | Board | ZCU104 (Zynq UltraScale+ XCZU7EV) |
//! | Register window | 64 KiB AXI-Lite at `0xA000_0000` |
//! | Completion IRQ | PL-PS line 56 |
//! | Sequence stride | 360 bases, compiled into the core |
//! | DMA pool | udmabuf CMA region |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod channel;
pub mod cma;
mod device;
mod dma;
mod error;
mod job;
pub mod mmio;
pub mod power;
mod seqio;
mod session;
pub mod sweep;
pub mod virt;

/// Register map, wire format and planning (re-exported from seqmatch-hw).
pub mod hw {
    pub use seqmatch_hw::{addr, layout, message, plan, regs};
}

pub use channel::{CompletionGate, KernelChannel};
pub use device::{CharDevice, CommandDevice, DEFAULT_DEVICE_PATH};
pub use dma::{BufferId, DmaBuffer, DmaRegistry};
pub use error::{DriverError, Result};
pub use job::JobBinding;
pub use mmio::{MmioRegion, RegisterBlock};
pub use power::{ConstantMeter, HwmonMeter, PowerMeter, PowerSample};
pub use seqio::{load_sequences, SequenceSet};
pub use session::{AcceleratorSession, TransportMode};
pub use sweep::{run_sweep, SweepConfig, SweepOutcome};
pub use virt::{VirtDevice, VirtRegisterFile};

pub use seqmatch_hw::addr::PhysAddr;
pub use seqmatch_hw::message::{CommandMessage, WaitMode};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        load_sequences, run_sweep, AcceleratorSession, BufferId, CommandMessage, ConstantMeter,
        DmaBuffer, DmaRegistry, DriverError, HwmonMeter, JobBinding, PhysAddr, PowerMeter, Result,
        SequenceSet, SweepConfig, SweepOutcome, TransportMode, WaitMode,
    };
}

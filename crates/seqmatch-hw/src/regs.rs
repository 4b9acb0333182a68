//! AXI-Lite register map of the scan core.
//!
//! The overlay exposes one 64 KiB register window. The first four words are
//! the standard block-level control/interrupt group; the rest are the job
//! registers the host programs before each invocation. Gaps between job
//! registers are reserved words the HLS flow inserts after each 64-bit
//! argument.

use crate::addr::PhysAddr;

/// Default physical base of the register window on the reference platform.
pub const DEFAULT_BASE: PhysAddr = PhysAddr::new(0xA000_0000);

/// Size of the mapped register window in bytes.
pub const WINDOW_SIZE: usize = 0x1_0000;

/// Interrupt line the core is wired to on the reference platform.
pub const IRQ_LINE: u32 = 56;

/// Block control register (start/done handshake).
pub const CONTROL: usize = 0x00;
/// Global interrupt enable.
pub const GIER: usize = 0x04;
/// Per-channel interrupt enable.
pub const IER: usize = 0x08;
/// Interrupt status — toggle-on-write acknowledge.
pub const ISR: usize = 0x0C;
/// Target sequence array pointer, low half.
pub const TARGET_PTR_LO: usize = 0x10;
/// Target sequence array pointer, high half.
pub const TARGET_PTR_HI: usize = 0x14;
/// Number of target sequences in this invocation.
pub const TARGET_COUNT: usize = 0x1C;
/// Target length array pointer, low half.
pub const TARGET_LEN_LO: usize = 0x24;
/// Target length array pointer, high half.
pub const TARGET_LEN_HI: usize = 0x28;
/// Query sequence array pointer, low half.
pub const QUERY_PTR_LO: usize = 0x30;
/// Query sequence array pointer, high half.
pub const QUERY_PTR_HI: usize = 0x34;
/// Number of query sequences in this invocation.
pub const QUERY_COUNT: usize = 0x3C;
/// Query length array pointer, low half.
pub const QUERY_LEN_LO: usize = 0x44;
/// Query length array pointer, high half.
pub const QUERY_LEN_HI: usize = 0x48;
/// Score output array pointer, low half.
pub const OUTPUT_PTR_LO: usize = 0x50;
/// Score output array pointer, high half.
pub const OUTPUT_PTR_HI: usize = 0x54;

/// Number of 32-bit words the register file occupies (through `OUTPUT_PTR_HI`).
pub const WORD_COUNT: usize = OUTPUT_PTR_HI / 4 + 1;

/// The twelve job registers in their canonical programming order.
///
/// Both the kernel channel and the direct MMIO path write the job registers
/// in exactly this order; keeping the sequence in one place keeps the two
/// paths bit-identical.
pub const PROGRAM_ORDER: [usize; 12] = [
    TARGET_PTR_LO,
    TARGET_PTR_HI,
    TARGET_COUNT,
    TARGET_LEN_LO,
    TARGET_LEN_HI,
    QUERY_PTR_LO,
    QUERY_PTR_HI,
    QUERY_COUNT,
    QUERY_LEN_LO,
    QUERY_LEN_HI,
    OUTPUT_PTR_LO,
    OUTPUT_PTR_HI,
];

/// Control register bit definitions.
pub mod control {
    /// Write 1 to launch an invocation (self-clearing once accepted).
    pub const START: u32 = 1 << 0;
    /// Set by hardware when an invocation completes. Read-only to software.
    pub const DONE: u32 = 1 << 1;
}

/// Interrupt register bit definitions.
pub mod irq {
    /// Enable bit used in both GIER and IER.
    pub const ENABLE: u32 = 1 << 0;
    /// ISR completion bit. Acknowledge by writing 1 (toggle-on-write).
    pub const DONE: u32 = 1 << 0;
}

//! Cross-boundary command message.
//!
//! One message carries everything the kernel channel needs to program an
//! invocation: the five buffer pointers, the two pair counts, and how the
//! trigger should wait for completion. The wire image is explicit
//! little-endian with fixed field offsets so the same bytes mean the same
//! thing to every producer, regardless of the language it is written in.
//!
//! ## Wire layout (56 bytes)
//!
//! | Offset | Field | Type |
//! |--------|-------|------|
//! | 0  | target sequence pointer | u64 |
//! | 8  | query sequence pointer | u64 |
//! | 16 | target count | u32 |
//! | 20 | query count | u32 |
//! | 24 | target length pointer | u64 |
//! | 32 | query length pointer | u64 |
//! | 40 | output pointer | u64 |
//! | 48 | wait mode | u32 |
//! | 52 | reserved | u32 |

use std::fmt;

use crate::addr::PhysAddr;
use crate::regs;

/// Size of the encoded message in bytes.
pub const WIRE_LEN: usize = 56;

/// Field byte offsets within the wire image.
pub mod field {
    /// Target sequence array pointer.
    pub const TARGET_SEQ: usize = 0;
    /// Query sequence array pointer.
    pub const QUERY_SEQ: usize = 8;
    /// Target count.
    pub const TARGET_COUNT: usize = 16;
    /// Query count.
    pub const QUERY_COUNT: usize = 20;
    /// Target length array pointer.
    pub const TARGET_LEN: usize = 24;
    /// Query length array pointer.
    pub const QUERY_LEN: usize = 32;
    /// Score output array pointer.
    pub const OUTPUT: usize = 40;
    /// Wait mode selector.
    pub const WAIT_MODE: usize = 48;
    /// Reserved tail word, always zero on encode.
    pub const RESERVED: usize = 52;
}

/// How a trigger waits for the invocation it just started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum WaitMode {
    /// Block until the completion interrupt is delivered.
    #[default]
    Interrupt = 0,
    /// Busy-poll the control register done bit.
    Polling = 1,
    /// Return immediately; the caller checks completion later.
    FireAndForget = 2,
}

impl WaitMode {
    /// Decode a wire selector.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Interrupt),
            1 => Some(Self::Polling),
            2 => Some(Self::FireAndForget),
            _ => None,
        }
    }

    /// The wire selector for this mode.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Why a wire image failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload shorter than [`WIRE_LEN`].
    TooShort {
        /// Bytes actually supplied.
        len: usize,
    },
    /// Wait-mode selector outside the defined set.
    BadWaitMode {
        /// Raw selector value.
        raw: u32,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => {
                write!(f, "command payload too short: {len} bytes, need {WIRE_LEN}")
            }
            Self::BadWaitMode { raw } => write!(f, "unknown wait mode selector {raw}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// One fully-specified accelerator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMessage {
    /// Target sequences, `max_seq_len`-byte stride.
    pub target_seq: PhysAddr,
    /// Query sequences, `max_seq_len`-byte stride.
    pub query_seq: PhysAddr,
    /// Target sequences in this invocation.
    pub target_count: u32,
    /// Query sequences in this invocation.
    pub query_count: u32,
    /// Target lengths, one u32 per sequence.
    pub target_len: PhysAddr,
    /// Query lengths, one u32 per sequence.
    pub query_len: PhysAddr,
    /// Score output, one u32 per (target, query) pair.
    pub output: PhysAddr,
    /// How the trigger waits for this invocation.
    pub wait_mode: WaitMode,
}

impl CommandMessage {
    /// Encode into the fixed wire image.
    #[must_use]
    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut buf = [0u8; WIRE_LEN];
        put_u64(&mut buf, field::TARGET_SEQ, self.target_seq.get());
        put_u64(&mut buf, field::QUERY_SEQ, self.query_seq.get());
        put_u32(&mut buf, field::TARGET_COUNT, self.target_count);
        put_u32(&mut buf, field::QUERY_COUNT, self.query_count);
        put_u64(&mut buf, field::TARGET_LEN, self.target_len.get());
        put_u64(&mut buf, field::QUERY_LEN, self.query_len.get());
        put_u64(&mut buf, field::OUTPUT, self.output.get());
        put_u32(&mut buf, field::WAIT_MODE, self.wait_mode.as_raw());
        buf
    }

    /// Decode the leading [`WIRE_LEN`] bytes of `payload`.
    ///
    /// Excess bytes are ignored — the boundary contract is "at least one
    /// message", mirroring the kernel's length check.
    ///
    /// # Errors
    ///
    /// [`DecodeError::TooShort`] if fewer than [`WIRE_LEN`] bytes are
    /// supplied, [`DecodeError::BadWaitMode`] for an undefined selector.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < WIRE_LEN {
            return Err(DecodeError::TooShort { len: payload.len() });
        }
        let raw_mode = get_u32(payload, field::WAIT_MODE);
        let wait_mode =
            WaitMode::from_raw(raw_mode).ok_or(DecodeError::BadWaitMode { raw: raw_mode })?;
        Ok(Self {
            target_seq: PhysAddr::new(get_u64(payload, field::TARGET_SEQ)),
            query_seq: PhysAddr::new(get_u64(payload, field::QUERY_SEQ)),
            target_count: get_u32(payload, field::TARGET_COUNT),
            query_count: get_u32(payload, field::QUERY_COUNT),
            target_len: PhysAddr::new(get_u64(payload, field::TARGET_LEN)),
            query_len: PhysAddr::new(get_u64(payload, field::QUERY_LEN)),
            output: PhysAddr::new(get_u64(payload, field::OUTPUT)),
            wait_mode,
        })
    }

    /// The twelve job register writes this message expands to, in canonical
    /// programming order ([`regs::PROGRAM_ORDER`]).
    #[must_use]
    pub fn register_values(&self) -> [(usize, u32); 12] {
        [
            (regs::TARGET_PTR_LO, self.target_seq.lo()),
            (regs::TARGET_PTR_HI, self.target_seq.hi()),
            (regs::TARGET_COUNT, self.target_count),
            (regs::TARGET_LEN_LO, self.target_len.lo()),
            (regs::TARGET_LEN_HI, self.target_len.hi()),
            (regs::QUERY_PTR_LO, self.query_seq.lo()),
            (regs::QUERY_PTR_HI, self.query_seq.hi()),
            (regs::QUERY_COUNT, self.query_count),
            (regs::QUERY_LEN_LO, self.query_len.lo()),
            (regs::QUERY_LEN_HI, self.query_len.hi()),
            (regs::OUTPUT_PTR_LO, self.output.lo()),
            (regs::OUTPUT_PTR_HI, self.output.hi()),
        ]
    }
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

//! Error types for seqmatch driver operations

use std::path::PathBuf;
use thiserror::Error;

use seqmatch_hw::message::{DecodeError, WIRE_LEN};
use seqmatch_hw::plan::PlanError;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur during driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Session already holds a transport
    #[error("Session already initialized ({transport} transport bound)")]
    AlreadyInitialized {
        /// Transport currently bound
        transport: String,
    },

    /// Operation requires a transport but the session is closed
    #[error("Session not initialized")]
    NotInitialized,

    /// Mapping a register window or DMA pool failed
    #[error("Failed to map {size:#x} bytes at {addr:#x}: {reason}")]
    MappingFailed {
        /// Physical base that was requested
        addr: u64,
        /// Mapping size in bytes
        size: usize,
        /// Underlying failure
        reason: String,
    },

    /// Buffer id not present in the registry
    #[error("DMA buffer id {id} not found (freed or foreign)")]
    NotFound {
        /// The stale id
        id: u64,
    },

    /// Opening a device node or support file failed
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        /// Path that was opened
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// DMA allocation failed
    #[error("DMA allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes
        size: usize,
        /// Reason for failure
        reason: String,
    },

    /// Sweep aborted before any register write: score buffer cannot fit
    #[error("Sweep needs {needed} bytes but budget is {budget}")]
    BudgetExceeded {
        /// Bytes the sweep needs at minimum
        needed: u64,
        /// Configured budget in bytes
        budget: u64,
    },

    /// Sweep over zero targets or zero queries
    #[error("Nothing to align: {target_count} targets x {query_count} queries")]
    EmptySweep {
        /// Requested target count
        target_count: u32,
        /// Requested query count
        query_count: u32,
    },

    /// Command payload below the fixed message size
    #[error("Command payload too short: {len} bytes, need {need}")]
    MessageTooShort {
        /// Bytes actually supplied
        len: usize,
        /// Bytes required
        need: usize,
    },

    /// Wait-mode selector outside the defined set
    #[error("Unknown wait mode selector {raw}")]
    InvalidWaitMode {
        /// Raw selector value
        raw: u32,
    },

    /// Completion wait or poll cap exhausted
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Time spent waiting in milliseconds
        duration_ms: u64,
    },

    /// Power telemetry read failed
    #[error("Telemetry read failed: {reason}")]
    Telemetry {
        /// Reason for failure
        reason: String,
    },

    /// Malformed sequence file
    #[error("Malformed sequence file {path}: {reason}")]
    SequenceFormat {
        /// File being parsed
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// I/O error outside the specific cases above
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl DriverError {
    /// Create an already-initialized error
    pub fn already_initialized(transport: impl Into<String>) -> Self {
        Self::AlreadyInitialized {
            transport: transport.into(),
        }
    }

    /// Create a mapping failed error
    pub fn mapping_failed(addr: u64, size: usize, reason: impl Into<String>) -> Self {
        Self::MappingFailed {
            addr,
            size,
            reason: reason.into(),
        }
    }

    /// Create an open failed error
    pub fn open_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::OpenFailed {
            path: path.into(),
            source,
        }
    }

    /// Create an allocation failed error
    pub fn allocation_failed(size: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            size,
            reason: reason.into(),
        }
    }

    /// Create a telemetry error
    pub fn telemetry(reason: impl Into<String>) -> Self {
        Self::Telemetry {
            reason: reason.into(),
        }
    }

    /// Create a sequence format error
    pub fn sequence_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SequenceFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<DecodeError> for DriverError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::TooShort { len } => Self::MessageTooShort {
                len,
                need: WIRE_LEN,
            },
            DecodeError::BadWaitMode { raw } => Self::InvalidWaitMode { raw },
        }
    }
}

impl From<PlanError> for DriverError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::BudgetExceeded { needed, budget } => {
                Self::BudgetExceeded { needed, budget }
            }
            PlanError::EmptyDimension {
                target_count,
                query_count,
            } => Self::EmptySweep {
                target_count,
                query_count,
            },
        }
    }
}

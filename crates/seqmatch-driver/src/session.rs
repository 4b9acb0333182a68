//! Accelerator session lifecycle.
//!
//! A session binds at most one transport to the scan core: either the
//! memory-mapped register window (bare-metal style, polling only) or a
//! command device (the kernel module's character device, or the virtual
//! accelerator). The two are mutually exclusive for the life of the
//! binding; `close` releases whichever is held and the session can then be
//! bound again.

use std::path::Path;

use crate::device::{CharDevice, CommandDevice};
use crate::error::{DriverError, Result};
use crate::job;
use crate::mmio::MmioRegion;
use seqmatch_hw::addr::PhysAddr;
use seqmatch_hw::message::{CommandMessage, WaitMode};
use seqmatch_hw::regs;

/// Which transport a session holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Direct register window via `/dev/mem`.
    Mmio,
    /// Kernel (or virtual) command device.
    KernelDevice,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mmio => write!(f, "MMIO"),
            Self::KernelDevice => write!(f, "kernel-device"),
        }
    }
}

enum Transport {
    Mmio(MmioRegion),
    Kernel(Box<dyn CommandDevice>),
    Closed,
}

impl Transport {
    const fn mode(&self) -> Option<TransportMode> {
        match self {
            Self::Mmio(_) => Some(TransportMode::Mmio),
            Self::Kernel(_) => Some(TransportMode::KernelDevice),
            Self::Closed => None,
        }
    }
}

/// Exclusive handle on the scan core through one transport.
pub struct AcceleratorSession {
    transport: Transport,
}

impl std::fmt::Debug for AcceleratorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorSession")
            .field("mode", &self.transport.mode())
            .finish()
    }
}

impl Default for AcceleratorSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorSession {
    /// Create an unbound session.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transport: Transport::Closed,
        }
    }

    fn reject_if_bound(&self) -> Result<()> {
        match self.transport.mode() {
            Some(mode) => Err(DriverError::already_initialized(mode.to_string())),
            None => Ok(()),
        }
    }

    /// Bind the session to the register window at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AlreadyInitialized`] if a transport is bound,
    /// otherwise the mapping errors of [`MmioRegion::map`].
    pub fn open_mmio(&mut self, base: PhysAddr, size: usize) -> Result<()> {
        self.reject_if_bound()?;
        let region = MmioRegion::map(base, size)?;
        self.transport = Transport::Mmio(region);
        tracing::info!("Session bound to MMIO transport at {base}");
        Ok(())
    }

    /// Bind to the register window at the platform's default base address.
    ///
    /// # Errors
    ///
    /// Same as [`AcceleratorSession::open_mmio`].
    pub fn open_mmio_default(&mut self) -> Result<()> {
        self.open_mmio(regs::DEFAULT_BASE, regs::WINDOW_SIZE)
    }

    /// Bind the session to the kernel module's character device.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AlreadyInitialized`] if a transport is bound,
    /// otherwise the open errors of [`CharDevice::open`].
    pub fn open_kernel_device(&mut self, path: &Path) -> Result<()> {
        self.reject_if_bound()?;
        let dev = CharDevice::open(path)?;
        self.transport = Transport::Kernel(Box::new(dev));
        tracing::info!("Session bound to kernel-device transport");
        Ok(())
    }

    /// Bind the session to any command device, typically the virtual
    /// accelerator's channel.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AlreadyInitialized`] if a transport is bound.
    pub fn open_command_device(&mut self, dev: Box<dyn CommandDevice>) -> Result<()> {
        self.reject_if_bound()?;
        self.transport = Transport::Kernel(dev);
        tracing::info!("Session bound to command-device transport");
        Ok(())
    }

    /// Release the bound transport. Safe to call on an unbound session.
    pub fn close(&mut self) {
        if let Some(mode) = self.transport.mode() {
            tracing::debug!("Session closed ({mode} transport released)");
        }
        self.transport = Transport::Closed;
    }

    /// Transport currently bound, if any.
    #[must_use]
    pub const fn mode(&self) -> Option<TransportMode> {
        self.transport.mode()
    }

    /// Whether a transport is bound.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.transport.mode().is_some()
    }

    /// The mapped register window, when the MMIO transport is bound.
    #[must_use]
    pub const fn registers(&self) -> Option<&MmioRegion> {
        match &self.transport {
            Transport::Mmio(region) => Some(region),
            _ => None,
        }
    }

    /// Run one job to completion (or to dispatch, for fire-and-forget).
    ///
    /// Kernel transport: the message is serialized through the two-call
    /// device protocol and the kernel side does the waiting. MMIO transport:
    /// the registers are programmed directly and completion is polled; there
    /// is no interrupt delivery on this path, so interrupt mode degrades to
    /// polling.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotInitialized`] on an unbound session, plus
    /// the transport's transfer and timeout errors.
    pub fn run_message(&mut self, msg: &CommandMessage) -> Result<()> {
        match &mut self.transport {
            Transport::Kernel(dev) => {
                dev.configure(&msg.encode())?;
                dev.trigger()
            }
            Transport::Mmio(region) => {
                job::program(region, msg);
                job::start(region);
                match msg.wait_mode {
                    WaitMode::FireAndForget => Ok(()),
                    WaitMode::Polling => job::wait_done(region),
                    WaitMode::Interrupt => {
                        tracing::debug!(
                            "No interrupt delivery on the MMIO path; polling for completion"
                        );
                        job::wait_done(region)
                    }
                }
            }
            Transport::Closed => Err(DriverError::NotInitialized),
        }
    }
}

impl Drop for AcceleratorSession {
    fn drop(&mut self) {
        self.close();
    }
}

//! Kernel command-device transport.
//!
//! The kernel module exposes the scan core as a character device with a
//! two-call protocol: `write(2)` hands it a serialized command message,
//! `read(2)` starts the programmed job and blocks until it completes (or
//! returns immediately in fire-and-forget mode). [`CommandDevice`] is the
//! trait form of that protocol; the in-process channel and the virtual
//! accelerator implement the same two calls.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{DriverError, Result};

/// Default character device node created by the kernel module.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/seqmatch0";

/// Two-call command protocol: configure, then trigger.
pub trait CommandDevice: Send {
    /// Hand the device a serialized command message.
    ///
    /// The device rejects payloads shorter than the fixed message length
    /// without touching any register.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is rejected or the transfer fails.
    fn configure(&mut self, payload: &[u8]) -> Result<()>;

    /// Start the configured job and wait for it according to the wait mode
    /// carried by the last configure call.
    ///
    /// # Errors
    ///
    /// Returns an error if the job could not be started or timed out.
    fn trigger(&mut self) -> Result<()>;
}

/// Character-device transport to the kernel module.
#[derive(Debug)]
pub struct CharDevice {
    /// Device node path, kept for logging
    path: PathBuf,
    /// Open device file
    file: File,
}

impl CharDevice {
    /// Open the command device at `path`.
    ///
    /// The file is opened blocking: the kernel's read handler sleeps until
    /// the job completes, which is exactly the wait we want.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::OpenFailed`] if the node is missing or not
    /// accessible.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DriverError::open_failed(
                path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DriverError::open_failed(path, e))?;

        tracing::info!("Opened command device {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open the default device node.
    ///
    /// # Errors
    ///
    /// Same as [`CharDevice::open`].
    pub fn open_default() -> Result<Self> {
        Self::open(Path::new(DEFAULT_DEVICE_PATH))
    }

    /// Device node path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandDevice for CharDevice {
    fn configure(&mut self, payload: &[u8]) -> Result<()> {
        let written =
            rustix::io::write(&self.file, payload).map_err(std::io::Error::from)?;
        if written != payload.len() {
            return Err(DriverError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write to command device: {written} of {} bytes", payload.len()),
                ),
            });
        }
        tracing::trace!("Configured job via {} ({written} bytes)", self.path.display());
        Ok(())
    }

    fn trigger(&mut self) -> Result<()> {
        // Zero-byte read: the kernel runs the job inside the read call and
        // returns when it is done (or immediately for fire-and-forget).
        let mut scratch = [0u8; 0];
        rustix::io::read(&self.file, &mut scratch[..]).map_err(std::io::Error::from)?;
        tracing::trace!("Triggered job via {}", self.path.display());
        Ok(())
    }
}

impl Drop for CharDevice {
    fn drop(&mut self) {
        tracing::debug!("Closing command device {}", self.path.display());
    }
}

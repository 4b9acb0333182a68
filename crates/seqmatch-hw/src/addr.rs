//! Physical address handling.
//!
//! The accelerator sees the world through 64-bit bus addresses programmed
//! into lo/hi register pairs. `PhysAddr` keeps those addresses out of the
//! general integer namespace: only allocators construct them, and the only
//! way back to raw halves is the explicit register split.

use std::fmt;

/// A physical (bus) address as programmed into the accelerator.
///
/// Opaque on purpose — arithmetic is limited to byte offsets so that a
/// virtual address or an array index cannot silently end up in a pointer
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wrap a raw bus address.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit bus address.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Low 32 bits, as written to a `*_LO` register.
    #[must_use]
    pub const fn lo(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.0 as u32
        }
    }

    /// High 32 bits, as written to a `*_HI` register.
    #[must_use]
    pub const fn hi(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 >> 32) as u32
        }
    }

    /// Address `bytes` past this one.
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lo_hi_split() {
        let a = PhysAddr::new(0x0000_0001_a000_0040);
        assert_eq!(a.lo(), 0xa000_0040);
        assert_eq!(a.hi(), 0x1);
    }

    #[test]
    fn offset_is_bytewise() {
        let a = PhysAddr::new(0xa000_0000);
        assert_eq!(a.offset(0x40).get(), 0xa000_0040);
    }
}

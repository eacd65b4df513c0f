//! Resource value objects with unit safety

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Bytes per megabyte as used by every limit in procgov (binary megabyte).
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Memory size value object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MemorySize(u64); // bytes

impl MemorySize {
    /// Zero bytes
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kilobytes
    #[must_use]
    pub const fn from_kb(kb: u64) -> Self {
        Self(kb.saturating_mul(1024))
    }

    /// Create from megabytes
    #[must_use]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb.saturating_mul(BYTES_PER_MB))
    }

    /// Get value in bytes
    #[must_use]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get value in megabytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_mb(self) -> f64 {
        self.0 as f64 / BYTES_PER_MB as f64
    }

    /// Whether this is zero bytes
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for MemorySize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MemorySize {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KB: u64 = 1024;

        if self.0 >= BYTES_PER_MB {
            write!(f, "{:.2} MB", self.as_mb())
        } else if self.0 >= KB {
            #[allow(clippy::cast_precision_loss)]
            let kb = self.0 as f64 / KB as f64;
            write!(f, "{kb:.2} KB")
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Cumulative storage I/O counters of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IoCounters {
    /// Bytes fetched from the storage layer
    pub read_bytes: u64,
    /// Bytes sent to the storage layer
    pub write_bytes: u64,
}

impl IoCounters {
    /// Create counters
    #[must_use]
    pub const fn new(read_bytes: u64, write_bytes: u64) -> Self {
        Self {
            read_bytes,
            write_bytes,
        }
    }

    /// Read plus write bytes
    #[must_use]
    pub const fn total(self) -> u64 {
        self.read_bytes.saturating_add(self.write_bytes)
    }

    /// Bytes transferred since `earlier`; counters that went backwards
    /// (pid reuse) count as zero.
    #[must_use]
    pub const fn delta_since(self, earlier: Self) -> u64 {
        self.total().saturating_sub(earlier.total())
    }
}

/// Set of logical cores a process may run on (bit `n` = core `n`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct AffinityMask(u64);

impl AffinityMask {
    /// Highest number of cores a mask can address
    pub const MAX_CORES: usize = 64;

    /// Create from raw bits
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether no core is selected
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of selected cores
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Indices of the selected cores, ascending
    pub fn cores(self) -> impl Iterator<Item = usize> {
        (0..Self::MAX_CORES).filter(move |core| self.0 & (1u64 << core) != 0)
    }
}

impl fmt::Display for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

//! WAL positions.
//!
//! An LSN is a 64-bit unsigned offset into the write-ahead log. On the wire
//! it travels as a `(hi, lo)` pair of 32-bit halves and is printed in the
//! PostgreSQL `H/L` hex notation (`0/1634FA0`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A log sequence number. Comparison is unsigned and monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(value: u64) -> Self {
        Lsn(value)
    }

    /// Rebuild from the wire's 32-bit halves.
    pub fn from_parts(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | lo as u64)
    }

    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The position just past this record. Used by the ack loop so the
    /// committed record is not replayed on reconnect.
    pub fn successor(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.hi(), self.lo())
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN format: {s}"))?;
        if lo.contains('/') {
            return Err(format!("invalid LSN format: {s}"));
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|e| format!("invalid LSN {s}: {e}"))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|e| format!("invalid LSN {s}: {e}"))?;
        Ok(Lsn::from_parts(hi, lo))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

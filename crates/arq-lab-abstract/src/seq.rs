//! Modular sequence-number space.
//!
//! Sessions count packets with absolute `u64` indices and only reduce them
//! when a number goes on the wire. Incoming wire numbers are mapped back to
//! an absolute index relative to a known base (`sendBase`, `rcvBase`,
//! `expSeq`), which keeps ordering intact across any number of wraps.

use serde::{Deserialize, Serialize};

/// Largest modulus the 16-bit header can represent.
pub const MAX_MODULUS: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqSpace {
    modulus: u32,
}

impl Default for SeqSpace {
    fn default() -> Self {
        Self {
            modulus: MAX_MODULUS,
        }
    }
}

impl SeqSpace {
    /// `modulus` must lie in `2..=65536`; `ArqConfig::validate` enforces it
    /// before any session is built.
    pub fn new(modulus: u32) -> Self {
        debug_assert!((2..=MAX_MODULUS).contains(&modulus));
        Self { modulus }
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// Wire representation of an absolute index.
    pub fn wire(&self, abs: u64) -> u16 {
        (abs % self.modulus as u64) as u16
    }

    /// Forward distance from `base` to `wire`, in `0..modulus`.
    pub fn offset(&self, base: u64, wire: u16) -> u32 {
        let base_wire = self.wire(base) as u32;
        (wire as u32 + self.modulus - base_wire) % self.modulus
    }

    /// Absolute index of `wire` if it falls in `[base, base + span)`.
    pub fn resolve_forward(&self, base: u64, wire: u16, span: u64) -> Option<u64> {
        let off = self.offset(base, wire) as u64;
        (off < span).then_some(base + off)
    }

    /// `true` if `wire` names one of the `span` indices immediately below
    /// `base` (never below zero).
    pub fn is_behind(&self, base: u64, wire: u16, span: u64) -> bool {
        let back = (self.modulus - self.offset(base, wire)) as u64 % self.modulus as u64;
        back >= 1 && back <= span.min(base)
    }
}

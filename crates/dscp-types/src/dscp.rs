//! DSCP value type with policy modifier flags.
//!
//! A stored DSCP value is the 6-bit code plus two out-of-band modifier
//! bits used by the classification engine:
//!
//! - bit 6, **fallback**: apply this value only when the packet is not
//!   already marked (a `+` prefix on the textual form)
//! - bit 7, **default**: marks a synthetic protocol-wide default entry
//!   covering every port without an explicit rule; the engine runs the
//!   bulk/priority heuristic only for default-flagged values

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Mask selecting the 6-bit DSCP code.
pub const DSCP_VALUE_MASK: u8 = 0x3f;

/// Apply only when the packet carries no DSCP mark yet.
pub const DSCP_FALLBACK_FLAG: u8 = 1 << 6;

/// Synthetic protocol-wide default entry, eligible for the flow heuristic.
pub const DSCP_DEFAULT_FLAG: u8 = 1 << 7;

/// Sentinel for "no value" in fixed-layout data-plane records.
pub const DSCP_UNSET: u8 = 0xff;

/// Well-known codepoint names (class selectors, assured forwarding,
/// expedited forwarding, voice admit, lower effort, default forwarding).
const CODEPOINTS: &[(&str, u8)] = &[
    ("CS0", 0),
    ("CS1", 8),
    ("CS2", 16),
    ("CS3", 24),
    ("CS4", 32),
    ("CS5", 40),
    ("CS6", 48),
    ("CS7", 56),
    ("AF11", 10),
    ("AF12", 12),
    ("AF13", 14),
    ("AF21", 18),
    ("AF22", 20),
    ("AF23", 22),
    ("AF31", 26),
    ("AF32", 28),
    ("AF33", 30),
    ("AF41", 34),
    ("AF42", 36),
    ("AF43", 38),
    ("EF", 46),
    ("VA", 44),
    ("LE", 1),
    ("DF", 0),
];

/// A DSCP value together with its modifier flags.
///
/// The inner byte is the exact representation stored in the shared
/// classification maps, so the data plane can strip the flags with
/// plain bit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dscp(u8);

impl Dscp {
    /// Creates a value from a bare 6-bit code. Returns `None` above 63.
    pub fn new(code: u8) -> Option<Self> {
        if code <= DSCP_VALUE_MASK {
            Some(Dscp(code))
        } else {
            None
        }
    }

    /// Wraps a raw stored byte, flags included.
    pub const fn from_raw(raw: u8) -> Self {
        Dscp(raw)
    }

    /// The raw byte as stored in the shared maps.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// The 6-bit code with modifier flags stripped.
    pub const fn code(self) -> u8 {
        self.0 & DSCP_VALUE_MASK
    }

    pub const fn is_fallback(self) -> bool {
        self.0 & DSCP_FALLBACK_FLAG != 0
    }

    pub const fn is_default(self) -> bool {
        self.0 & DSCP_DEFAULT_FLAG != 0
    }

    /// Returns the value with the default flag set.
    pub const fn as_default(self) -> Self {
        Dscp(self.0 | DSCP_DEFAULT_FLAG)
    }

    /// Looks up the symbolic name for a codepoint value, if any.
    fn codepoint_name(value: u8) -> Option<&'static str> {
        CODEPOINTS
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(name, _)| *name)
    }
}

impl FromStr for Dscp {
    type Err = ParseError;

    /// Parses a DSCP token: a decimal or `0x`-prefixed hex number in
    /// 0..64, or a symbolic codepoint name, optionally prefixed with
    /// `+` to set the fallback flag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (fallback, val) = match s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let num = if let Some(hex) = val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16).ok()
        } else {
            val.parse::<u8>().ok()
        };

        let code = num
            .or_else(|| {
                CODEPOINTS
                    .iter()
                    .find(|(name, _)| *name == val)
                    .map(|(_, v)| *v)
            })
            .ok_or_else(|| ParseError::InvalidDscp(s.to_string()))?;

        if code > DSCP_VALUE_MASK {
            return Err(ParseError::InvalidDscp(s.to_string()));
        }

        let raw = code | if fallback { DSCP_FALLBACK_FLAG } else { 0 };
        Ok(Dscp(raw))
    }
}

impl fmt::Display for Dscp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = self.0;
        if raw & DSCP_FALLBACK_FLAG != 0 {
            write!(f, "+")?;
            raw &= !DSCP_FALLBACK_FLAG;
        }

        match Self::codepoint_name(raw) {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "0x{:x}", raw),
        }
    }
}

//! Wire representations and request-parameter validation.
//!
//! Everything here is pure: no device access, no state.

use std::num::IntErrorKind;

use ::base64::Engine as _;
use ::base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::error::{Error, Result};

/// Output format of a draw or batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Int32,
    Uniform,
    Normal,
    Hex,
    Base64,
    Bytes,
}

impl Format {
    /// Whether each element of this format is a sized byte block.
    pub fn takes_size(self) -> bool {
        matches!(self, Self::Hex | Self::Base64 | Self::Bytes)
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int32 => write!(f, "int32"),
            Self::Uniform => write!(f, "uniform"),
            Self::Normal => write!(f, "normal"),
            Self::Hex => write!(f, "hex"),
            Self::Base64 => write!(f, "base64"),
            Self::Bytes => write!(f, "bytes"),
        }
    }
}

/// Decimal text of a device integer.
pub fn int32_text(v: i32) -> String {
    v.to_string()
}

/// Shortest round-trip decimal text of a device double. Plain values keep
/// a fractional part (`0.5`, `1.0`, `-0.25`); very small or very large
/// magnitudes use exponent form (`1e-7`, `1e16`).
pub fn float_text(v: f64) -> String {
    format!("{v:?}")
}

/// Lowercase hex, two characters per byte, no separators.
pub fn hex(bytes: &[u8]) -> String {
    ::hex::encode(bytes)
}

/// Standard base64 with padding.
pub fn base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Upper bounds on request sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum batch element count, and maximum single byte-draw length.
    pub max_length: usize,
    /// Maximum bytes per batch element.
    pub max_size: usize,
    /// Maximum total bytes drawn by one sized batch (`length * size`).
    pub max_batch_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_length: 65536,
            max_size: 65536,
            max_batch_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Parse a positive count parameter named `name`.
///
/// Missing, non-integer, `< 1` and `> max` values all fail with
/// `InvalidArgument` naming the parameter.
pub fn parse_count(name: &str, raw: Option<&str>, max: usize) -> Result<usize> {
    let raw = raw.map(str::trim).ok_or_else(|| Error::invalid(format!("{name} is required")))?;
    let value: i64 = match raw.parse::<i64>() {
        Ok(v) => v,
        // Digits out of range are still a number; report the bound instead.
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => i64::MAX,
        Err(e) if *e.kind() == IntErrorKind::NegOverflow => i64::MIN,
        Err(_) => {
            return Err(Error::invalid(format!("{name} must be an integer, got '{raw}'")));
        }
    };
    if value < 1 {
        return Err(Error::invalid(format!("{name} must be greater than 0")));
    }
    let value = usize::try_from(value).unwrap_or(usize::MAX);
    if value > max {
        return Err(Error::invalid(format!("{name} must be at most {max}")));
    }
    Ok(value)
}

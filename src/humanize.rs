//! Byte-size parsing and formatting for config values (`chunk_size =
//! "256KB"`) and transfer-rate logging.
//!
//! Sizes accept a plain byte count or a decimal value with a `B`/`KB`/`MB`/
//! `GB` suffix (binary multiples, case-insensitive). Display picks the
//! largest fitting unit and keeps at most one decimal digit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid byte size: {0:?}")]
pub struct SizeParseError(String);

const UNITS: [(&str, u64); 4] = [
    ("GB", 1 << 30),
    ("MB", 1 << 20),
    ("KB", 1 << 10),
    ("B", 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let upper = raw.to_ascii_uppercase();
        let (number, multiplier) = UNITS
            .iter()
            .find_map(|&(suffix, divisor)| {
                upper.strip_suffix(suffix).map(|rest| (rest.trim_end(), divisor))
            })
            .unwrap_or((upper.as_str(), 1));

        let value: f64 = number
            .parse()
            .map_err(|_| SizeParseError(raw.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(SizeParseError(raw.to_string()));
        }
        Ok(ByteSize((value * multiplier as f64).round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (suffix, divisor) = UNITS
            .iter()
            .copied()
            .find(|&(_, divisor)| divisor > 1 && self.0 >= divisor)
            .unwrap_or(("B", 1));
        let scaled = (self.0 as f64 / divisor as f64 * 10.0).round() / 10.0;
        if scaled.fract() == 0.0 {
            write!(f, "{}{}", scaled as u64, suffix)
        } else {
            write!(f, "{scaled:.1}{suffix}")
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Human(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(ByteSize(n)),
            Raw::Human(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Transfer rate for logs and progress payloads, e.g. `2.5MB/s`.
pub fn format_rate(bytes_per_second: f64) -> String {
    if bytes_per_second <= 0.0 {
        return "0B/s".to_string();
    }
    format!("{}/s", ByteSize(bytes_per_second.round() as u64))
}

//! Memory and disk size handling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

const KILO: u64 = 1024;
const MEGA: u64 = KILO * KILO;
const GIGA: u64 = KILO * MEGA;

/// Default memory for new instances when the client does not specify one.
pub const DEFAULT_MEM_SIZE: &str = "1G";
/// Smallest memory an instance may be given.
pub const MIN_MEM_SIZE: &str = "1G";
/// Default disk for new instances when the client does not specify one.
pub const DEFAULT_DISK_SIZE: &str = "5G";
/// Smallest disk an instance may be given.
pub const MIN_DISK_SIZE: &str = "5G";

/// A byte count parsed from human sizes ("1G", "512M", "42") or from the
/// decimal-byte strings the instance catalog stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Zero bytes. Used as the "unspecified" sentinel in wire requests.
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn in_bytes(&self) -> u64 {
        self.0
    }

    pub fn in_megabytes(&self) -> u64 {
        self.0 / MEGA
    }

    pub fn in_gigabytes(&self) -> u64 {
        self.0 / GIGA
    }
}

impl FromStr for MemorySize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidMemorySize(s.to_string()));
        }

        let (digits, suffix) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) if pos > 0 => trimmed.split_at(pos),
            None => (trimmed, ""),
            Some(_) => return Err(Error::InvalidMemorySize(s.to_string())),
        };

        let value: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidMemorySize(s.to_string()))?;

        let multiplier = match suffix.to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KILO,
            "m" | "mb" | "mib" => MEGA,
            "g" | "gb" | "gib" => GIGA,
            _ => return Err(Error::InvalidMemorySize(s.to_string())),
        };

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| Error::InvalidMemorySize(s.to_string()))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GIGA && self.0 % GIGA == 0 {
            write!(f, "{}G", self.0 / GIGA)
        } else if self.0 >= MEGA && self.0 % MEGA == 0 {
            write!(f, "{}M", self.0 / MEGA)
        } else if self.0 >= KILO && self.0 % KILO == 0 {
            write!(f, "{}K", self.0 / KILO)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

/// Parse a size, falling back to `default` when the input is empty.
pub fn size_or_default(value: &str, default: &str) -> Result<MemorySize, Error> {
    if value.is_empty() {
        default.parse()
    } else {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!("42".parse::<MemorySize>().unwrap().in_bytes(), 42);
        assert_eq!("0".parse::<MemorySize>().unwrap().in_bytes(), 0);
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!("1K".parse::<MemorySize>().unwrap().in_bytes(), 1024);
        assert_eq!("512M".parse::<MemorySize>().unwrap().in_bytes(), 512 * MEGA);
        assert_eq!("1G".parse::<MemorySize>().unwrap().in_bytes(), GIGA);
        assert_eq!("2GiB".parse::<MemorySize>().unwrap().in_bytes(), 2 * GIGA);
        assert_eq!("3gb".parse::<MemorySize>().unwrap().in_bytes(), 3 * GIGA);
        assert_eq!("100B".parse::<MemorySize>().unwrap().in_bytes(), 100);
    }

    #[test]
    fn test_parse_catalog_byte_strings() {
        // The catalog persists decimal byte counts as strings.
        let size = "1073741824".parse::<MemorySize>().unwrap();
        assert_eq!(size.in_bytes(), GIGA);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<MemorySize>().is_err());
        assert!("G".parse::<MemorySize>().is_err());
        assert!("12X".parse::<MemorySize>().is_err());
        assert!("-1G".parse::<MemorySize>().is_err());
        assert!("1.5G".parse::<MemorySize>().is_err());
    }

    #[test]
    fn test_ordering() {
        let small: MemorySize = "512M".parse().unwrap();
        let big: MemorySize = "1G".parse().unwrap();
        assert!(small < big);
        assert!(big >= "1G".parse().unwrap());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["1G", "512M", "3K", "42B"] {
            let size: MemorySize = s.parse().unwrap();
            assert_eq!(size.to_string(), s);
        }
    }

    #[test]
    fn test_size_or_default() {
        assert_eq!(
            size_or_default("", DEFAULT_MEM_SIZE).unwrap().in_bytes(),
            GIGA
        );
        assert_eq!(size_or_default("2G", "1G").unwrap().in_bytes(), 2 * GIGA);
    }
}

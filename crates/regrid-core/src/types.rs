//! Core value types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RegridError;

/// Mean Earth radius in metres, the convention used for cell areas.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Interpolation method requested from the weight generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// First-order conservative remapping (preserves integrals).
    #[default]
    Conservative,
    /// Bilinear interpolation.
    Bilinear,
    /// Nearest neighbour.
    Nearest,
    /// Inverse distance weighted average of the four nearest neighbours.
    Distance,
}

impl Method {
    /// Short name passed to the weight generator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "con",
            Self::Bilinear => "bil",
            Self::Nearest => "nn",
            Self::Distance => "dis",
        }
    }

    /// Whether weights of this method must sum to one per target cell.
    pub fn is_conservative(&self) -> bool {
        matches!(self, Self::Conservative)
    }
}

impl FromStr for Method {
    type Err = RegridError;

    /// Parse from string (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "con" | "ycon" | "conservative" => Ok(Self::Conservative),
            "bil" | "bilinear" => Ok(Self::Bilinear),
            "nn" | "nearest" => Ok(Self::Nearest),
            "dis" | "distance" => Ok(Self::Distance),
            _ => Err(RegridError::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a weight/area artifact accounts for a land/ocean mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskVariant {
    #[default]
    Unmasked,
    Masked,
}

impl MaskVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmasked => "unmasked",
            Self::Masked => "masked",
        }
    }

    pub fn is_masked(&self) -> bool {
        matches!(self, Self::Masked)
    }
}

impl fmt::Display for MaskVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Statistics about the in-memory artifact cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub computations: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

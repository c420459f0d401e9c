//! Content-derived cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::generator::WeightRequest;
use crate::grid::{GridRole, GridSignature};
use crate::types::{MaskVariant, Method};

/// Kind of artifact stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Weights,
    Areas,
}

impl EntryKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Weights => "weights",
            Self::Areas => "areas",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Weights => "rgwa",
            Self::Areas => "rgaa",
        }
    }
}

/// SHA-256 over the structural content that determines an artifact.
///
/// Grid names and the cache location are not part of the key, so equal
/// signatures share one entry wherever they are stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct WeightKeyInput<'a> {
    kind: EntryKind,
    source: &'a GridSignature,
    target: &'a GridSignature,
    method: Method,
    mask_variant: MaskVariant,
    vertical_dim: Option<&'a str>,
    generator_version: &'a str,
}

#[derive(Serialize)]
struct AreaKeyInput<'a> {
    kind: EntryKind,
    grid_digest: &'a str,
    role: &'a GridRole,
    generator_version: &'a str,
}

impl CacheKey {
    pub fn for_weights(request: &WeightRequest, generator_version: &str) -> Self {
        Self::hash(&WeightKeyInput {
            kind: EntryKind::Weights,
            source: &request.source.signature,
            target: &request.target.signature,
            method: request.method,
            mask_variant: request.mask_variant,
            vertical_dim: request.vertical_dim.as_deref(),
            generator_version,
        })
    }

    pub fn for_areas(grid_digest: &str, role: &GridRole, generator_version: &str) -> Self {
        Self::hash(&AreaKeyInput {
            kind: EntryKind::Areas,
            grid_digest,
            role,
            generator_version,
        })
    }

    fn hash<T: Serialize>(input: &T) -> Self {
        let canonical = serde_json::to_vec(input).unwrap_or_default();
        Self(hex::encode(Sha256::digest(canonical)))
    }

    /// Parse a hex key, e.g. from a file name.
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
            .then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Two-character prefix used to shard entry directories.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

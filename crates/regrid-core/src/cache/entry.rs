//! On-disk cache entry format.
//!
//! ```text
//! magic (4 bytes: "RGWA" weights, "RGAA" areas)
//! u32 format version
//! u32 header length
//! header (JSON, CacheEntryMeta)
//! payload (little-endian, see weights::codec)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::key::{CacheKey, EntryKind};
use crate::generator::WeightRequest;
use crate::grid::{GridRole, GridSignature};
use crate::types::{MaskVariant, Method};
use crate::weights::codec;
use crate::weights::{AreaArtifact, LevelWeights, WeightArtifact};

pub const FORMAT_VERSION: u32 = 1;

const WEIGHTS_MAGIC: &[u8; 4] = b"RGWA";
const AREAS_MAGIC: &[u8; 4] = b"RGAA";

/// Header stored in front of every entry payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub key: CacheKey,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
    pub generator_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<GridSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<GridSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_variant: Option<MaskVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_dim: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<GridRole>,

    pub src_shape: Vec<usize>,
    #[serde(default)]
    pub dst_shape: Vec<usize>,

    pub payload_len: u64,
    pub payload_sha256: String,
}

impl CacheEntryMeta {
    fn new(key: &CacheKey, kind: EntryKind, generator_version: &str, payload: &[u8]) -> Self {
        Self {
            key: key.clone(),
            kind,
            created_at: Utc::now(),
            generator_version: generator_version.to_string(),
            source_name: None,
            source: None,
            target_name: None,
            target: None,
            method: None,
            mask_variant: None,
            vertical_dim: None,
            grid_digest: None,
            role: None,
            src_shape: Vec::new(),
            dst_shape: Vec::new(),
            payload_len: payload.len() as u64,
            payload_sha256: hex::encode(Sha256::digest(payload)),
        }
    }

    /// One-line description for listings.
    pub fn describe(&self) -> String {
        match self.kind {
            EntryKind::Weights => format!(
                "{} -> {} method={} variant={}{}",
                self.source_name.as_deref().unwrap_or("?"),
                self.target_name.as_deref().unwrap_or("?"),
                self.method.map(|m| m.to_string()).unwrap_or_default(),
                self.mask_variant.map(|v| v.to_string()).unwrap_or_default(),
                self.vertical_dim
                    .as_ref()
                    .map(|d| format!(" levels={}", d))
                    .unwrap_or_default(),
            ),
            EntryKind::Areas => format!(
                "grid {} role={}",
                self.grid_digest
                    .as_deref()
                    .map(|d| d.get(..12).unwrap_or(d))
                    .unwrap_or("?"),
                self.role.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            ),
        }
    }
}

fn frame(magic: &[u8; 4], meta: &CacheEntryMeta, payload: &[u8]) -> Vec<u8> {
    let header = serde_json::to_vec(meta).unwrap_or_default();
    let mut bytes = Vec::with_capacity(12 + header.len() + payload.len());
    bytes.extend_from_slice(magic);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(payload);
    bytes
}

fn unframe<'a>(bytes: &'a [u8], kind: EntryKind) -> Result<(CacheEntryMeta, &'a [u8]), String> {
    if bytes.len() < 12 {
        return Err(format!("entry is only {} bytes", bytes.len()));
    }
    let magic = match kind {
        EntryKind::Weights => WEIGHTS_MAGIC,
        EntryKind::Areas => AREAS_MAGIC,
    };
    if &bytes[..4] != magic {
        return Err("bad magic bytes".to_string());
    }

    let mut buf4 = [0u8; 4];
    buf4.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(buf4);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported entry format version {}", version));
    }

    buf4.copy_from_slice(&bytes[8..12]);
    let header_len = u32::from_le_bytes(buf4) as usize;
    let header_end = 12usize
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or("header extends past end of entry")?;

    let meta: CacheEntryMeta = serde_json::from_slice(&bytes[12..header_end])
        .map_err(|e| format!("unreadable header: {}", e))?;
    if meta.kind != kind {
        return Err(format!("entry holds {:?}, expected {:?}", meta.kind, kind));
    }

    Ok((meta, &bytes[header_end..]))
}

fn check_payload(meta: &CacheEntryMeta, payload: &[u8]) -> Result<(), String> {
    if payload.len() as u64 != meta.payload_len {
        return Err(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            meta.payload_len
        ));
    }
    let digest = hex::encode(Sha256::digest(payload));
    if digest != meta.payload_sha256 {
        return Err("payload checksum mismatch".to_string());
    }
    Ok(())
}

/// Read only the header of an entry file.
pub fn read_meta(bytes: &[u8], kind: EntryKind) -> Result<CacheEntryMeta, String> {
    unframe(bytes, kind).map(|(meta, _)| meta)
}

pub fn encode_weights(
    key: &CacheKey,
    request: &WeightRequest,
    generator_version: &str,
    artifact: &WeightArtifact,
) -> Vec<u8> {
    let payload = codec::encode_matrices(artifact.weights.matrices());
    let mut meta = CacheEntryMeta::new(key, EntryKind::Weights, generator_version, &payload);
    meta.source_name = Some(request.source.name.clone());
    meta.source = Some(artifact.source.clone());
    meta.target_name = Some(request.target.name.clone());
    meta.target = Some(artifact.target.clone());
    meta.method = Some(artifact.method);
    meta.mask_variant = Some(artifact.mask_variant);
    meta.vertical_dim = artifact.vertical_dim().map(str::to_string);
    meta.src_shape = artifact.src_shape.clone();
    meta.dst_shape = artifact.dst_shape.clone();
    frame(WEIGHTS_MAGIC, &meta, &payload)
}

/// Decode and fully verify a weights entry.
pub fn decode_weights(bytes: &[u8]) -> Result<(CacheEntryMeta, WeightArtifact), String> {
    let (meta, payload) = unframe(bytes, EntryKind::Weights)?;
    check_payload(&meta, payload)?;

    let mut matrices = codec::decode_matrices(payload)?;
    let weights = match &meta.vertical_dim {
        Some(dim) => LevelWeights::PerLevel {
            dim: dim.clone(),
            matrices,
        },
        None if matrices.len() == 1 => LevelWeights::Uniform(matrices.remove(0)),
        None => return Err(format!("{} matrices in a uniform entry", matrices.len())),
    };

    let artifact = WeightArtifact {
        source: meta.source.clone().ok_or("header lacks source signature")?,
        target: meta.target.clone().ok_or("header lacks target signature")?,
        method: meta.method.ok_or("header lacks method")?,
        mask_variant: meta.mask_variant.ok_or("header lacks mask variant")?,
        src_shape: meta.src_shape.clone(),
        dst_shape: meta.dst_shape.clone(),
        weights,
    };
    artifact.check_invariants()?;

    Ok((meta, artifact))
}

pub fn encode_areas(key: &CacheKey, generator_version: &str, area: &AreaArtifact) -> Vec<u8> {
    let payload = codec::encode_areas(&area.areas);
    let mut meta = CacheEntryMeta::new(key, EntryKind::Areas, generator_version, &payload);
    meta.grid_digest = Some(area.grid_digest.clone());
    meta.role = Some(area.role.clone());
    meta.src_shape = area.shape.clone();
    frame(AREAS_MAGIC, &meta, &payload)
}

pub fn decode_areas(bytes: &[u8]) -> Result<(CacheEntryMeta, AreaArtifact), String> {
    let (meta, payload) = unframe(bytes, EntryKind::Areas)?;
    check_payload(&meta, payload)?;

    let area = AreaArtifact {
        grid_digest: meta.grid_digest.clone().ok_or("header lacks grid digest")?,
        role: meta.role.clone().ok_or("header lacks grid role")?,
        shape: meta.src_shape.clone(),
        areas: codec::decode_areas(payload)?,
    };
    area.check_invariants()?;

    Ok((meta, area))
}

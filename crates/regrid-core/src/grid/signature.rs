//! Structural, hashable grid descriptions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::regular::RegularGrid;
use crate::types::MaskVariant;

/// Which file of a grid a weight computation reads.
///
/// Per-level roles carry the name of the vertical dimension whose levels
/// each have their own mask (e.g. ocean depth levels).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum GridRole {
    Unmasked,
    Masked,
    Levels(String),
}

impl GridRole {
    /// Parse a registry key, treating names of vertical dimensions as level roles.
    pub fn from_key(key: &str, vert_coord: &[String]) -> Option<Self> {
        match key {
            "unmasked" | "2d" => Some(Self::Unmasked),
            "masked" => Some(Self::Masked),
            other if vert_coord.iter().any(|v| v == other) => Some(Self::Levels(other.to_string())),
            other => other
                .strip_prefix("levels:")
                .map(|dim| Self::Levels(dim.to_string())),
        }
    }

    pub fn vertical_dim(&self) -> Option<&str> {
        match self {
            Self::Levels(dim) => Some(dim),
            _ => None,
        }
    }
}

impl fmt::Display for GridRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmasked => write!(f, "unmasked"),
            Self::Masked => write!(f, "masked"),
            Self::Levels(dim) => write!(f, "levels:{}", dim),
        }
    }
}

impl From<GridRole> for String {
    fn from(role: GridRole) -> Self {
        role.to_string()
    }
}

impl TryFrom<String> for GridRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GridRole::from_key(&value, &[]).ok_or_else(|| format!("unknown grid role '{}'", value))
    }
}

/// Decides whether a variable uses the masked weights of its grid.
///
/// A variable is masked when any listed attribute matches exactly or when
/// its name is in the allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskRule {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeSet<String>,
}

impl MaskRule {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.variables.is_empty()
    }

    pub fn matches(&self, variable: &str, attrs: &BTreeMap<String, String>) -> bool {
        if self.variables.contains(variable) {
            return true;
        }
        self.attributes
            .iter()
            .any(|(key, value)| attrs.get(key).map(|v| v == value).unwrap_or(false))
    }
}

/// Identifies a physical grid by value.
///
/// Equality and the digest cover every field, so independently built
/// descriptions of the same grid share one cache entry. The logical name
/// is not part of the signature (see [`ResolvedGrid`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSignature {
    /// File (or shorthand descriptor) per role, ordered by role.
    pub paths: BTreeMap<GridRole, String>,
    /// Names of the horizontal dimensions, in storage order.
    pub space_coord: Vec<String>,
    /// Vertical dimensions with per-level weights.
    #[serde(default)]
    pub vert_coord: Vec<String>,
    /// Declared native level counts per vertical dimension.
    #[serde(default)]
    pub levels: BTreeMap<String, usize>,
    #[serde(default)]
    pub mask: MaskRule,
    /// Extra options forwarded to the weight generator.
    #[serde(default)]
    pub extra: Vec<String>,
}

impl GridSignature {
    /// Signature of a regular lon/lat grid; needs no external files.
    pub fn regular(grid: &RegularGrid) -> Self {
        let mut paths = BTreeMap::new();
        paths.insert(GridRole::Unmasked, grid.descriptor());
        Self {
            paths,
            space_coord: vec!["lat".to_string(), "lon".to_string()],
            vert_coord: Vec::new(),
            levels: BTreeMap::new(),
            mask: MaskRule::default(),
            extra: Vec::new(),
        }
    }

    /// SHA-256 over the canonical JSON encoding, hex encoded.
    pub fn digest(&self) -> String {
        // BTreeMaps serialize in key order, which makes the encoding canonical.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(canonical))
    }

    pub fn path_for(&self, role: &GridRole) -> Option<&str> {
        self.paths.get(role).map(String::as_str)
    }

    pub fn is_vertical(&self, dim: &str) -> bool {
        self.vert_coord.iter().any(|v| v == dim)
    }

    /// The file role used for a mask variant and optional level dimension.
    ///
    /// Masked requests fall back to the unmasked file when the grid has no
    /// dedicated masked file; the variant still separates the cache keys.
    pub fn role_for(&self, variant: MaskVariant, vertical_dim: Option<&str>) -> Option<GridRole> {
        if let Some(dim) = vertical_dim {
            let role = GridRole::Levels(dim.to_string());
            return self.paths.contains_key(&role).then_some(role);
        }
        if variant.is_masked() && self.paths.contains_key(&GridRole::Masked) {
            return Some(GridRole::Masked);
        }
        self.paths
            .contains_key(&GridRole::Unmasked)
            .then_some(GridRole::Unmasked)
            .or_else(|| self.paths.keys().find(|r| r.vertical_dim().is_none()).cloned())
    }
}

/// A signature together with the logical name it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGrid {
    pub name: String,
    pub signature: GridSignature,
}

impl ResolvedGrid {
    pub fn new(name: impl Into<String>, signature: GridSignature) -> Self {
        Self {
            name: name.into(),
            signature,
        }
    }

    pub fn digest(&self) -> String {
        self.signature.digest()
    }

    /// Regular grid geometry, if this grid is a regular-grid shorthand.
    pub fn as_regular(&self) -> Option<RegularGrid> {
        self.signature
            .path_for(&GridRole::Unmasked)
            .and_then(RegularGrid::parse)
            .filter(|_| self.signature.space_coord == ["lat", "lon"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ocean_grid() -> GridSignature {
        let mut paths = BTreeMap::new();
        paths.insert(GridRole::Unmasked, "/data/nodes.nc".to_string());
        paths.insert(GridRole::Masked, "/data/nodes_masked.nc".to_string());
        paths.insert(GridRole::Levels("nz1".to_string()), "/data/nz1.nc".to_string());
        let mut mask = MaskRule::default();
        mask.attributes.insert("component".to_string(), "ocean".to_string());
        GridSignature {
            paths,
            space_coord: vec!["ncells".to_string()],
            vert_coord: vec!["nz1".to_string()],
            levels: BTreeMap::new(),
            mask,
            extra: vec![],
        }
    }

    #[test]
    fn test_role_keys() {
        let vert = vec!["nz1".to_string()];
        assert_eq!(GridRole::from_key("unmasked", &vert), Some(GridRole::Unmasked));
        assert_eq!(GridRole::from_key("2d", &vert), Some(GridRole::Unmasked));
        assert_eq!(GridRole::from_key("masked", &vert), Some(GridRole::Masked));
        assert_eq!(
            GridRole::from_key("nz1", &vert),
            Some(GridRole::Levels("nz1".to_string()))
        );
        assert_eq!(GridRole::from_key("nz", &vert), None);
        assert_eq!(
            GridRole::try_from("levels:nz".to_string()).unwrap(),
            GridRole::Levels("nz".to_string())
        );
    }

    #[test]
    fn test_independent_signatures_share_digest() {
        let a = ocean_grid();
        let b = ocean_grid();
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());

        let mut c = ocean_grid();
        c.extra.push("-setgridtype,unstructured".to_string());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_signature_serializes_with_string_roles() {
        let json = serde_json::to_string(&ocean_grid()).unwrap();
        assert!(json.contains("\"levels:nz1\""));
        let back: GridSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ocean_grid());
    }

    #[test]
    fn test_mask_rule_matching() {
        let grid = ocean_grid();
        let mut attrs = BTreeMap::new();
        assert!(!grid.mask.matches("tas", &attrs));
        attrs.insert("component".to_string(), "ocean".to_string());
        assert!(grid.mask.matches("tos", &attrs));

        let mut rule = MaskRule::default();
        rule.variables.insert("sst".to_string());
        assert!(rule.matches("sst", &BTreeMap::new()));
        assert!(!rule.matches("tas", &BTreeMap::new()));
    }

    #[test]
    fn test_role_for_variants() {
        let grid = ocean_grid();
        assert_eq!(grid.role_for(MaskVariant::Unmasked, None), Some(GridRole::Unmasked));
        assert_eq!(grid.role_for(MaskVariant::Masked, None), Some(GridRole::Masked));
        assert_eq!(
            grid.role_for(MaskVariant::Masked, Some("nz1")),
            Some(GridRole::Levels("nz1".to_string()))
        );
        assert_eq!(grid.role_for(MaskVariant::Masked, Some("nz")), None);

        let regular = GridSignature::regular(&RegularGrid::new(36, 18));
        assert_eq!(regular.role_for(MaskVariant::Masked, None), Some(GridRole::Unmasked));
    }
}

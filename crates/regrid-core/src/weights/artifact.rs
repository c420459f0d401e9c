//! Weight and area artifacts as produced by the generator and stored in the cache.

use crate::grid::{GridRole, GridSignature};
use crate::types::{MaskVariant, Method};

use super::sparse::SparseWeights;

/// Row sums of conservative weights must be within this of one.
pub const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// One matrix for all levels, or one per native vertical level.
#[derive(Debug, Clone, PartialEq)]
pub enum LevelWeights {
    Uniform(SparseWeights),
    PerLevel {
        dim: String,
        matrices: Vec<SparseWeights>,
    },
}

impl LevelWeights {
    pub fn matrices(&self) -> &[SparseWeights] {
        match self {
            Self::Uniform(w) => std::slice::from_ref(w),
            Self::PerLevel { matrices, .. } => matrices,
        }
    }

    pub fn level_count(&self) -> Option<usize> {
        match self {
            Self::Uniform(_) => None,
            Self::PerLevel { matrices, .. } => Some(matrices.len()),
        }
    }
}

/// Interpolation weights for one (source, target, method, mask variant).
#[derive(Debug, Clone, PartialEq)]
pub struct WeightArtifact {
    pub source: GridSignature,
    pub target: GridSignature,
    pub method: Method,
    pub mask_variant: MaskVariant,
    /// Spatial shape of the source grid in storage order.
    pub src_shape: Vec<usize>,
    /// Spatial shape of the target grid in storage order.
    pub dst_shape: Vec<usize>,
    pub weights: LevelWeights,
}

impl WeightArtifact {
    pub fn n_src(&self) -> usize {
        self.src_shape.iter().product()
    }

    pub fn n_dst(&self) -> usize {
        self.dst_shape.iter().product()
    }

    pub fn vertical_dim(&self) -> Option<&str> {
        match &self.weights {
            LevelWeights::Uniform(_) => None,
            LevelWeights::PerLevel { dim, .. } => Some(dim),
        }
    }

    pub fn nnz(&self) -> usize {
        self.weights.matrices().iter().map(SparseWeights::nnz).sum()
    }

    /// Matrix to use for a native level (ignored for uniform weights).
    pub fn matrix(&self, level: Option<usize>) -> Result<&SparseWeights, String> {
        match (&self.weights, level) {
            (LevelWeights::Uniform(w), _) => Ok(w),
            (LevelWeights::PerLevel { dim, matrices }, Some(level)) => {
                matrices.get(level).ok_or_else(|| {
                    format!(
                        "level {} of '{}' out of range ({} levels in weights)",
                        level,
                        dim,
                        matrices.len()
                    )
                })
            }
            (LevelWeights::PerLevel { dim, .. }, None) => {
                Err(format!("per-level weights along '{}' need a level", dim))
            }
        }
    }

    /// Structural invariants checked before promotion and after every read.
    pub fn check_invariants(&self) -> Result<(), String> {
        let (n_src, n_dst) = (self.n_src(), self.n_dst());
        let matrices = self.weights.matrices();
        if matrices.is_empty() {
            return Err("artifact holds no weight matrices".to_string());
        }
        for (level, w) in matrices.iter().enumerate() {
            if w.n_src() != n_src || w.n_dst() != n_dst {
                return Err(format!(
                    "matrix {} is {}x{} but grids are {}x{}",
                    level,
                    w.n_dst(),
                    w.n_src(),
                    n_dst,
                    n_src
                ));
            }
            w.check(self.method.is_conservative(), ROW_SUM_TOLERANCE)
                .map_err(|e| format!("matrix {}: {}", level, e))?;
        }
        Ok(())
    }
}

/// Cell areas of one grid file, in square metres.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaArtifact {
    pub grid_digest: String,
    pub role: GridRole,
    pub shape: Vec<usize>,
    pub areas: Vec<f64>,
}

impl AreaArtifact {
    pub fn total(&self) -> f64 {
        self.areas.iter().sum()
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let expected: usize = self.shape.iter().product();
        if expected != self.areas.len() {
            return Err(format!(
                "{} areas for shape {:?}",
                self.areas.len(),
                self.shape
            ));
        }
        if let Some(pos) = self.areas.iter().position(|a| !a.is_finite() || *a < 0.0) {
            return Err(format!("invalid cell area at {}", pos));
        }
        Ok(())
    }

    /// Whether the areas add up to a full sphere of `radius` within `rel_tol`.
    pub fn covers_sphere(&self, radius: f64, rel_tol: f64) -> bool {
        let sphere = 4.0 * std::f64::consts::PI * radius * radius;
        ((self.total() - sphere) / sphere).abs() <= rel_tol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RegularGrid;

    fn artifact(weights: LevelWeights) -> WeightArtifact {
        let grid = GridSignature::regular(&RegularGrid::new(2, 1));
        WeightArtifact {
            source: grid.clone(),
            target: grid,
            method: Method::Conservative,
            mask_variant: MaskVariant::Unmasked,
            src_shape: vec![1, 2],
            dst_shape: vec![1, 2],
            weights,
        }
    }

    #[test]
    fn test_uniform_matrix_ignores_level() {
        let a = artifact(LevelWeights::Uniform(SparseWeights::identity(2)));
        assert!(a.matrix(Some(7)).is_ok());
        assert!(a.matrix(None).is_ok());
        assert!(a.check_invariants().is_ok());
        assert_eq!(a.vertical_dim(), None);
    }

    #[test]
    fn test_per_level_lookup() {
        let a = artifact(LevelWeights::PerLevel {
            dim: "nz1".to_string(),
            matrices: vec![SparseWeights::identity(2); 3],
        });
        assert!(a.matrix(Some(2)).is_ok());
        assert!(a.matrix(Some(3)).is_err());
        assert!(a.matrix(None).is_err());
        assert_eq!(a.nnz(), 6);
        assert_eq!(a.weights.level_count(), Some(3));
    }

    #[test]
    fn test_invariants_catch_shape_mismatch() {
        let a = artifact(LevelWeights::Uniform(SparseWeights::identity(3)));
        assert!(a.check_invariants().is_err());
    }

    #[test]
    fn test_area_sphere_check() {
        let r = 1.0;
        let area = AreaArtifact {
            grid_digest: "abc".to_string(),
            role: GridRole::Unmasked,
            shape: vec![2],
            areas: vec![2.0 * std::f64::consts::PI; 2],
        };
        assert!(area.check_invariants().is_ok());
        assert!(area.covers_sphere(r, 1e-12));
        assert!(!area.covers_sphere(2.0, 1e-3));
    }
}

//! Adapter to the external weight/area generator.
//!
//! The generator is a black box: given two grids, a method and a mask
//! variant it returns a weight matrix and the cell areas of both grids. It
//! does no caching and no retries; both belong to [`crate::cache`].

mod external;

pub use external::ExternalGenerator;

use crate::error::{RegridContext, Result};
use crate::grid::{GridRole, ResolvedGrid};
use crate::types::{MaskVariant, Method};
use crate::weights::{AreaArtifact, WeightArtifact};

/// Everything that identifies one weight computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightRequest {
    pub source: ResolvedGrid,
    pub target: ResolvedGrid,
    pub method: Method,
    pub mask_variant: MaskVariant,
    /// Vertical dimension for per-level weights.
    pub vertical_dim: Option<String>,
}

impl WeightRequest {
    pub fn new(
        source: ResolvedGrid,
        target: ResolvedGrid,
        method: Method,
        mask_variant: MaskVariant,
    ) -> Self {
        Self {
            source,
            target,
            method,
            mask_variant,
            vertical_dim: None,
        }
    }

    pub fn with_vertical_dim(mut self, dim: impl Into<String>) -> Self {
        self.vertical_dim = Some(dim.into());
        self
    }

    /// Source grid file the weights are computed from.
    pub fn source_role(&self) -> Option<GridRole> {
        self.source
            .signature
            .role_for(self.mask_variant, self.vertical_dim.as_deref())
    }

    /// Target grid file; targets are always used unmasked.
    pub fn target_role(&self) -> Option<GridRole> {
        self.target.signature.role_for(MaskVariant::Unmasked, None)
    }

    pub fn context(&self) -> RegridContext {
        RegridContext {
            source: self.source.name.clone(),
            source_digest: self.source.digest(),
            target: self.target.name.clone(),
            target_digest: self.target.digest(),
            method: self.method,
            mask_variant: self.mask_variant,
            vertical_dim: self.vertical_dim.clone(),
        }
    }
}

/// Result of one generator run.
#[derive(Debug, Clone)]
pub struct GeneratedWeights {
    pub weights: WeightArtifact,
    pub source_area: AreaArtifact,
    pub target_area: AreaArtifact,
}

/// A weight/area generator.
///
/// Implementations must be deterministic for equal requests; failures are
/// reported as `RegridError::WeightGeneration`.
pub trait WeightGenerator: Send + Sync {
    /// Version tag recorded in cache keys and entries.
    fn version(&self) -> &str;

    fn compute(&self, request: &WeightRequest) -> Result<GeneratedWeights>;
}

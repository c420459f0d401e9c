//! Grid-aware regridding engine for climate model output.
//!
//! This crate turns a labelled N-dimensional field on a model grid into the
//! same field on a target grid by applying sparse interpolation weights. The
//! weights themselves are produced by an external generator and are expensive,
//! so they are kept in a persistent, content-addressed cache shared between
//! processes.
//!
//! # Architecture
//!
//! ```text
//! Field + source grid name
//!      │
//!      ▼
//! GridResolver::resolve(name)            (registry + template parameters)
//!      │
//!      ├─► vertical::bind(field)         (hidden idx_<dim> coordinate)
//!      │
//!      ├─► WeightCache::get_or_compute(request)
//!      │         │
//!      │         ├─► promoted entry on disk: read, verify, share via Arc
//!      │         │
//!      │         └─► miss: lock key, run WeightGenerator once,
//!      │                   write temp file, verify, rename into place
//!      │
//!      └─► RegridPlan::execute()         (CSR apply, parallel over rows)
//!               │
//!               ▼
//!          Field on the target grid
//! ```
//!
//! # Example
//!
//! ```ignore
//! use regrid_core::{GridTarget, Regridder, RegridConfig, ExternalGenerator};
//!
//! let config = RegridConfig::load("config/regrid.yaml")?;
//! let generator = Arc::new(ExternalGenerator::from_config(&config.generator));
//! let regridder = Regridder::from_config(&config, generator)?;
//!
//! let output = regridder.regrid_from(&field, "fesom-core2", &GridTarget::parse("r360x180"), None)?;
//! for warning in &output.warnings {
//!     eprintln!("{warning}");
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod field;
pub mod generator;
pub mod grid;
pub mod regridder;
pub mod types;
pub mod vertical;
pub mod weights;

// Re-export commonly used types at crate root
pub use cache::{CacheEntryMeta, CacheKey, CacheSettings, WeightCache};
pub use config::RegridConfig;
pub use error::{RegridContext, RegridError, Result};
pub use field::{Coord, CoordValues, Dataset, Field, Selection};
pub use generator::{ExternalGenerator, GeneratedWeights, WeightGenerator, WeightRequest};
pub use grid::{
    GridDefinition, GridRegistry, GridResolver, GridRole, GridSignature, GridTarget, MaskRule,
    RegularGrid, ResolveContext, ResolvedGrid,
};
pub use regridder::{DatasetOutput, RegridOutput, RegridPlan, RegridWarning, Regridder};
pub use types::{CacheStats, MaskVariant, Method, EARTH_RADIUS_M};
pub use vertical::{LevelBinding, VerticalIndex};
pub use weights::{AreaArtifact, LevelWeights, MissingPolicy, SparseWeights, WeightArtifact};

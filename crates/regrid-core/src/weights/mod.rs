//! Sparse interpolation weights and cell areas.

mod artifact;
pub(crate) mod codec;
mod sparse;

pub use artifact::{AreaArtifact, LevelWeights, WeightArtifact, ROW_SUM_TOLERANCE};
pub use sparse::{MissingPolicy, SparseWeights};

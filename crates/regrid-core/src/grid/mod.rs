//! Grid descriptions: signatures, the registry, and name resolution.

mod registry;
mod regular;
mod resolver;
mod signature;

pub use registry::{GridDefinition, GridRegistry, MaskConfig, PathSpec};
pub use regular::RegularGrid;
pub use resolver::{GridResolver, GridTarget, ResolveContext};
pub use signature::{GridRole, GridSignature, MaskRule, ResolvedGrid};

//! Common test fixtures for regridding tests.
//!
//! This module provides a small grid registry whose grid files are all
//! regular-grid shorthands, so [`crate::SyntheticGenerator`] can serve every
//! request without external data.

use std::sync::Arc;

use regrid_core::{
    CacheSettings, GridRegistry, GridResolver, Method, RegularGrid, Regridder, ResolveContext,
    WeightCache,
};
use tempfile::TempDir;

use crate::synthetic::SyntheticGenerator;

/// Common grid definitions for testing.
pub mod grids {
    use regrid_core::RegularGrid;

    /// Ocean model grid with a masked file and per-level files along `nz1`.
    pub const OCEAN: &str = "ocean";
    /// Geometry of [`OCEAN`].
    pub const OCEAN_GRID: RegularGrid = RegularGrid { nlon: 8, nlat: 4 };
    /// Vertical dimension of [`OCEAN`].
    pub const OCEAN_LEVEL_DIM: &str = "nz1";
    /// Native level count of [`OCEAN`].
    pub const OCEAN_LEVELS: usize = 5;

    /// Atmosphere grid used as a named target.
    pub const ATMOS: &str = "atmos";
    pub const ATMOS_GRID: RegularGrid = RegularGrid { nlon: 12, nlat: 6 };

    /// Unstructured view of the ocean geometry, one `ncells` dimension.
    pub const CELLS: &str = "cells";

    /// Coarse regular target shorthand.
    pub const COARSE: &str = "r4x2";
}

/// Registry YAML matching [`grids`].
pub const REGISTRY_YAML: &str = r#"
grids:
  ocean:
    path:
      unmasked: r8x4
      masked: r8x4
      nz1: r8x4
    space_coord: [lat, lon]
    vert_coord: [nz1]
    levels:
      nz1: 5
    masked:
      attributes:
        component: ocean
      variables: [tos]
  atmos:
    path: r12x6
  cells:
    path: r8x4
    space_coord: [ncells]
"#;

/// The test registry.
pub fn registry() -> GridRegistry {
    GridRegistry::from_yaml_str(REGISTRY_YAML).expect("test registry parses")
}

/// A regridder over a temporary cache directory.
///
/// The directory is removed when the fixture is dropped.
pub struct TestRegridder {
    pub dir: TempDir,
    pub generator: Arc<SyntheticGenerator>,
    pub regridder: Regridder,
}

impl TestRegridder {
    pub fn new() -> Self {
        Self::with_generator(SyntheticGenerator::new())
    }

    pub fn with_generator(generator: SyntheticGenerator) -> Self {
        Self::with_settings(generator, |_| {})
    }

    /// Build with adjusted cache settings.
    pub fn with_settings(
        generator: SyntheticGenerator,
        configure: impl FnOnce(&mut CacheSettings),
    ) -> Self {
        let dir = tempfile::tempdir().expect("create temp cache dir");
        let generator = Arc::new(generator);
        let mut settings = CacheSettings::new(dir.path());
        configure(&mut settings);
        let regridder = build(settings, generator.clone());
        Self {
            dir,
            generator,
            regridder,
        }
    }

    /// A second regridder on the same cache root, as another process would
    /// open it. It shares the generator (and its call counter).
    pub fn reopen(&self) -> Regridder {
        let settings = self.regridder.cache().settings().clone();
        build(settings, self.generator.clone())
    }

    pub fn cache(&self) -> &WeightCache {
        self.regridder.cache()
    }
}

impl Default for TestRegridder {
    fn default() -> Self {
        Self::new()
    }
}

fn build(settings: CacheSettings, generator: Arc<SyntheticGenerator>) -> Regridder {
    let resolver = GridResolver::new(Arc::new(registry()), ResolveContext::new());
    let cache = WeightCache::open(settings, generator).expect("open test cache");
    Regridder::new(resolver, Arc::new(cache), Method::Conservative)
}

/// Grid geometry behind a fixture name or shorthand.
pub fn geometry(name: &str) -> Option<RegularGrid> {
    match name {
        grids::OCEAN | grids::CELLS => Some(grids::OCEAN_GRID),
        grids::ATMOS => Some(grids::ATMOS_GRID),
        other => RegularGrid::parse(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_all_fixture_grids() {
        let resolver = GridResolver::new(Arc::new(registry()), ResolveContext::new());
        for name in [grids::OCEAN, grids::ATMOS, grids::CELLS, grids::COARSE] {
            let grid = resolver.resolve(name).unwrap();
            assert!(resolver.validate(&grid).is_ok());
            assert!(geometry(name).is_some());
        }
    }

    #[test]
    fn test_reopen_shares_root() {
        let fixture = TestRegridder::new();
        let other = fixture.reopen();
        assert_eq!(other.cache().root(), fixture.cache().root());
    }
}

//! Sparse regridding of fields and datasets.

mod plan;

pub use plan::RegridPlan;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheSettings, WeightCache};
use crate::config::RegridConfig;
use crate::error::{RegridContext, RegridError, Result};
use crate::field::{Coord, Dataset, Field};
use crate::generator::{WeightGenerator, WeightRequest};
use crate::grid::{GridRegistry, GridResolver, GridRole, GridTarget, ResolvedGrid};
use crate::types::{MaskVariant, Method};
use crate::vertical::{LevelBinding, VerticalIndex};
use crate::weights::{AreaArtifact, MissingPolicy, WeightArtifact};

/// A non-fatal problem found while regridding one variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegridWarning {
    pub variable: String,
    pub context: RegridContext,
    pub message: String,
}

impl RegridWarning {
    fn into_error(self) -> RegridError {
        RegridError::AmbiguousVerticalSelection {
            variable: self.variable,
            context: Box::new(self.context),
            message: self.message,
        }
    }
}

impl fmt::Display for RegridWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.variable, self.message, self.context)
    }
}

/// A regridded field plus any warnings about its correctness.
#[derive(Debug, Clone)]
pub struct RegridOutput {
    pub field: Field,
    pub warnings: Vec<RegridWarning>,
}

impl RegridOutput {
    /// The field, or an `AmbiguousVerticalSelection` error if any warning was raised.
    pub fn into_strict(self) -> Result<Field> {
        match self.warnings.into_iter().next() {
            Some(warning) => Err(warning.into_error()),
            None => Ok(self.field),
        }
    }
}

/// A regridded dataset plus warnings for all of its variables.
#[derive(Debug, Clone)]
pub struct DatasetOutput {
    pub dataset: Dataset,
    pub warnings: Vec<RegridWarning>,
}

impl DatasetOutput {
    pub fn into_strict(self) -> Result<Dataset> {
        match self.warnings.into_iter().next() {
            Some(warning) => Err(warning.into_error()),
            None => Ok(self.dataset),
        }
    }
}

/// Applies cached weights to fields.
///
/// Holds only shared references to cached artifacts; the cache owns them.
#[derive(Debug, Clone)]
pub struct Regridder {
    resolver: GridResolver,
    cache: Arc<WeightCache>,
    default_method: Method,
}

impl Regridder {
    pub fn new(resolver: GridResolver, cache: Arc<WeightCache>, default_method: Method) -> Self {
        Self {
            resolver,
            cache,
            default_method,
        }
    }

    /// Build registry, resolver and cache from configuration.
    pub fn from_config(config: &RegridConfig, generator: Arc<dyn WeightGenerator>) -> Result<Self> {
        Self::from_config_with_params(config, generator, &BTreeMap::new())
    }

    /// As [`Regridder::from_config`], with extra template parameters.
    pub fn from_config_with_params(
        config: &RegridConfig,
        generator: Arc<dyn WeightGenerator>,
        params: &BTreeMap<String, String>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = GridRegistry::new(config.grids.clone())?;
        let resolver = GridResolver::new(Arc::new(registry), config.resolve_context(params));
        let cache = WeightCache::open(CacheSettings::from_config(config), generator)?;
        Ok(Self::new(resolver, Arc::new(cache), config.regrid.default_method))
    }

    pub fn resolver(&self) -> &GridResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<WeightCache> {
        &self.cache
    }

    pub fn default_method(&self) -> Method {
        self.default_method
    }

    /// The request identifying one weight artifact.
    pub fn request(
        &self,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
        mask_variant: MaskVariant,
        vertical_dim: Option<&str>,
    ) -> Result<WeightRequest> {
        let source = self.resolver.resolve(source)?;
        let target = self.resolver.resolve_target(target)?;
        self.request_for(source, target, method, mask_variant, vertical_dim)
    }

    fn request_for(
        &self,
        source: ResolvedGrid,
        target: ResolvedGrid,
        method: Option<Method>,
        mask_variant: MaskVariant,
        vertical_dim: Option<&str>,
    ) -> Result<WeightRequest> {
        let mut request = WeightRequest::new(
            source,
            target,
            method.unwrap_or(self.default_method),
            mask_variant,
        );
        if let Some(dim) = vertical_dim {
            if !request.source.signature.is_vertical(dim) {
                return Err(RegridError::config(format!(
                    "grid '{}' has no vertical dimension '{}'",
                    request.source.name, dim
                )));
            }
            request = request.with_vertical_dim(dim);
        }
        Ok(request)
    }

    /// Weights for inspection and testing, computed on a miss.
    pub fn weights_for(
        &self,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
        mask_variant: MaskVariant,
    ) -> Result<Arc<WeightArtifact>> {
        let request = self.request(source, target, method, mask_variant, None)?;
        self.cache.get_or_compute(&request)
    }

    /// Invalidate and recompute the weights for a grid pair.
    pub fn rebuild(
        &self,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
        mask_variant: MaskVariant,
    ) -> Result<Arc<WeightArtifact>> {
        let request = self.request(source, target, method, mask_variant, None)?;
        self.cache.rebuild(&request)
    }

    /// Whether valid weights for a grid pair are stored.
    pub fn verify(
        &self,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
        mask_variant: MaskVariant,
    ) -> Result<bool> {
        let request = self.request(source, target, method, mask_variant, None)?;
        self.cache.verify(&request)
    }

    /// Cell areas of a grid file, if any computation has produced them.
    pub fn areas_for(&self, grid: &GridTarget, role: &GridRole) -> Result<Option<AreaArtifact>> {
        let grid = self.resolver.resolve_target(grid)?;
        self.cache.areas_for(&grid, role)
    }

    /// Regrid a field whose `grid` attribute names its source grid.
    pub fn regrid(
        &self,
        field: &Field,
        target: &GridTarget,
        method: Option<Method>,
    ) -> Result<RegridOutput> {
        let source = field.grid().ok_or_else(|| {
            RegridError::invalid_field(format!(
                "field '{}' has no 'grid' attribute; use regrid_from",
                field.name
            ))
        })?;
        self.regrid_from(field, source, target, method)
    }

    /// Regrid a field from an explicitly named source grid.
    pub fn regrid_from(
        &self,
        field: &Field,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
    ) -> Result<RegridOutput> {
        let (plan, warnings) = self.plan_with(field, &BTreeMap::new(), source, target, method)?;
        Ok(RegridOutput {
            field: plan.execute()?,
            warnings,
        })
    }

    /// Prepare a deferred regrid of one field.
    pub fn plan(
        &self,
        field: &Field,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
    ) -> Result<(RegridPlan, Vec<RegridWarning>)> {
        self.plan_with(field, &BTreeMap::new(), source, target, method)
    }

    fn plan_with(
        &self,
        field: &Field,
        shared: &BTreeMap<String, Coord>,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
    ) -> Result<(RegridPlan, Vec<RegridWarning>)> {
        let source = self.resolver.resolve(source)?;
        let target = self.resolver.resolve_target(target)?;
        let mask_variant = self
            .resolver
            .mask_variant(&source.signature, &field.name, &field.attrs);

        let (binding, notes) = VerticalIndex::bind(field, shared, &source.name, &source.signature)?;

        // Level-dependent weights exist only where the grid ships a file per level.
        let vertical_dim = binding
            .dim()
            .filter(|dim| source.signature.path_for(&GridRole::Levels(dim.to_string())).is_some())
            .map(str::to_string);
        let binding = if vertical_dim.is_some() {
            binding
        } else {
            LevelBinding::None
        };

        let request = self.request_for(
            source.clone(),
            target.clone(),
            method,
            mask_variant,
            vertical_dim.as_deref(),
        )?;
        let context = request.context();

        let warnings: Vec<RegridWarning> = notes
            .into_iter()
            .map(|message| {
                warn!(variable = %field.name, %context, "{}", message);
                RegridWarning {
                    variable: field.name.clone(),
                    context: context.clone(),
                    message,
                }
            })
            .collect();

        let artifact = self.cache.get_or_compute(&request)?;
        // Per-level weights already encode the land mask of each level.
        let policy = if vertical_dim.is_some() {
            MissingPolicy::Renormalize
        } else {
            MissingPolicy::for_variant(mask_variant)
        };

        debug!(
            variable = %field.name,
            source = %source.name,
            target = %target.name,
            variant = %mask_variant,
            vertical_dim = ?vertical_dim,
            "Planned regrid"
        );

        let plan = RegridPlan::build(field, &source, &target, artifact, &binding, policy, context)?;
        Ok((plan, warnings))
    }

    /// Regrid every variable of a dataset that lives on the source grid.
    ///
    /// Variables without the source grid's spatial dimensions are copied.
    /// Dataset-level coordinates take part in the vertical analysis, which is
    /// where ambiguous selections are detected.
    pub fn regrid_dataset(
        &self,
        dataset: &Dataset,
        source: &str,
        target: &GridTarget,
        method: Option<Method>,
    ) -> Result<DatasetOutput> {
        let resolved = self.resolver.resolve(source)?;
        let space = &resolved.signature.space_coord;

        let on_grid = |f: &Field| space.iter().all(|d| f.has_dim(d));

        // A dataset-level level index belongs to the only variable without a
        // vertical dimension, if there is exactly one.
        let flat: Vec<&str> = dataset
            .fields
            .values()
            .filter(|f| on_grid(f) && !resolved.signature.vert_coord.iter().any(|d| f.has_dim(d)))
            .map(|f| f.name.as_str())
            .collect();
        let owner = match flat.as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        };

        let mut out = Dataset::new();
        let mut warnings = Vec::new();

        for field in dataset.fields.values() {
            if !on_grid(field) {
                out.insert(field.clone());
                continue;
            }
            let (plan, field_warnings) = if owner.as_deref() == Some(field.name.as_str()) {
                let field =
                    VerticalIndex::adopt(field.clone(), &dataset.coords, &resolved.signature);
                self.plan_with(&field, &dataset.coords, source, target, method)?
            } else {
                self.plan_with(field, &dataset.coords, source, target, method)?
            };
            out.insert(plan.execute()?);
            warnings.extend(field_warnings);
        }

        out.coords = dataset
            .coords
            .iter()
            .filter(|(_, c)| c.dim().map(|d| !space.iter().any(|s| s == d)).unwrap_or(true))
            .map(|(name, c)| (name.clone(), c.clone()))
            .collect();

        Ok(DatasetOutput {
            dataset: out,
            warnings,
        })
    }
}

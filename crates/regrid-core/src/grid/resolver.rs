//! Turns logical grid names into concrete signatures.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::registry::{GridDefinition, GridRegistry};
use super::regular::RegularGrid;
use super::signature::{GridRole, GridSignature, MaskRule, ResolvedGrid};
use crate::error::{RegridError, Result};
use crate::types::MaskVariant;

/// Execution context used to fill `{param}` placeholders in path templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveContext {
    /// Current machine identifier, available to templates as `{machine}`.
    pub machine: Option<String>,
    /// Run-time parameters such as `zoom` or `data`.
    pub params: BTreeMap<String, String>,
}

impl ResolveContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        if name == "machine" {
            return self.machine.as_deref();
        }
        self.params.get(name).map(String::as_str)
    }
}

/// A requested target grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridTarget {
    /// A registry name, resolved like a source grid.
    Named(String),
    /// Regular lon/lat shorthand; needs no registry entry or files.
    Regular(RegularGrid),
    /// An already resolved signature.
    Signature(ResolvedGrid),
}

impl GridTarget {
    /// Interpret a string as regular shorthand when possible, else as a name.
    pub fn parse(s: &str) -> Self {
        match RegularGrid::parse(s) {
            Some(grid) => Self::Regular(grid),
            None => Self::Named(s.to_string()),
        }
    }
}

impl From<&str> for GridTarget {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// Resolves names against the registry and the current execution context.
///
/// Pure lookup: the filesystem is only touched by [`GridResolver::validate`].
#[derive(Debug, Clone)]
pub struct GridResolver {
    registry: Arc<GridRegistry>,
    context: ResolveContext,
}

impl GridResolver {
    pub fn new(registry: Arc<GridRegistry>, context: ResolveContext) -> Self {
        Self { registry, context }
    }

    pub fn registry(&self) -> &GridRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ResolveContext {
        &self.context
    }

    /// Resolve a logical grid name (or regular shorthand) to a signature.
    pub fn resolve(&self, name: &str) -> Result<ResolvedGrid> {
        if let Some(def) = self.registry.get(name) {
            let signature = self.build(name, def)?;
            debug!(grid = %name, digest = %signature.digest(), "Resolved grid");
            return Ok(ResolvedGrid::new(name, signature));
        }
        if let Some(regular) = RegularGrid::parse(name) {
            return Ok(ResolvedGrid::new(
                regular.descriptor(),
                GridSignature::regular(&regular),
            ));
        }
        Err(RegridError::UnknownGrid(name.to_string()))
    }

    pub fn resolve_target(&self, target: &GridTarget) -> Result<ResolvedGrid> {
        match target {
            GridTarget::Named(name) => self.resolve(name),
            GridTarget::Regular(grid) => Ok(ResolvedGrid::new(
                grid.descriptor(),
                GridSignature::regular(grid),
            )),
            GridTarget::Signature(resolved) => Ok(resolved.clone()),
        }
    }

    /// Check that every file a signature declares exists.
    ///
    /// Regular-grid shorthands are descriptors, not files, and are skipped.
    pub fn validate(&self, grid: &ResolvedGrid) -> Result<()> {
        for (role, path) in &grid.signature.paths {
            if RegularGrid::parse(path).is_some() {
                continue;
            }
            if !Path::new(path).exists() {
                return Err(RegridError::config(format!(
                    "grid '{}': {} file {} does not exist",
                    grid.name, role, path
                )));
            }
        }
        Ok(())
    }

    /// Mask variant a variable uses on this grid.
    pub fn mask_variant(
        &self,
        grid: &GridSignature,
        variable: &str,
        attrs: &BTreeMap<String, String>,
    ) -> MaskVariant {
        if grid.mask.matches(variable, attrs) {
            MaskVariant::Masked
        } else {
            MaskVariant::Unmasked
        }
    }

    fn build(&self, name: &str, def: &GridDefinition) -> Result<GridSignature> {
        let mut paths = BTreeMap::new();
        for (key, template) in def.path_templates() {
            let role = GridRole::from_key(&key, &def.vert_coord).ok_or_else(|| {
                RegridError::config(format!("grid '{}': unknown path role '{}'", name, key))
            })?;
            paths.insert(role, render_template(name, &template, &self.context)?);
        }

        let mask = def
            .masked
            .as_ref()
            .map(|m| MaskRule {
                attributes: m.attributes.clone(),
                variables: m.variables.clone(),
            })
            .unwrap_or_default();

        Ok(GridSignature {
            paths,
            space_coord: def.space_coord.clone(),
            vert_coord: def.vert_coord.clone(),
            levels: def.levels.clone(),
            mask,
            extra: def.extra.clone(),
        })
    }
}

/// Replace `{param}` placeholders from the context.
fn render_template(grid: &str, template: &str, context: &ResolveContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            RegridError::config(format!(
                "grid '{}': unclosed placeholder in path template '{}'",
                grid, template
            ))
        })?;
        let param = after[..end].trim();
        let value = context
            .lookup(param)
            .ok_or_else(|| RegridError::TemplateResolution {
                grid: grid.to_string(),
                parameter: param.to_string(),
            })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
grids:
  fesom-core2:
    path:
      unmasked: "{data}/fesom/nodes.nc"
      masked: "{data}/fesom/nodes_masked.nc"
      nz1: "{data}/fesom/nz1.nc"
    space_coord: [ncells]
    vert_coord: [nz1]
    masked:
      attributes: { component: ocean }
      variables: [sst]
  healpix:
    path: "/pool/{machine}/hpz{zoom}_atm.nc"
    space_coord: [cell]
"#;

    fn resolver(context: ResolveContext) -> GridResolver {
        let registry = GridRegistry::from_yaml_str(REGISTRY).unwrap();
        GridResolver::new(Arc::new(registry), context)
    }

    #[test]
    fn test_resolve_with_parameters() {
        let r = resolver(
            ResolveContext::new()
                .with_machine("levante")
                .with_param("zoom", "7")
                .with_param("data", "/work/grids"),
        );

        let hp = r.resolve("healpix").unwrap();
        assert_eq!(
            hp.signature.path_for(&GridRole::Unmasked),
            Some("/pool/levante/hpz7_atm.nc")
        );

        let fesom = r.resolve("fesom-core2").unwrap();
        assert_eq!(
            fesom.signature.path_for(&GridRole::Levels("nz1".to_string())),
            Some("/work/grids/fesom/nz1.nc")
        );
        assert_eq!(fesom.name, "fesom-core2");
    }

    #[test]
    fn test_missing_parameter_is_template_error() {
        let r = resolver(ResolveContext::new().with_machine("levante"));
        let err = r.resolve("healpix").unwrap_err();
        assert!(matches!(
            err,
            RegridError::TemplateResolution { ref grid, ref parameter }
                if grid == "healpix" && parameter == "zoom"
        ));
    }

    #[test]
    fn test_unknown_grid() {
        let r = resolver(ResolveContext::new());
        assert!(matches!(r.resolve("era5"), Err(RegridError::UnknownGrid(name)) if name == "era5"));
    }

    #[test]
    fn test_regular_shorthand_needs_no_registry() {
        let r = resolver(ResolveContext::new());
        let a = r.resolve("r360x180").unwrap();
        let b = r.resolve_target(&GridTarget::parse("r360x180")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.signature.space_coord, vec!["lat", "lon"]);
        assert_eq!(a.as_regular(), Some(RegularGrid::new(360, 180)));
        assert!(r.validate(&a).is_ok());
    }

    #[test]
    fn test_mask_variant_selection() {
        let r = resolver(ResolveContext::new().with_param("data", "/d"));
        let fesom = r.resolve("fesom-core2").unwrap();

        let mut ocean = BTreeMap::new();
        ocean.insert("component".to_string(), "ocean".to_string());
        assert_eq!(
            r.mask_variant(&fesom.signature, "thetao", &ocean),
            MaskVariant::Masked
        );
        assert_eq!(
            r.mask_variant(&fesom.signature, "sst", &BTreeMap::new()),
            MaskVariant::Masked
        );
        assert_eq!(
            r.mask_variant(&fesom.signature, "tas", &BTreeMap::new()),
            MaskVariant::Unmasked
        );
    }

    #[test]
    fn test_validate_checks_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().to_string_lossy().to_string();
        let r = resolver(ResolveContext::new().with_param("data", data.clone()));
        let fesom = r.resolve("fesom-core2").unwrap();
        assert!(r.validate(&fesom).is_err());

        std::fs::create_dir_all(dir.path().join("fesom")).unwrap();
        for file in ["nodes.nc", "nodes_masked.nc", "nz1.nc"] {
            std::fs::write(dir.path().join("fesom").join(file), b"").unwrap();
        }
        assert!(r.validate(&fesom).is_ok());
    }
}

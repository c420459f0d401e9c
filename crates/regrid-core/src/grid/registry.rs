//! Declarative grid registry: logical grid name → signature template.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::config::expand_env_vars;
use crate::error::{RegridError, Result};

/// Path entry of a grid definition: one file, or one file per role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    Single(String),
    Roles(BTreeMap<String, String>),
}

/// Masking discriminator as written in the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskConfig {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeSet<String>,
}

/// One registry entry. Paths are templates resolved by [`super::GridResolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDefinition {
    pub path: PathSpec,
    #[serde(default = "default_space_coord")]
    pub space_coord: Vec<String>,
    #[serde(default)]
    pub vert_coord: Vec<String>,
    #[serde(default)]
    pub levels: BTreeMap<String, usize>,
    #[serde(default)]
    pub masked: Option<MaskConfig>,
    #[serde(default)]
    pub extra: Vec<String>,
}

fn default_space_coord() -> Vec<String> {
    vec!["lat".to_string(), "lon".to_string()]
}

impl GridDefinition {
    /// Template per role key, with a single path mapped to `unmasked`.
    pub fn path_templates(&self) -> BTreeMap<String, String> {
        match &self.path {
            PathSpec::Single(path) => {
                let mut map = BTreeMap::new();
                map.insert("unmasked".to_string(), path.clone());
                map
            }
            PathSpec::Roles(map) => map.clone(),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.space_coord.is_empty() {
            return Err(RegridError::config(format!(
                "grid '{}' declares no space_coord",
                name
            )));
        }
        let templates = self.path_templates();
        if templates.is_empty() {
            return Err(RegridError::config(format!("grid '{}' has no paths", name)));
        }
        for key in templates.keys() {
            if super::GridRole::from_key(key, &self.vert_coord).is_none() {
                return Err(RegridError::config(format!(
                    "grid '{}': path role '{}' is neither unmasked/masked nor a vertical dimension",
                    name, key
                )));
            }
        }
        for dim in self.levels.keys() {
            if !self.vert_coord.contains(dim) {
                return Err(RegridError::config(format!(
                    "grid '{}': level count given for '{}' which is not in vert_coord",
                    name, dim
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    grids: BTreeMap<String, GridDefinition>,
}

/// Read-only lookup of grid definitions by logical name.
#[derive(Debug, Clone, Default)]
pub struct GridRegistry {
    grids: BTreeMap<String, GridDefinition>,
}

impl GridRegistry {
    pub fn new(grids: BTreeMap<String, GridDefinition>) -> Result<Self> {
        for (name, def) in &grids {
            def.validate(name)?;
        }
        Ok(Self { grids })
    }

    /// Parse a YAML document with a top-level `grids:` mapping.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        let file: RegistryFile = serde_yaml::from_str(&expanded)
            .map_err(|e| RegridError::config(format!("failed to parse grid registry: {}", e)))?;
        Self::new(file.grids)
    }

    /// Load a registry file, or every `*.yaml`/`*.yml` file of a directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            let mut grids = BTreeMap::new();
            let mut entries: Vec<_> = fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| matches!(p.extension().and_then(|s| s.to_str()), Some("yaml" | "yml")))
                .collect();
            entries.sort();
            for file in entries {
                let registry = Self::load(&file)?;
                for (name, def) in registry.grids {
                    if grids.insert(name.clone(), def).is_some() {
                        return Err(RegridError::config(format!(
                            "grid '{}' defined more than once (last in {:?})",
                            name, file
                        )));
                    }
                }
            }
            return Self::new(grids);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            RegridError::config(format!("failed to read grid registry {:?}: {}", path, e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn get(&self, name: &str) -> Option<&GridDefinition> {
        self.grids.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.grids.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grids.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }
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
      nz1: "{data}/fesom/nz1_{zoom}.nc"
    space_coord: [ncells]
    vert_coord: [nz1]
    levels: { nz1: 47 }
    masked:
      attributes: { component: ocean }
  r100:
    path: r360x180
"#;

    #[test]
    fn test_parse_registry() {
        let registry = GridRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("r100"));

        let fesom = registry.get("fesom-core2").unwrap();
        assert_eq!(fesom.space_coord, vec!["ncells"]);
        assert_eq!(fesom.levels.get("nz1"), Some(&47));
        assert_eq!(fesom.path_templates().len(), 3);

        let r100 = registry.get("r100").unwrap();
        assert_eq!(r100.space_coord, vec!["lat", "lon"]);
        assert_eq!(
            r100.path_templates().get("unmasked").map(String::as_str),
            Some("r360x180")
        );
    }

    #[test]
    fn test_rejects_unknown_role() {
        let yaml = r#"
grids:
  broken:
    path: { nz: "/data/nz.nc" }
    space_coord: [ncells]
"#;
        let err = GridRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, RegridError::Config(msg) if msg.contains("'nz'")));
    }

    #[test]
    fn test_env_expansion_in_registry() {
        std::env::set_var("REGRID_TEST_GRID_DIR", "/scratch/grids");
        let yaml = r#"
grids:
  icon:
    path: "${REGRID_TEST_GRID_DIR}/icon_r2b4.nc"
    space_coord: [cell]
"#;
        let registry = GridRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(
            registry.get("icon").unwrap().path,
            PathSpec::Single("/scratch/grids/icon_r2b4.nc".to_string())
        );
    }

    #[test]
    fn test_load_directory_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.yaml"),
            "grids:\n  one:\n    path: r10x5\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.yml"),
            "grids:\n  two:\n    path: r20x10\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = GridRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["one", "two"]);
    }
}

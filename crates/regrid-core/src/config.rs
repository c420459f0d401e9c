//! Configuration for the regridding engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{RegridError, Result};
use crate::grid::{GridDefinition, ResolveContext};
use crate::types::Method;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegridConfig {
    pub cache: CacheConfig,

    /// Current machine identifier; selects an entry of `machines`.
    pub machine: Option<String>,

    /// Per-machine overrides, keyed by machine identifier.
    pub machines: BTreeMap<String, MachineConfig>,

    pub generator: GeneratorConfig,

    pub regrid: RegridDefaults,

    /// Declarative grid registry.
    pub grids: BTreeMap<String, GridDefinition>,
}

/// Persistent weight cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory root, unless a machine override applies.
    pub root: PathBuf,

    /// How long a failed computation is remembered.
    pub negative_ttl_secs: u64,

    /// Serve a superseded entry while another process is computing.
    pub allow_stale: bool,

    /// Number of decoded artifacts kept in memory.
    pub memory_entries: usize,

    /// Temporary files older than this are considered orphaned.
    pub partial_max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./regrid-cache"),
            negative_ttl_secs: 300,
            allow_stale: false,
            memory_entries: 32,
            partial_max_age_secs: 24 * 3600,
        }
    }
}

/// Settings that differ between execution environments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub cache_root: Option<PathBuf>,

    /// Extra template parameters for this machine.
    pub parameters: BTreeMap<String, String>,
}

/// External weight generator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Program to execute.
    pub program: String,

    /// Argument templates, see [`crate::generator::ExternalGenerator`].
    pub args: Vec<String>,

    /// Version tag recorded in every cache entry and cache key.
    pub version: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "regrid-weights".to_string(),
            args: vec![
                "--source".to_string(),
                "{source}".to_string(),
                "--target".to_string(),
                "{target}".to_string(),
                "--method".to_string(),
                "{method}".to_string(),
                "--mask".to_string(),
                "{mask}".to_string(),
                "--output".to_string(),
                "{output}".to_string(),
                "{extra}".to_string(),
            ],
            version: "1".to_string(),
        }
    }
}

/// Defaults for regrid calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegridDefaults {
    pub default_method: Method,

    pub default_target: Option<String>,

    /// Run-time template parameters such as `zoom`.
    pub parameters: BTreeMap<String, String>,
}

impl RegridConfig {
    /// Load a YAML configuration file, expanding `${VAR}` references first.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegridError::config(format!("failed to read {:?}: {}", path, e)))?;
        let config = Self::from_yaml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        serde_yaml::from_str(&expanded)
            .map_err(|e| RegridError::config(format!("failed to parse configuration: {}", e)))
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("REGRID_CACHE_ROOT") {
            self.cache.root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("REGRID_MACHINE") {
            if !val.is_empty() {
                self.machine = Some(val);
            }
        }

        if let Ok(val) = std::env::var("REGRID_NEGATIVE_TTL_SECS") {
            if let Ok(secs) = val.parse() {
                self.cache.negative_ttl_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("REGRID_ALLOW_STALE") {
            self.cache.allow_stale = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("REGRID_METHOD") {
            if let Ok(method) = Method::from_str(&val) {
                self.regrid.default_method = method;
            }
        }

        if let Ok(val) = std::env::var("REGRID_TARGET") {
            if !val.is_empty() {
                self.regrid.default_target = Some(val);
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cache.memory_entries == 0 {
            return Err(RegridError::config("cache.memory_entries must be > 0"));
        }

        if self.generator.version.trim().is_empty() {
            return Err(RegridError::config("generator.version cannot be empty"));
        }

        if let Some(machine) = &self.machine {
            if !self.machines.is_empty() && !self.machines.contains_key(machine) {
                return Err(RegridError::config(format!(
                    "machine '{}' has no entry under machines",
                    machine
                )));
            }
        }

        Ok(())
    }

    /// Cache directory for the current machine.
    ///
    /// The machine only changes where entries live, never their keys.
    pub fn cache_root(&self) -> PathBuf {
        self.machine
            .as_ref()
            .and_then(|m| self.machines.get(m))
            .and_then(|m| m.cache_root.clone())
            .unwrap_or_else(|| self.cache.root.clone())
    }

    /// Template parameters for the resolver: global, then machine, then `extra`.
    pub fn resolve_context(&self, extra: &BTreeMap<String, String>) -> ResolveContext {
        let mut params = self.regrid.parameters.clone();
        if let Some(machine) = self.machine.as_ref().and_then(|m| self.machines.get(m)) {
            params.extend(machine.parameters.clone());
        }
        params.extend(extra.clone());

        ResolveContext {
            machine: self.machine.clone(),
            params,
        }
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references from the environment.
///
/// A default may itself hold `{param}` path templates; braces are matched so
/// those survive for the grid resolver.
pub(crate) fn expand_env_vars(content: &str) -> Result<String> {
    expand_with(content, |name| std::env::var(name).ok())
}

fn expand_with(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let Some(end) = matching_brace(body) else {
            let offset = content.len() - rest.len() + start;
            let line = content[..offset].matches('\n').count() + 1;
            return Err(RegridError::config(format!(
                "unclosed '${{' on line {} of the configuration",
                line
            )));
        };
        out.push_str(&substitute(&body[..end], &lookup)?);
        rest = &body[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Byte offset of the `}` closing an already opened brace.
fn matching_brace(body: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn substitute(expr: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<String> {
    match expr.split_once(":-") {
        // Set-but-empty falls back to the default, as in the shell.
        Some((name, default)) => Ok(lookup(name.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())),
        None => lookup(expr.trim()).ok_or_else(|| {
            RegridError::config(format!("environment variable {} is not set", expr.trim()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegridConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.negative_ttl_secs, 300);
        assert_eq!(config.regrid.default_method, Method::Conservative);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("REGRID_TEST_SCRATCH", "/scratch/k20200");
        let out = expand_env_vars("root: ${REGRID_TEST_SCRATCH}/cache").unwrap();
        assert_eq!(out, "root: /scratch/k20200/cache");

        let out = expand_env_vars("root: ${REGRID_TEST_UNSET_VAR:-/tmp/cache}").unwrap();
        assert_eq!(out, "root: /tmp/cache");

        assert!(expand_env_vars("root: ${REGRID_TEST_UNSET_VAR}").is_err());
        assert_eq!(expand_env_vars("cost: $5").unwrap(), "cost: $5");
    }

    #[test]
    fn test_expansion_keeps_path_templates_in_defaults() {
        let lookup = |name: &str| match name {
            "POOL" => Some("/pool/data".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        };
        let out = expand_with(
            "a: ${POOL}/fesom\nb: ${GRIDS:-{grids_root}/hpz{zoom}.nc}\nc: ${EMPTY:-fallback}",
            lookup,
        )
        .unwrap();
        assert_eq!(
            out,
            "a: /pool/data/fesom\nb: {grids_root}/hpz{zoom}.nc\nc: fallback"
        );
        assert_eq!(expand_with("d: ${EMPTY}", lookup).unwrap(), "d: ");
    }

    #[test]
    fn test_unclosed_reference_reports_line() {
        let err = expand_with("cache:\n  root: ${UNCLOSED\n", |_| None).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_machine_overrides_cache_root() {
        let yaml = r#"
cache:
  root: /default/cache
machine: levante
machines:
  levante:
    cache_root: /work/ab0995/regrid
    parameters: { data: /pool/data }
  lumi:
    cache_root: /scratch/project/regrid
regrid:
  parameters: { zoom: "7", data: /home/data }
"#;
        let config = RegridConfig::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_root(), PathBuf::from("/work/ab0995/regrid"));

        let mut extra = BTreeMap::new();
        extra.insert("zoom".to_string(), "9".to_string());
        let context = config.resolve_context(&extra);
        assert_eq!(context.machine.as_deref(), Some("levante"));
        assert_eq!(context.params.get("data").map(String::as_str), Some("/pool/data"));
        assert_eq!(context.params.get("zoom").map(String::as_str), Some("9"));

        let mut other = config.clone();
        other.machine = None;
        assert_eq!(other.cache_root(), PathBuf::from("/default/cache"));
    }

    #[test]
    fn test_validate_rejects_unknown_machine() {
        let mut config = RegridConfig::default();
        config
            .machines
            .insert("levante".to_string(), MachineConfig::default());
        config.machine = Some("mistral".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grids_section_parses() {
        let yaml = r#"
generator:
  program: cdo
  args: ["gen{method},{target}", "{source}", "{output}"]
  version: "cdo-2.4"
grids:
  r100:
    path: r360x180
"#;
        let config = RegridConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.generator.program, "cdo");
        assert_eq!(config.generator.version, "cdo-2.4");
        assert!(config.grids.contains_key("r100"));
    }

    #[test]
    fn test_shipped_config_parses() {
        let config =
            RegridConfig::from_yaml_str(include_str!("../../../config/regrid.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.generator.args.last().map(String::as_str), Some("{extra}"));
        let registry = crate::grid::GridRegistry::new(config.grids.clone()).unwrap();
        assert!(registry.contains("fesom-core2"));
        assert_eq!(config.machines.len(), 2);
    }
}

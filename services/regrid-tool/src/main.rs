//! Weight cache maintenance tool.
//!
//! Computes, rebuilds, verifies and lists cached regridding weights from the
//! command line, using the same configuration and cache root as the library.

mod commands;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use regrid_core::{
    CacheSettings, ExternalGenerator, GridRegistry, GridResolver, MaskVariant, Method,
    RegridConfig, Regridder, WeightCache,
};

#[derive(Parser, Debug)]
#[command(name = "regrid-tool")]
#[command(about = "Manage the persistent regridding weight cache")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "REGRID_CONFIG", default_value = "config/regrid.yaml")]
    config: PathBuf,

    /// Grid registry file or directory (overrides `grids` in the config)
    #[arg(long, env = "REGRID_GRIDS")]
    grids: Option<PathBuf>,

    /// Machine identifier (overrides the config)
    #[arg(long)]
    machine: Option<String>,

    /// Extra template parameter, `key=value` (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Return the weights for a grid pair, computing them on a miss
    Weights(PairArgs),
    /// Invalidate and recompute the weights for a grid pair
    Rebuild(PairArgs),
    /// Structurally check the stored weights for a grid pair
    Verify(PairArgs),
    /// Show the cell areas of a grid, if computed
    Areas {
        /// Grid name or regular shorthand
        grid: String,
        /// File role: unmasked, masked or a vertical dimension
        #[arg(long, default_value = "unmasked")]
        role: String,
    },
    /// Resolve a grid name and check that its files exist
    Resolve {
        grid: String,
    },
    /// List promoted cache entries
    List,
    /// Remove orphaned temporary files and expired failure records
    Sweep {
        /// Minimum age in seconds (default: cache.partial_max_age_secs)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[derive(ClapArgs, Debug)]
struct PairArgs {
    /// Source grid name
    #[arg(short, long)]
    source: String,

    /// Target grid name or regular shorthand (default: regrid.default_target)
    #[arg(short, long)]
    target: Option<String>,

    /// Interpolation method (con, bil, nn, dis)
    #[arg(short, long)]
    method: Option<Method>,

    /// Use the masked variant of the source grid
    #[arg(long)]
    masked: bool,

    /// Compute per-level weights along this vertical dimension
    #[arg(long)]
    levels: Option<String>,
}

impl PairArgs {
    fn variant(&self) -> MaskVariant {
        if self.masked {
            MaskVariant::Masked
        } else {
            MaskVariant::Unmasked
        }
    }
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;
    info!(
        cache_root = %config.cache_root().display(),
        machine = ?config.machine,
        grids = config.grids.len(),
        "Loaded configuration"
    );

    let regridder = build_regridder(&args, &config)?;
    let output = commands::Output { json: args.json };

    match &args.command {
        Command::Weights(pair) => {
            let request = request_for(&regridder, &config, pair)?;
            let weights = regridder.cache().get_or_compute(&request)?;
            output.weights(regridder.cache(), &request, &weights)
        }
        Command::Rebuild(pair) => {
            let request = request_for(&regridder, &config, pair)?;
            let weights = regridder.cache().rebuild(&request)?;
            output.weights(regridder.cache(), &request, &weights)
        }
        Command::Verify(pair) => {
            let request = request_for(&regridder, &config, pair)?;
            let ok = regridder.cache().verify(&request)?;
            output.verified(regridder.cache(), &request, ok)?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Areas { grid, role } => {
            let resolved = regridder.resolver().resolve(grid)?;
            let role = regrid_core::GridRole::from_key(role, &resolved.signature.vert_coord)
                .with_context(|| format!("grid '{}' has no file role '{}'", grid, role))?;
            let areas = regridder.cache().areas_for(&resolved, &role)?;
            output.areas(grid, areas.as_ref())
        }
        Command::Resolve { grid } => {
            let resolved = regridder.resolver().resolve(grid)?;
            regridder.resolver().validate(&resolved)?;
            output.resolved(&resolved)
        }
        Command::List => output.list(&regridder.cache().list()?),
        Command::Sweep { max_age_secs } => {
            let max_age = max_age_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(regridder.cache().settings().partial_max_age);
            let removed = regridder.cache().sweep_partials(max_age)?;
            output.swept(removed)
        }
    }
}

fn load_config(args: &Args) -> Result<RegridConfig> {
    let mut config = if args.config.exists() {
        RegridConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "No configuration file, using defaults");
        RegridConfig::default()
    };
    config.apply_env();
    if let Some(machine) = &args.machine {
        config.machine = Some(machine.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_regridder(args: &Args, config: &RegridConfig) -> Result<Regridder> {
    let registry = match &args.grids {
        Some(path) => GridRegistry::load(path)?,
        None => GridRegistry::new(config.grids.clone())?,
    };
    let params: BTreeMap<String, String> = args.params.iter().cloned().collect();
    let resolver = GridResolver::new(Arc::new(registry), config.resolve_context(&params));

    let generator = Arc::new(ExternalGenerator::from_config(&config.generator));
    let cache = WeightCache::open(CacheSettings::from_config(config), generator)?;
    Ok(Regridder::new(
        resolver,
        Arc::new(cache),
        config.regrid.default_method,
    ))
}

fn request_for(
    regridder: &Regridder,
    config: &RegridConfig,
    pair: &PairArgs,
) -> Result<regrid_core::WeightRequest> {
    let target = match (&pair.target, &config.regrid.default_target) {
        (Some(target), _) | (None, Some(target)) => target.as_str(),
        (None, None) => bail!("no --target given and no regrid.default_target configured"),
    };
    Ok(regridder.request(
        &pair.source,
        &target.into(),
        pair.method,
        pair.variant(),
        pair.levels.as_deref(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("zoom=7").unwrap(),
            ("zoom".to_string(), "7".to_string())
        );
        assert_eq!(parse_param("empty=").unwrap().1, "");
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_pair_arguments() {
        let args = Args::try_parse_from([
            "regrid-tool",
            "--param",
            "zoom=7",
            "weights",
            "--source",
            "ocean",
            "--target",
            "r360x180",
            "--method",
            "nn",
            "--masked",
        ])
        .unwrap();
        assert_eq!(args.params, vec![("zoom".to_string(), "7".to_string())]);
        match args.command {
            Command::Weights(pair) => {
                assert_eq!(pair.method, Some(Method::Nearest));
                assert_eq!(pair.variant(), MaskVariant::Masked);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

//! Result printing for the cache commands.

use anyhow::Result;
use serde::Serialize;

use regrid_core::cache::{EntryInfo, EntryKind};
use regrid_core::{
    AreaArtifact, ResolvedGrid, WeightArtifact, WeightCache, WeightRequest, EARTH_RADIUS_M,
};

/// Prints command results as text or JSON on stdout.
pub struct Output {
    pub json: bool,
}

#[derive(Serialize)]
struct WeightsSummary<'a> {
    key: String,
    path: String,
    context: String,
    n_src: usize,
    n_dst: usize,
    nnz: usize,
    levels: Option<usize>,
    empty_rows: usize,
    generator_version: &'a str,
}

#[derive(Serialize)]
struct AreasSummary<'a> {
    grid: &'a str,
    cells: usize,
    total_m2: f64,
    covers_sphere: bool,
}

#[derive(Serialize)]
struct EntrySummary {
    kind: &'static str,
    key: Option<String>,
    path: String,
    size_bytes: u64,
    created_at: Option<String>,
    description: Option<String>,
    problem: Option<String>,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    pub fn weights(
        &self,
        cache: &WeightCache,
        request: &WeightRequest,
        weights: &WeightArtifact,
    ) -> Result<()> {
        let key = cache.key_for(request);
        let summary = WeightsSummary {
            path: cache
                .entry_path(&key, EntryKind::Weights)
                .display()
                .to_string(),
            key: key.to_string(),
            context: request.context().to_string(),
            n_src: weights.n_src(),
            n_dst: weights.n_dst(),
            nnz: weights.nnz(),
            levels: weights.weights.level_count(),
            empty_rows: weights
                .weights
                .matrices()
                .iter()
                .map(|m| m.empty_rows().len())
                .sum(),
            generator_version: cache.generator_version(),
        };
        self.emit(&summary, || {
            format!(
                "{}\n  {}\n  {} -> {} cells, {} non-zeros{}, {} empty target rows\n  {}",
                summary.key,
                summary.context,
                summary.n_src,
                summary.n_dst,
                summary.nnz,
                summary
                    .levels
                    .map(|n| format!(" over {} levels", n))
                    .unwrap_or_default(),
                summary.empty_rows,
                summary.path
            )
        })
    }

    pub fn verified(&self, cache: &WeightCache, request: &WeightRequest, ok: bool) -> Result<()> {
        let key = cache.key_for(request);
        let value = serde_json::json!({ "key": key.as_str(), "ok": ok });
        self.emit(&value, || {
            format!("{} {}", key.short(), if ok { "ok" } else { "FAILED" })
        })
    }

    pub fn areas(&self, grid: &str, areas: Option<&AreaArtifact>) -> Result<()> {
        let Some(areas) = areas else {
            return self.emit(&serde_json::Value::Null, || {
                format!("no cell areas cached for '{}'; compute weights first", grid)
            });
        };
        let summary = AreasSummary {
            grid,
            cells: areas.areas.len(),
            total_m2: areas.total(),
            covers_sphere: areas.covers_sphere(EARTH_RADIUS_M, 1e-6),
        };
        self.emit(&summary, || {
            format!(
                "{}: {} cells, {:.6e} m2{}",
                summary.grid,
                summary.cells,
                summary.total_m2,
                if summary.covers_sphere { " (full sphere)" } else { "" }
            )
        })
    }

    pub fn resolved(&self, grid: &ResolvedGrid) -> Result<()> {
        let value = serde_json::json!({
            "name": grid.name,
            "digest": grid.digest(),
            "signature": grid.signature,
        });
        self.emit(&value, || {
            let mut text = format!("{} {}", grid.name, grid.digest());
            for (role, path) in &grid.signature.paths {
                text.push_str(&format!("\n  {}: {}", role, path));
            }
            text
        })
    }

    pub fn list(&self, entries: &[EntryInfo]) -> Result<()> {
        let summaries: Vec<EntrySummary> = entries
            .iter()
            .map(|e| EntrySummary {
                kind: e.kind.dir_name(),
                key: e.meta.as_ref().map(|m| m.key.to_string()),
                path: e.path.display().to_string(),
                size_bytes: e.size_bytes,
                created_at: e.meta.as_ref().map(|m| m.created_at.to_rfc3339()),
                description: e.meta.as_ref().map(|m| m.describe()),
                problem: e.problem.clone(),
            })
            .collect();
        self.emit(&summaries, || {
            summaries
                .iter()
                .map(|s| {
                    format!(
                        "{:<8} {:>10}  {}  {}",
                        s.kind,
                        s.size_bytes,
                        s.created_at.as_deref().unwrap_or("-"),
                        s.description
                            .as_deref()
                            .or(s.problem.as_deref())
                            .unwrap_or(&s.path)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    pub fn swept(&self, removed: usize) -> Result<()> {
        let value = serde_json::json!({ "removed": removed });
        self.emit(&value, || format!("removed {} file(s)", removed))
    }
}

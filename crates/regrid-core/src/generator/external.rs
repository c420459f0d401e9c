//! Subprocess-based weight generator.

use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{GeneratedWeights, WeightGenerator, WeightRequest};
use crate::config::GeneratorConfig;
use crate::error::{RegridContext, RegridError, Result};
use crate::grid::GridRole;
use crate::weights::{AreaArtifact, LevelWeights, SparseWeights, WeightArtifact};

const OUTPUT_FILE: &str = "weights.json";

/// Runs a configured program to compute weights.
///
/// Argument templates may contain `{source}`, `{target}`, `{method}`,
/// `{mask}`, `{vertical}` and `{output}`. An argument that is exactly
/// `{extra}` is replaced by the extra options of both grids. The program
/// writes a JSON document to `{output}`:
///
/// ```json
/// {
///   "src_shape": [126858], "dst_shape": [180, 360],
///   "matrices": [{ "rows": [0, 1], "cols": [5, 9], "weights": [1.0, 1.0] }],
///   "src_area": [...], "dst_area": [...]
/// }
/// ```
///
/// `rows` index target cells and `cols` source cells. Per-level requests
/// produce one matrix per native level.
#[derive(Debug, Clone)]
pub struct ExternalGenerator {
    program: String,
    args: Vec<String>,
    version: String,
}

#[derive(Debug, Deserialize)]
struct GeneratorOutput {
    src_shape: Vec<usize>,
    dst_shape: Vec<usize>,
    matrices: Vec<TripletMatrix>,
    src_area: Vec<f64>,
    dst_area: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct TripletMatrix {
    rows: Vec<usize>,
    cols: Vec<usize>,
    weights: Vec<f64>,
}

impl ExternalGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, version: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            version: version.into(),
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.version.clone())
    }

    fn render_args(&self, request: &WeightRequest, source: &str, target: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        let vertical = request.vertical_dim.clone().unwrap_or_default();
        let mut args = Vec::with_capacity(self.args.len());

        for template in &self.args {
            if template == "{extra}" {
                args.extend(request.source.signature.extra.iter().cloned());
                args.extend(request.target.signature.extra.iter().cloned());
                continue;
            }
            args.push(
                template
                    .replace("{source}", source)
                    .replace("{target}", target)
                    .replace("{method}", request.method.as_str())
                    .replace("{mask}", request.mask_variant.as_str())
                    .replace("{vertical}", &vertical)
                    .replace("{output}", &output),
            );
        }

        args
    }

    fn convert(
        &self,
        request: &WeightRequest,
        context: &RegridContext,
        source_role: GridRole,
        target_role: GridRole,
        output: GeneratorOutput,
    ) -> Result<GeneratedWeights> {
        let fail = |msg: String| RegridError::weight_generation(context, msg);
        let n_src: usize = output.src_shape.iter().product();
        let n_dst: usize = output.dst_shape.iter().product();

        let mut matrices = Vec::with_capacity(output.matrices.len());
        for (i, m) in output.matrices.iter().enumerate() {
            let matrix = SparseWeights::from_triplets(n_src, n_dst, &m.rows, &m.cols, &m.weights)
                .map_err(|e| fail(format!("matrix {} in generator output: {}", i, e)))?;
            matrices.push(matrix);
        }

        let weights = match (&request.vertical_dim, matrices.len()) {
            (_, 0) => return Err(fail("generator output holds no matrices".to_string())),
            (None, 1) => LevelWeights::Uniform(matrices.remove(0)),
            (None, n) => {
                return Err(fail(format!(
                    "expected one matrix for a 2D request, generator returned {}",
                    n
                )))
            }
            (Some(dim), _) => LevelWeights::PerLevel {
                dim: dim.clone(),
                matrices,
            },
        };

        if output.src_area.len() != n_src || output.dst_area.len() != n_dst {
            return Err(fail(format!(
                "area vectors have {}/{} cells, grids have {}/{}",
                output.src_area.len(),
                output.dst_area.len(),
                n_src,
                n_dst
            )));
        }

        Ok(GeneratedWeights {
            weights: WeightArtifact {
                source: request.source.signature.clone(),
                target: request.target.signature.clone(),
                method: request.method,
                mask_variant: request.mask_variant,
                src_shape: output.src_shape.clone(),
                dst_shape: output.dst_shape.clone(),
                weights,
            },
            source_area: AreaArtifact {
                grid_digest: context.source_digest.clone(),
                role: source_role,
                shape: output.src_shape,
                areas: output.src_area,
            },
            target_area: AreaArtifact {
                grid_digest: context.target_digest.clone(),
                role: target_role,
                shape: output.dst_shape,
                areas: output.dst_area,
            },
        })
    }
}

impl WeightGenerator for ExternalGenerator {
    fn version(&self) -> &str {
        &self.version
    }

    fn compute(&self, request: &WeightRequest) -> Result<GeneratedWeights> {
        let context = request.context();
        let fail = |msg: String| RegridError::weight_generation(&context, msg);

        let source_role = request
            .source_role()
            .ok_or_else(|| fail("source grid has no file for this mask variant/level".to_string()))?;
        let target_role = request
            .target_role()
            .ok_or_else(|| fail("target grid has no unmasked file".to_string()))?;
        let source = request
            .source
            .signature
            .path_for(&source_role)
            .unwrap_or_default()
            .to_string();
        let target = request
            .target
            .signature
            .path_for(&target_role)
            .unwrap_or_default()
            .to_string();

        let scratch = tempfile::Builder::new()
            .prefix("regrid-weights-")
            .tempdir()
            .map_err(|e| fail(format!("cannot create scratch directory: {}", e)))?;
        let output_path = scratch.path().join(OUTPUT_FILE);
        let args = self.render_args(request, &source, &target, &output_path);

        debug!(program = %self.program, args = ?args, "Invoking weight generator");
        let start = Instant::now();

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(scratch.path())
            .output()
            .map_err(|e| fail(format!("failed to start {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                program = %self.program,
                status = %output.status,
                stderr = %stderr,
                "Weight generator failed"
            );
            return Err(fail(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr
            }));
        }

        let content = std::fs::read(&output_path)
            .map_err(|e| fail(format!("generator wrote no output {:?}: {}", output_path, e)))?;
        let parsed: GeneratorOutput = serde_json::from_slice(&content)
            .map_err(|e| fail(format!("malformed generator output: {}", e)))?;

        let generated = self.convert(request, &context, source_role, target_role, parsed)?;

        info!(
            source = %request.source.name,
            target = %request.target.name,
            method = %request.method,
            variant = %request.mask_variant,
            nnz = generated.weights.nnz(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generated weights"
        );

        Ok(generated)
    }
}

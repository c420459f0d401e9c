//! Deferred application of a weight artifact to one field.

use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{RegridContext, RegridError, Result};
use crate::field::{Coord, Field};
use crate::grid::ResolvedGrid;
use crate::vertical::LevelBinding;
use crate::weights::{MissingPolicy, WeightArtifact};

const DEFAULT_CHUNK_ROWS: usize = 64;

/// A regrid operation ready to run.
///
/// The input is laid out as rows of source cells, one row per combination of
/// the non-spatial dimensions. Rows are independent, so chunks of rows can be
/// executed in any order or in parallel; nothing is computed until
/// [`RegridPlan::execute`] or [`RegridPlan::execute_chunk`] runs.
#[derive(Debug, Clone)]
pub struct RegridPlan {
    artifact: Arc<WeightArtifact>,
    policy: MissingPolicy,
    context: RegridContext,
    input: Vec<f64>,
    n_rows: usize,
    /// Weight matrix index per row.
    row_matrix: Vec<usize>,
    chunk_rows: usize,

    name: String,
    attrs: BTreeMap<String, String>,
    coords: BTreeMap<String, Coord>,
    /// Non-spatial dimensions and lengths, in field order.
    other_dims: Vec<(String, usize)>,
    /// Where the target dimensions go among `other_dims`.
    insert_at: usize,
    target_dims: Vec<String>,
    target_shape: Vec<usize>,
    target_coords: BTreeMap<String, Coord>,
}

impl RegridPlan {
    pub(crate) fn build(
        field: &Field,
        source: &ResolvedGrid,
        target: &ResolvedGrid,
        artifact: Arc<WeightArtifact>,
        binding: &LevelBinding,
        policy: MissingPolicy,
        context: RegridContext,
    ) -> Result<Self> {
        let mismatch = |msg: String| RegridError::shape_mismatch(&source.name, msg, Some(&context));

        let space = &source.signature.space_coord;
        let mut spatial_axes = Vec::with_capacity(space.len());
        for dim in space {
            let axis = field.axis(dim).ok_or_else(|| {
                mismatch(format!(
                    "field '{}' lacks spatial dimension '{}' (has {:?})",
                    field.name, dim, field.dims
                ))
            })?;
            spatial_axes.push(axis);
        }
        let spatial_shape: Vec<usize> = spatial_axes.iter().map(|&a| field.shape()[a]).collect();
        let n_src: usize = spatial_shape.iter().product();

        let shape_matches = if artifact.src_shape.len() == spatial_shape.len() {
            artifact.src_shape == spatial_shape
        } else {
            artifact.n_src() == n_src
        };
        if !shape_matches {
            return Err(mismatch(format!(
                "field '{}' has spatial shape {:?} but the grid has {:?}",
                field.name, spatial_shape, artifact.src_shape
            )));
        }

        let other_axes: Vec<usize> = (0..field.dims.len())
            .filter(|a| !spatial_axes.contains(a))
            .collect();
        let other_dims: Vec<(String, usize)> = other_axes
            .iter()
            .map(|&a| (field.dims[a].clone(), field.shape()[a]))
            .collect();
        let insert_at = other_axes
            .iter()
            .filter(|&&a| a < spatial_axes.iter().copied().min().unwrap_or(0))
            .count();
        let n_rows: usize = other_dims.iter().map(|(_, len)| len).product();

        let mut permutation = other_axes.clone();
        permutation.extend(&spatial_axes);
        let input: Vec<f64> = field
            .data
            .view()
            .permuted_axes(IxDyn(&permutation))
            .iter()
            .copied()
            .collect();

        let row_matrix = Self::row_levels(binding, &other_axes, &other_dims, n_rows)
            .into_iter()
            .map(|level| match (level, artifact.weights.level_count()) {
                (_, None) => Ok(0),
                (Some(level), Some(count)) if level < count => Ok(level),
                (Some(level), Some(count)) => Err(mismatch(format!(
                    "native level {} is out of range, the grid has {} levels",
                    level, count
                ))),
                (None, Some(_)) => Err(mismatch(
                    "per-level weights need a vertical index".to_string(),
                )),
            })
            .collect::<Result<Vec<usize>>>()?;

        let target_dims = target.signature.space_coord.clone();
        let target_shape = if artifact.dst_shape.len() == target_dims.len() {
            artifact.dst_shape.clone()
        } else if target_dims.len() == 1 {
            vec![artifact.n_dst()]
        } else {
            return Err(RegridError::shape_mismatch(
                &target.name,
                format!(
                    "weights produce shape {:?} for dimensions {:?}",
                    artifact.dst_shape, target_dims
                ),
                Some(&context),
            ));
        };
        if let Some(clash) = target_dims
            .iter()
            .find(|d| other_dims.iter().any(|(o, _)| o == *d))
        {
            return Err(RegridError::invalid_field(format!(
                "target dimension '{}' already exists on field '{}'",
                clash, field.name
            )));
        }

        let mut target_coords = BTreeMap::new();
        if let Some(regular) = target.as_regular() {
            target_coords.insert("lat".to_string(), Coord::float("lat", regular.lat_centres()));
            target_coords.insert("lon".to_string(), Coord::float("lon", regular.lon_centres()));
        }

        let coords = field
            .coords
            .iter()
            .filter(|(_, c)| c.dim().map(|d| !space.iter().any(|s| s == d)).unwrap_or(true))
            .map(|(name, c)| (name.clone(), c.clone()))
            .collect();

        let mut attrs = field.attrs.clone();
        attrs.insert("grid".to_string(), target.name.clone());

        Ok(Self {
            artifact,
            policy,
            context,
            input,
            n_rows,
            row_matrix,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            name: field.name.clone(),
            attrs,
            coords,
            other_dims,
            insert_at,
            target_dims,
            target_shape,
            target_coords,
        })
    }

    /// Native level of every row, `None` when weights do not vary by level.
    fn row_levels(
        binding: &LevelBinding,
        other_axes: &[usize],
        other_dims: &[(String, usize)],
        n_rows: usize,
    ) -> Vec<Option<usize>> {
        match binding {
            LevelBinding::None => vec![None; n_rows],
            LevelBinding::Scalar { level, .. } => vec![Some(*level); n_rows],
            LevelBinding::Dimension { axis, levels, .. } => {
                let Some(pos) = other_axes.iter().position(|a| a == axis) else {
                    return vec![None; n_rows];
                };
                let len = other_dims[pos].1;
                let stride: usize = other_dims[pos + 1..].iter().map(|(_, l)| l).product();
                (0..n_rows)
                    .map(|row| levels.get((row / stride.max(1)) % len.max(1)).copied())
                    .collect()
            }
        }
    }

    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows.max(1);
        self
    }

    pub fn artifact(&self) -> &Arc<WeightArtifact> {
        &self.artifact
    }

    pub fn context(&self) -> &RegridContext {
        &self.context
    }

    pub fn rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_chunks(&self) -> usize {
        self.n_rows.div_ceil(self.chunk_rows)
    }

    fn apply_row(&self, row: usize, dst: &mut [f64]) {
        let n_src = self.artifact.n_src();
        let matrix = &self.artifact.weights.matrices()[self.row_matrix[row]];
        matrix.apply(&self.input[row * n_src..(row + 1) * n_src], dst, self.policy);
    }

    /// Compute one chunk of rows, returning `rows x n_dst` values.
    pub fn execute_chunk(&self, chunk: usize) -> Result<Vec<f64>> {
        if chunk >= self.n_chunks() {
            return Err(RegridError::invalid_field(format!(
                "chunk {} out of range ({} chunks)",
                chunk,
                self.n_chunks()
            )));
        }
        let n_dst = self.artifact.n_dst();
        let start = chunk * self.chunk_rows;
        let end = (start + self.chunk_rows).min(self.n_rows);

        let mut out = vec![0.0; (end - start) * n_dst];
        if n_dst > 0 {
            for (i, dst) in out.chunks_mut(n_dst).enumerate() {
                self.apply_row(start + i, dst);
            }
        }
        Ok(out)
    }

    /// Compute every row in parallel and build the output field.
    pub fn execute(&self) -> Result<Field> {
        let n_dst = self.artifact.n_dst();
        let mut out = vec![0.0; self.n_rows * n_dst];
        if n_dst > 0 {
            out.par_chunks_mut(n_dst)
                .enumerate()
                .for_each(|(row, dst)| self.apply_row(row, dst));
        }
        self.assemble_flat(out)
    }

    /// Build the output field from chunk results in chunk order.
    pub fn assemble(&self, chunks: Vec<Vec<f64>>) -> Result<Field> {
        if chunks.len() != self.n_chunks() {
            return Err(RegridError::invalid_field(format!(
                "expected {} chunks, got {}",
                self.n_chunks(),
                chunks.len()
            )));
        }
        self.assemble_flat(chunks.concat())
    }

    fn assemble_flat(&self, values: Vec<f64>) -> Result<Field> {
        let mut shape: Vec<usize> = self.other_dims.iter().map(|(_, l)| *l).collect();
        shape.extend(&self.target_shape);
        let stacked = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| RegridError::invalid_field(format!("output shape: {}", e)))?;

        // Move the target dimensions from the end to where the source ones were.
        let n_other = self.other_dims.len();
        let n_target = self.target_dims.len();
        let mut order: Vec<usize> = (0..self.insert_at).collect();
        order.extend(n_other..n_other + n_target);
        order.extend(self.insert_at..n_other);
        let data = stacked
            .permuted_axes(IxDyn(&order))
            .as_standard_layout()
            .into_owned();

        let mut dims: Vec<String> = self.other_dims.iter().map(|(d, _)| d.clone()).collect();
        for (i, dim) in self.target_dims.iter().enumerate() {
            dims.insert(self.insert_at + i, dim.clone());
        }

        let mut field = Field::new(self.name.clone(), dims, data)?;
        field.attrs = self.attrs.clone();
        for (name, coord) in self.coords.iter().chain(&self.target_coords) {
            field.set_coord(name.clone(), coord.clone())?;
        }
        Ok(field)
    }
}

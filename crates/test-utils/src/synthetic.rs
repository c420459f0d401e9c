//! A deterministic in-process weight generator for regular grids.
//!
//! Grid files are regular-grid shorthands (`r8x4`), so every role of a grid
//! can be turned into geometry without reading anything from disk.
//! Conservative weights are exact spherical overlap fractions; every other
//! method is served as nearest neighbour.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use regrid_core::{
    AreaArtifact, GeneratedWeights, GridRole, LevelWeights, RegridError, RegularGrid,
    ResolvedGrid, Result, SparseWeights, WeightArtifact, WeightGenerator, WeightRequest,
    EARTH_RADIUS_M,
};

/// Whether cell `(j, i)` of `grid` is land at `level`.
///
/// Every fifth cell along a diagonal pattern is land on all levels; deeper
/// levels additionally lose their westernmost `level` columns.
pub fn is_land(grid: &RegularGrid, j: usize, i: usize, level: Option<usize>) -> bool {
    let surface = (i + 2 * j) % 5 == 0;
    let bathymetry = level.map(|l| i < l.min(grid.nlon - 1)).unwrap_or(false);
    surface || bathymetry
}

/// Land mask of a grid in `[lat, lon]` order.
pub fn land_mask(grid: &RegularGrid, level: Option<usize>) -> Vec<bool> {
    (0..grid.nlat)
        .flat_map(|j| (0..grid.nlon).map(move |i| (j, i)))
        .map(|(j, i)| is_land(grid, j, i, level))
        .collect()
}

/// Cell areas in square metres, `[lat, lon]` order.
pub fn cell_areas(grid: &RegularGrid) -> Vec<f64> {
    let dlon = grid.dlon().to_radians();
    let edges = grid.lat_edges();
    let mut areas = Vec::with_capacity(grid.size());
    for j in 0..grid.nlat {
        let band = edges[j + 1].to_radians().sin() - edges[j].to_radians().sin();
        for _ in 0..grid.nlon {
            areas.push(EARTH_RADIUS_M * EARTH_RADIUS_M * dlon * band);
        }
    }
    areas
}

/// Weight generator used by tests.
///
/// Counts its invocations, can be slowed down to widen race windows, and can
/// be switched into a failing mode.
#[derive(Debug)]
pub struct SyntheticGenerator {
    version: String,
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl Default for SyntheticGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticGenerator {
    pub fn new() -> Self {
        Self {
            version: "synthetic-1".to_string(),
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// A generator whose every run fails.
    pub fn failing() -> Self {
        let generator = Self::new();
        generator.set_failing(true);
        generator
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `compute` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn geometry(grid: &ResolvedGrid, role: Option<GridRole>) -> std::result::Result<RegularGrid, String> {
    let role = role.ok_or_else(|| format!("grid '{}' has no file for this request", grid.name))?;
    grid.signature
        .path_for(&role)
        .and_then(RegularGrid::parse)
        .ok_or_else(|| format!("grid '{}' {} file is not a regular grid", grid.name, role))
}

fn storage_shape(grid: &ResolvedGrid, geometry: &RegularGrid) -> Vec<usize> {
    if grid.signature.space_coord.len() == 1 {
        vec![geometry.size()]
    } else {
        geometry.shape()
    }
}

/// Pairwise overlap of two 1D partitions, `overlap[d][s]`.
fn overlaps(dst: &[f64], src: &[f64], measure: impl Fn(f64, f64) -> f64) -> Vec<Vec<(usize, f64)>> {
    dst.windows(2)
        .map(|d| {
            src.windows(2)
                .enumerate()
                .filter_map(|(s, e)| {
                    let lo = d[0].max(e[0]);
                    let hi = d[1].min(e[1]);
                    (hi > lo).then(|| (s, measure(lo, hi)))
                })
                .collect()
        })
        .collect()
}

fn conservative(
    src: &RegularGrid,
    dst: &RegularGrid,
    land: &[bool],
) -> std::result::Result<SparseWeights, String> {
    let lon = overlaps(&dst.lon_edges(), &src.lon_edges(), |lo, hi| (hi - lo).to_radians());
    let lat = overlaps(&dst.lat_edges(), &src.lat_edges(), |lo, hi| {
        hi.to_radians().sin() - lo.to_radians().sin()
    });

    let (mut rows, mut cols, mut weights) = (Vec::new(), Vec::new(), Vec::new());
    for jd in 0..dst.nlat {
        for id in 0..dst.nlon {
            let row = jd * dst.nlon + id;
            let mut cells = Vec::new();
            for &(js, wlat) in &lat[jd] {
                for &(is, wlon) in &lon[id] {
                    let col = js * src.nlon + is;
                    if !land[col] {
                        cells.push((col, wlat * wlon));
                    }
                }
            }
            let total: f64 = cells.iter().map(|(_, w)| w).sum();
            if total <= 0.0 {
                continue;
            }
            for (col, w) in cells {
                rows.push(row);
                cols.push(col);
                weights.push(w / total);
            }
        }
    }
    SparseWeights::from_triplets(src.size(), dst.size(), &rows, &cols, &weights)
}

fn unit_vector(lat: f64, lon: f64) -> [f64; 3] {
    let (lat, lon) = (lat.to_radians(), lon.to_radians());
    [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
}

fn nearest(
    src: &RegularGrid,
    dst: &RegularGrid,
    land: &[bool],
) -> std::result::Result<SparseWeights, String> {
    let src_points: Vec<(usize, [f64; 3])> = src
        .lat_centres()
        .iter()
        .enumerate()
        .flat_map(|(j, &lat)| {
            src.lon_centres()
                .into_iter()
                .enumerate()
                .map(move |(i, lon)| (j * src.nlon + i, unit_vector(lat, lon)))
        })
        .filter(|(col, _)| !land[*col])
        .collect();

    let (mut rows, mut cols) = (Vec::new(), Vec::new());
    for (jd, &lat) in dst.lat_centres().iter().enumerate() {
        for (id, &lon) in dst.lon_centres().iter().enumerate() {
            let p = unit_vector(lat, lon);
            let best = src_points.iter().max_by(|a, b| {
                let da = a.1[0] * p[0] + a.1[1] * p[1] + a.1[2] * p[2];
                let db = b.1[0] * p[0] + b.1[1] * p[1] + b.1[2] * p[2];
                da.total_cmp(&db)
            });
            if let Some((col, _)) = best {
                rows.push(jd * dst.nlon + id);
                cols.push(*col);
            }
        }
    }
    let weights = vec![1.0; rows.len()];
    SparseWeights::from_triplets(src.size(), dst.size(), &rows, &cols, &weights)
}

impl WeightGenerator for SyntheticGenerator {
    fn version(&self) -> &str {
        &self.version
    }

    fn compute(&self, request: &WeightRequest) -> Result<GeneratedWeights> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let context = request.context();
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RegridError::weight_generation(
                &context,
                "synthetic generator configured to fail",
            ));
        }

        let fail = |msg: String| RegridError::weight_generation(&context, msg);
        let src = geometry(&request.source, request.source_role()).map_err(fail)?;
        let dst = geometry(&request.target, request.target_role()).map_err(fail)?;

        let matrix = |level: Option<usize>| {
            let land = if request.mask_variant.is_masked() || level.is_some() {
                land_mask(&src, level)
            } else {
                vec![false; src.size()]
            };
            if request.method.is_conservative() {
                conservative(&src, &dst, &land)
            } else {
                nearest(&src, &dst, &land)
            }
        };

        let weights = match &request.vertical_dim {
            Some(dim) => {
                let count = request.source.signature.levels.get(dim).copied().ok_or_else(|| {
                    fail(format!("grid '{}' declares no level count for '{}'", request.source.name, dim))
                })?;
                LevelWeights::PerLevel {
                    dim: dim.clone(),
                    matrices: (0..count)
                        .map(|l| matrix(Some(l)))
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(fail)?,
                }
            }
            None => LevelWeights::Uniform(matrix(None).map_err(fail)?),
        };

        let src_shape = storage_shape(&request.source, &src);
        let dst_shape = storage_shape(&request.target, &dst);

        Ok(GeneratedWeights {
            source_area: AreaArtifact {
                grid_digest: request.source.digest(),
                role: request.source_role().unwrap_or(GridRole::Unmasked),
                shape: src_shape.clone(),
                areas: cell_areas(&src),
            },
            target_area: AreaArtifact {
                grid_digest: request.target.digest(),
                role: GridRole::Unmasked,
                shape: dst_shape.clone(),
                areas: cell_areas(&dst),
            },
            weights: WeightArtifact {
                source: request.source.signature.clone(),
                target: request.target.signature.clone(),
                method: request.method,
                mask_variant: request.mask_variant,
                src_shape,
                dst_shape,
                weights,
            },
        })
    }
}

//! Field generators for creating synthetic climate-like data.
//!
//! These generators create predictable, verifiable test fields on regular
//! grids that can be used across the test suite.

use ndarray::{ArrayD, IxDyn};
use regrid_core::{Coord, Field, RegularGrid};

use crate::synthetic::is_land;

/// A smooth temperature-like pattern in Kelvin.
///
/// Values range from roughly 255K at the poles to 305K at the equator, with
/// a zonal wave so that longitude matters too.
pub fn smooth_pattern(lat: f64, lon: f64) -> f64 {
    275.0 + 25.0 * lat.to_radians().cos() + 5.0 * (2.0 * lon.to_radians()).sin()
}

/// Creates a `[lat, lon]` field by evaluating `f(lat, lon)` at cell centres.
///
/// The field carries `lat`/`lon` coordinates.
///
/// # Example
///
/// ```
/// use regrid_core::RegularGrid;
/// use test_utils::regular_field;
///
/// let field = regular_field("tas", &RegularGrid::new(8, 4), |lat, _| lat);
/// assert_eq!(field.shape(), &[4, 8]);
/// assert_eq!(field.data[[0, 0]], -67.5);
/// ```
pub fn regular_field(name: &str, grid: &RegularGrid, f: impl Fn(f64, f64) -> f64) -> Field {
    let lats = grid.lat_centres();
    let lons = grid.lon_centres();
    let data = ArrayD::from_shape_fn(IxDyn(&grid.shape()), |ix| f(lats[ix[0]], lons[ix[1]]));
    Field::new(name, dims(&["lat", "lon"]), data)
        .and_then(|field| field.with_coord("lat", Coord::float("lat", lats.clone())))
        .and_then(|field| field.with_coord("lon", Coord::float("lon", lons.clone())))
        .expect("regular grid field is consistent")
}

/// Creates a `[vert_dim, lat, lon]` field with `f(level, lat, lon)`.
///
/// No vertical index is attached; the caller decides whether to attach one.
pub fn level_field(
    name: &str,
    vert_dim: &str,
    levels: usize,
    grid: &RegularGrid,
    f: impl Fn(usize, f64, f64) -> f64,
) -> Field {
    let lats = grid.lat_centres();
    let lons = grid.lon_centres();
    let data = ArrayD::from_shape_fn(IxDyn(&[levels, grid.nlat, grid.nlon]), |ix| {
        f(ix[0], lats[ix[1]], lons[ix[2]])
    });
    Field::new(name, dims(&[vert_dim, "lat", "lon"]), data)
        .and_then(|field| field.with_coord("lat", Coord::float("lat", lats.clone())))
        .and_then(|field| field.with_coord("lon", Coord::float("lon", lons.clone())))
        .expect("level field is consistent")
}

/// Creates a `[time, lat, lon]` field where each step is the smooth pattern
/// shifted by the step index.
pub fn time_series_field(name: &str, grid: &RegularGrid, steps: usize) -> Field {
    let lats = grid.lat_centres();
    let lons = grid.lon_centres();
    let data = ArrayD::from_shape_fn(IxDyn(&[steps, grid.nlat, grid.nlon]), |ix| {
        smooth_pattern(lats[ix[1]], lons[ix[2]]) + ix[0] as f64
    });
    let hours: Vec<f64> = (0..steps).map(|t| t as f64 * 6.0).collect();
    Field::new(name, dims(&["time", "lat", "lon"]), data)
        .and_then(|field| field.with_coord("time", Coord::float("time", hours)))
        .expect("time series field is consistent")
}

/// Creates a field on an unstructured view of `grid`, one `ncells` dimension
/// in `[lat, lon]` order.
pub fn cell_field(name: &str, grid: &RegularGrid, f: impl Fn(f64, f64) -> f64) -> Field {
    let lats = grid.lat_centres();
    let lons = grid.lon_centres();
    let values: Vec<f64> = lats
        .iter()
        .flat_map(|&lat| lons.iter().map(move |&lon| (lat, lon)))
        .map(|(lat, lon)| f(lat, lon))
        .collect();
    let data = ArrayD::from_shape_vec(IxDyn(&[grid.size()]), values)
        .expect("cell count matches grid size");
    Field::new(name, dims(&["ncells"]), data).expect("cell field is consistent")
}

/// Sets land cells (see [`crate::is_land`]) to `NaN`.
///
/// `level` selects the bathymetry; for fields with a leading vertical
/// dimension, pass `None` to mask each level with its own index.
pub fn mask_land(mut field: Field, grid: &RegularGrid, level: Option<usize>) -> Field {
    let ndim = field.dims.len();
    for (ix, value) in field.data.indexed_iter_mut() {
        let (j, i) = (ix[ndim - 2], ix[ndim - 1]);
        let level = level.or_else(|| (ndim == 3).then(|| ix[0]));
        if is_land(grid, j, i, level) {
            *value = f64::NAN;
        }
    }
    field
}

fn dims(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_field_layout() {
        let grid = RegularGrid::new(8, 4);
        let field = regular_field("tas", &grid, |_, lon| lon);
        assert_eq!(field.dims, vec!["lat", "lon"]);
        assert_eq!(field.data[[0, 1]], 67.5);
        assert!(field.coords.contains_key("lat"));
    }

    #[test]
    fn test_level_field_layout() {
        let field = level_field("thetao", "nz1", 5, &RegularGrid::new(8, 4), |l, _, _| l as f64);
        assert_eq!(field.shape(), &[5, 4, 8]);
        assert_eq!(field.data[[3, 2, 1]], 3.0);
    }

    #[test]
    fn test_mask_land_per_level() {
        let grid = RegularGrid::new(8, 4);
        let field = mask_land(level_field("thetao", "nz1", 3, &grid, |_, _, _| 1.0), &grid, None);
        // Column 0 is land below the surface level.
        assert!(field.data[[2, 1, 0]].is_nan());
        assert!(!field.data[[0, 1, 0]].is_nan());
        // (j=0, i=0) is land on every level.
        assert!(field.data[[0, 0, 0]].is_nan());
    }

    #[test]
    fn test_cell_field_matches_regular_order() {
        let grid = RegularGrid::new(8, 4);
        let cells = cell_field("tas", &grid, smooth_pattern);
        let regular = regular_field("tas", &grid, smooth_pattern);
        assert_eq!(cells.data.as_slice().unwrap(), regular.data.as_slice().unwrap());
    }
}

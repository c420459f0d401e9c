//! Regular lon/lat grid shorthand (`r360x180`).

/// A global regular lon/lat grid with cell edges at multiples of the spacing.
///
/// Longitudes run eastward from 0°, latitudes northward from -90°, so the
/// data layout of a field on this grid is `[lat, lon]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegularGrid {
    pub nlon: usize,
    pub nlat: usize,
}

impl RegularGrid {
    pub fn new(nlon: usize, nlat: usize) -> Self {
        Self { nlon, nlat }
    }

    /// Parse `rNLONxNLAT` (case-insensitive). Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let body = s.strip_prefix('r').or_else(|| s.strip_prefix('R'))?;
        let (nlon, nlat) = body.split_once(['x', 'X'])?;
        let nlon: usize = nlon.parse().ok()?;
        let nlat: usize = nlat.parse().ok()?;
        if nlon == 0 || nlat == 0 {
            return None;
        }
        Some(Self { nlon, nlat })
    }

    pub fn descriptor(&self) -> String {
        format!("r{}x{}", self.nlon, self.nlat)
    }

    /// Shape in storage order `[lat, lon]`.
    pub fn shape(&self) -> Vec<usize> {
        vec![self.nlat, self.nlon]
    }

    pub fn size(&self) -> usize {
        self.nlon * self.nlat
    }

    pub fn dlon(&self) -> f64 {
        360.0 / self.nlon as f64
    }

    pub fn dlat(&self) -> f64 {
        180.0 / self.nlat as f64
    }

    /// Cell-centre longitudes in degrees.
    pub fn lon_centres(&self) -> Vec<f64> {
        let d = self.dlon();
        (0..self.nlon).map(|i| (i as f64 + 0.5) * d).collect()
    }

    /// Cell-centre latitudes in degrees, south to north.
    pub fn lat_centres(&self) -> Vec<f64> {
        let d = self.dlat();
        (0..self.nlat).map(|j| -90.0 + (j as f64 + 0.5) * d).collect()
    }

    /// Longitude edges in degrees (`nlon + 1` values).
    pub fn lon_edges(&self) -> Vec<f64> {
        let d = self.dlon();
        (0..=self.nlon).map(|i| i as f64 * d).collect()
    }

    /// Latitude edges in degrees (`nlat + 1` values).
    pub fn lat_edges(&self) -> Vec<f64> {
        let d = self.dlat();
        (0..=self.nlat).map(|j| -90.0 + j as f64 * d).collect()
    }
}

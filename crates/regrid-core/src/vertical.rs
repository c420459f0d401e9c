//! Vertical index tracking.
//!
//! A 3D field carries a hidden integer coordinate `idx_<dim>` that records,
//! for every vertical position still present, its index in the grid's native
//! level list. Level selections carry it along (as a scalar when the dimension
//! is dropped), so the regridder can pick the matching per-level weights.

use std::collections::BTreeMap;

use crate::error::{RegridError, Result};
use crate::field::{Coord, Field};
use crate::grid::GridSignature;

const INDEX_PREFIX: &str = "idx_";

/// Native level indices of one vertical dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerticalIndex {
    pub dim: String,
    pub levels: Vec<usize>,
    /// Whether the vertical dimension itself has been dropped.
    pub scalar: bool,
}

/// How a field's data maps onto per-level weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelBinding {
    /// Apply one weight matrix uniformly.
    None,
    /// The field still has the vertical dimension at `axis`.
    Dimension {
        dim: String,
        axis: usize,
        levels: Vec<usize>,
    },
    /// A single level survived a selection that dropped the dimension.
    Scalar { dim: String, level: usize },
}

impl LevelBinding {
    pub fn dim(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Dimension { dim, .. } | Self::Scalar { dim, .. } => Some(dim),
        }
    }
}

impl VerticalIndex {
    /// Coordinate name used for a vertical dimension.
    pub fn coord_name(dim: &str) -> String {
        format!("{}{}", INDEX_PREFIX, dim)
    }

    /// Attach `idx_<dim>` = `0..N` for every vertical dimension of the grid
    /// the field has.
    ///
    /// Fails with `GridShapeMismatch` if a vertical dimension's length differs
    /// from the level count the grid declares. Existing indices are kept.
    pub fn attach(mut field: Field, grid_name: &str, signature: &GridSignature) -> Result<Field> {
        for dim in &signature.vert_coord {
            let Some(len) = field.dim_len(dim) else {
                continue;
            };
            if let Some(&declared) = signature.levels.get(dim) {
                if declared != len {
                    return Err(RegridError::shape_mismatch(
                        grid_name,
                        format!(
                            "field '{}' has {} levels along '{}' but the grid declares {}",
                            field.name, len, dim, declared
                        ),
                        None,
                    ));
                }
            }
            let name = Self::coord_name(dim);
            if field.coords.contains_key(&name) {
                continue;
            }
            field.set_coord(name, Coord::index(dim.clone(), (0..len).collect()))?;
        }
        Ok(field)
    }

    /// Index of `dim` carried by the field itself, if any.
    pub fn read(field: &Field, dim: &str) -> Option<VerticalIndex> {
        let coord = field.coords.get(&Self::coord_name(dim))?;
        Self::from_coord(dim, coord)
    }

    /// Every vertical index the field carries.
    pub fn read_all(field: &Field) -> Vec<VerticalIndex> {
        field
            .coords
            .iter()
            .filter_map(|(name, coord)| {
                let dim = name.strip_prefix(INDEX_PREFIX)?;
                Self::from_coord(dim, coord)
            })
            .collect()
    }

    fn from_coord(dim: &str, coord: &Coord) -> Option<VerticalIndex> {
        let levels = coord.as_index()?.to_vec();
        if levels.is_empty() {
            return None;
        }
        Some(VerticalIndex {
            dim: dim.to_string(),
            levels,
            scalar: coord.is_scalar(),
        })
    }

    /// Attribute dataset-level single-level indices to `field`.
    ///
    /// Only valid when `field` is the one variable of a call without a
    /// vertical dimension: the selection can then only have come from it.
    pub fn adopt(
        mut field: Field,
        shared: &BTreeMap<String, Coord>,
        signature: &GridSignature,
    ) -> Field {
        for dim in &signature.vert_coord {
            let name = Self::coord_name(dim);
            if let Some(coord) = shared.get(&name).filter(|c| c.scalar_index_value().is_some()) {
                field.coords.entry(name).or_insert_with(|| coord.clone());
            }
        }
        field
    }

    /// Work out which native levels the field's data belongs to.
    ///
    /// `shared` holds dataset-level coordinates whose owner is unknown.
    /// Returns the binding plus warnings for cases where the association
    /// cannot be confirmed.
    pub fn bind(
        field: &Field,
        shared: &BTreeMap<String, Coord>,
        grid_name: &str,
        signature: &GridSignature,
    ) -> Result<(LevelBinding, Vec<String>)> {
        let mut warnings = Vec::new();

        let present: Vec<&String> = signature
            .vert_coord
            .iter()
            .filter(|d| field.has_dim(d))
            .collect();

        if present.len() > 1 {
            return Err(RegridError::shape_mismatch(
                grid_name,
                format!(
                    "field '{}' spans more than one vertical dimension ({:?})",
                    field.name, present
                ),
                None,
            ));
        }

        if let Some(dim) = present.first() {
            let dim = dim.as_str();
            let axis = field.axis(dim).unwrap_or_default();
            let len = field.shape()[axis];
            let levels = match Self::read(field, dim).filter(|v| !v.scalar) {
                Some(index) if index.levels.len() == len => index.levels,
                Some(index) => {
                    return Err(RegridError::shape_mismatch(
                        grid_name,
                        format!(
                            "vertical index of '{}' has {} entries but '{}' has length {}",
                            field.name,
                            index.levels.len(),
                            dim,
                            len
                        ),
                        None,
                    ))
                }
                None => {
                    if let Some(&declared) = signature.levels.get(dim) {
                        if declared != len {
                            warnings.push(format!(
                                "field '{}' has {} of {} levels along '{}' but no vertical index; \
                                 assuming they are the first {} native levels, results may be incorrect",
                                field.name, len, declared, dim, len
                            ));
                        }
                    }
                    (0..len).collect()
                }
            };
            return Ok((
                LevelBinding::Dimension {
                    dim: dim.to_string(),
                    axis,
                    levels,
                },
                warnings,
            ));
        }

        let owned: Vec<VerticalIndex> = signature
            .vert_coord
            .iter()
            .filter_map(|d| Self::read(field, d))
            .filter(|v| v.scalar)
            .collect();

        match owned.as_slice() {
            [index] => {
                return Ok((
                    LevelBinding::Scalar {
                        dim: index.dim.clone(),
                        level: index.levels[0],
                    },
                    warnings,
                ))
            }
            [] => {}
            many => {
                let dims: Vec<&str> = many.iter().map(|v| v.dim.as_str()).collect();
                warnings.push(format!(
                    "field '{}' carries single-level indices for several vertical dimensions {:?}; \
                     cannot tell which level it belongs to, results may be incorrect",
                    field.name, dims
                ));
                return Ok((LevelBinding::None, warnings));
            }
        }

        let unowned: Vec<(String, usize)> = signature
            .vert_coord
            .iter()
            .filter_map(|d| {
                let level = shared.get(&Self::coord_name(d))?.scalar_index_value()?;
                Some((d.clone(), level))
            })
            .collect();

        match unowned.as_slice() {
            [] => Ok((LevelBinding::None, warnings)),
            [(dim, level)] => {
                warnings.push(format!(
                    "field '{}' has no vertical dimension but the call carries a single-level \
                     index for '{}' (level {}); it may be a 2D variable combined with a sliced \
                     3D variable. Using level {}, results may be incorrect",
                    field.name, dim, level, level
                ));
                Ok((
                    LevelBinding::Scalar {
                        dim: dim.clone(),
                        level: *level,
                    },
                    warnings,
                ))
            }
            many => {
                let dims: Vec<&str> = many.iter().map(|(d, _)| d.as_str()).collect();
                warnings.push(format!(
                    "field '{}' has no vertical dimension and single levels were selected from \
                     several vertical dimensions {:?}; cannot tell which one it belongs to, \
                     results may be incorrect",
                    field.name, dims
                ));
                Ok((LevelBinding::None, warnings))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Dataset, Selection};
    use crate::grid::{GridRole, MaskRule};
    use ndarray::{ArrayD, IxDyn};

    fn ocean_grid() -> GridSignature {
        let mut paths = BTreeMap::new();
        paths.insert(GridRole::Unmasked, "/grids/nodes.nc".to_string());
        paths.insert(GridRole::Levels("nz1".to_string()), "/grids/nz1.nc".to_string());
        paths.insert(GridRole::Levels("nz".to_string()), "/grids/nz.nc".to_string());
        let mut levels = BTreeMap::new();
        levels.insert("nz1".to_string(), 4);
        GridSignature {
            paths,
            space_coord: vec!["ncells".to_string()],
            vert_coord: vec!["nz1".to_string(), "nz".to_string()],
            levels,
            mask: MaskRule::default(),
            extra: vec![],
        }
    }

    fn field(name: &str, dims: &[&str], shape: &[usize]) -> Field {
        Field::new(
            name,
            dims.iter().map(|s| s.to_string()).collect(),
            ArrayD::zeros(IxDyn(shape)),
        )
        .unwrap()
    }

    #[test]
    fn test_attach_adds_full_range_and_is_idempotent() {
        let grid = ocean_grid();
        let f = VerticalIndex::attach(field("thetao", &["nz1", "ncells"], &[4, 3]), "fesom", &grid)
            .unwrap();
        let index = VerticalIndex::read(&f, "nz1").unwrap();
        assert_eq!(index.levels, vec![0, 1, 2, 3]);
        assert!(!index.scalar);

        let again = VerticalIndex::attach(f.clone(), "fesom", &grid).unwrap();
        assert_eq!(again, f);
    }

    #[test]
    fn test_attach_rejects_wrong_level_count() {
        let err = VerticalIndex::attach(field("thetao", &["nz1", "ncells"], &[3, 3]), "fesom", &ocean_grid())
            .unwrap_err();
        assert!(matches!(err, RegridError::GridShapeMismatch { .. }));
    }

    #[test]
    fn test_bind_dimension_after_range_selection() {
        let grid = ocean_grid();
        let f = VerticalIndex::attach(field("thetao", &["time", "nz1", "ncells"], &[2, 4, 3]), "fesom", &grid)
            .unwrap()
            .isel("nz1", Selection::Range(2..4))
            .unwrap();
        let (binding, warnings) = VerticalIndex::bind(&f, &BTreeMap::new(), "fesom", &grid).unwrap();
        assert_eq!(
            binding,
            LevelBinding::Dimension {
                dim: "nz1".to_string(),
                axis: 1,
                levels: vec![2, 3]
            }
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bind_scalar_after_index_selection() {
        let grid = ocean_grid();
        let f = VerticalIndex::attach(field("thetao", &["nz1", "ncells"], &[4, 3]), "fesom", &grid)
            .unwrap()
            .isel("nz1", Selection::Index(2))
            .unwrap();
        let (binding, warnings) = VerticalIndex::bind(&f, &BTreeMap::new(), "fesom", &grid).unwrap();
        assert_eq!(
            binding,
            LevelBinding::Scalar {
                dim: "nz1".to_string(),
                level: 2
            }
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bind_without_index_warns_on_partial_levels() {
        let grid = ocean_grid();
        let f = field("thetao", &["nz1", "ncells"], &[2, 3]);
        let (binding, warnings) = VerticalIndex::bind(&f, &BTreeMap::new(), "fesom", &grid).unwrap();
        assert_eq!(binding.dim(), Some("nz1"));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("may be incorrect"));
    }

    #[test]
    fn test_bind_rejects_two_vertical_dims() {
        let f = field("bad", &["nz1", "nz", "ncells"], &[4, 5, 3]);
        assert!(VerticalIndex::bind(&f, &BTreeMap::new(), "fesom", &ocean_grid()).is_err());
    }

    #[test]
    fn test_merged_2d_and_sliced_3d_is_ambiguous() {
        let grid = ocean_grid();
        let sst = field("sst", &["ncells"], &[3]);
        let thetao = VerticalIndex::attach(field("thetao", &["nz1", "ncells"], &[4, 3]), "fesom", &grid)
            .unwrap()
            .isel("nz1", Selection::Index(1))
            .unwrap();
        let ds = Dataset::merge(vec![sst, thetao]).unwrap();

        let (binding, warnings) =
            VerticalIndex::bind(&ds.fields["sst"], &ds.coords, "fesom", &grid).unwrap();
        assert_eq!(
            binding,
            LevelBinding::Scalar {
                dim: "nz1".to_string(),
                level: 1
            }
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("may be incorrect"));
    }

    #[test]
    fn test_two_vertical_dims_sliced_is_ambiguous() {
        let grid = ocean_grid();
        let thetao = VerticalIndex::attach(field("thetao", &["nz1", "ncells"], &[4, 3]), "fesom", &grid)
            .unwrap()
            .isel("nz1", Selection::Index(1))
            .unwrap();
        let w = VerticalIndex::attach(field("w", &["nz", "ncells"], &[5, 3]), "fesom", &grid)
            .unwrap()
            .isel("nz", Selection::Index(4))
            .unwrap();
        let ds = Dataset::merge(vec![thetao, w]).unwrap();

        let (binding, warnings) =
            VerticalIndex::bind(&ds.fields["w"], &ds.coords, "fesom", &grid).unwrap();
        assert_eq!(binding, LevelBinding::None);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_plain_2d_field_binds_nothing() {
        let (binding, warnings) =
            VerticalIndex::bind(&field("tas", &["ncells"], &[3]), &BTreeMap::new(), "fesom", &ocean_grid())
                .unwrap();
        assert_eq!(binding, LevelBinding::None);
        assert!(warnings.is_empty());
    }
}

//! Labelled N-dimensional fields as delivered by the retrieval layer.
//!
//! A [`Field`] couples an `ndarray` buffer with named dimensions, coordinate
//! variables and string attributes. Missing values are `NaN`.

use ndarray::{ArrayD, Axis, Slice};
use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{RegridError, Result};

/// Values of a coordinate variable.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordValues {
    Float(Vec<f64>),
    Index(Vec<usize>),
}

impl CoordValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Index(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, positions: &[usize]) -> Self {
        match self {
            Self::Float(v) => Self::Float(positions.iter().map(|&p| v[p]).collect()),
            Self::Index(v) => Self::Index(positions.iter().map(|&p| v[p]).collect()),
        }
    }
}

/// A coordinate variable along zero (scalar) or one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Coord {
    pub dims: Vec<String>,
    pub values: CoordValues,
}

impl Coord {
    pub fn float(dim: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            dims: vec![dim.into()],
            values: CoordValues::Float(values),
        }
    }

    pub fn index(dim: impl Into<String>, values: Vec<usize>) -> Self {
        Self {
            dims: vec![dim.into()],
            values: CoordValues::Index(values),
        }
    }

    pub fn scalar_float(value: f64) -> Self {
        Self {
            dims: Vec::new(),
            values: CoordValues::Float(vec![value]),
        }
    }

    pub fn scalar_index(value: usize) -> Self {
        Self {
            dims: Vec::new(),
            values: CoordValues::Index(vec![value]),
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn dim(&self) -> Option<&str> {
        self.dims.first().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_index(&self) -> Option<&[usize]> {
        match &self.values {
            CoordValues::Index(v) => Some(v),
            CoordValues::Float(_) => None,
        }
    }

    /// The single value of a scalar index coordinate.
    pub fn scalar_index_value(&self) -> Option<usize> {
        match (&self.values, self.is_scalar()) {
            (CoordValues::Index(v), true) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    fn select(&self, selection: &Selection) -> Self {
        match selection {
            Selection::Index(i) => Self {
                dims: Vec::new(),
                values: self.values.take(&[*i]),
            },
            other => {
                let positions = other.positions(self.len());
                Self {
                    dims: self.dims.clone(),
                    values: self.values.take(&positions),
                }
            }
        }
    }
}

/// Positional selection along one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A single position; the dimension is dropped.
    Index(usize),
    /// A contiguous range; the dimension is kept.
    Range(Range<usize>),
    /// Arbitrary positions in the given order; the dimension is kept.
    Indices(Vec<usize>),
}

impl Selection {
    fn positions(&self, len: usize) -> Vec<usize> {
        match self {
            Self::Index(i) => vec![*i],
            Self::Range(r) => r.clone().collect(),
            Self::Indices(v) => v.clone(),
        }
        .into_iter()
        .filter(|&p| p < len)
        .collect()
    }

    fn check(&self, dim: &str, len: usize) -> Result<()> {
        let out_of_bounds = match self {
            Self::Index(i) => *i >= len,
            Self::Range(r) => r.start > r.end || r.end > len,
            Self::Indices(v) => v.iter().any(|&p| p >= len),
        };
        if out_of_bounds {
            return Err(RegridError::invalid_field(format!(
                "selection {:?} out of bounds for dimension '{}' of length {}",
                self, dim, len
            )));
        }
        Ok(())
    }
}

/// One variable with named dimensions, coordinates and attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub dims: Vec<String>,
    pub data: ArrayD<f64>,
    pub coords: BTreeMap<String, Coord>,
    pub attrs: BTreeMap<String, String>,
}

impl Field {
    pub fn new(name: impl Into<String>, dims: Vec<String>, data: ArrayD<f64>) -> Result<Self> {
        let name = name.into();
        if dims.len() != data.ndim() {
            return Err(RegridError::invalid_field(format!(
                "field '{}' declares {} dimensions but data has {}",
                name,
                dims.len(),
                data.ndim()
            )));
        }
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].contains(dim) {
                return Err(RegridError::invalid_field(format!(
                    "field '{}' repeats dimension '{}'",
                    name, dim
                )));
            }
        }
        Ok(Self {
            name,
            dims,
            data,
            coords: BTreeMap::new(),
            attrs: BTreeMap::new(),
        })
    }

    /// Add a coordinate, checking its dimension against the data.
    pub fn with_coord(mut self, name: impl Into<String>, coord: Coord) -> Result<Self> {
        self.set_coord(name, coord)?;
        Ok(self)
    }

    pub fn set_coord(&mut self, name: impl Into<String>, coord: Coord) -> Result<()> {
        let name = name.into();
        if coord.dims.len() > 1 {
            return Err(RegridError::invalid_field(format!(
                "coordinate '{}' spans more than one dimension",
                name
            )));
        }
        match coord.dim() {
            Some(dim) => {
                let len = self.dim_len(dim).ok_or_else(|| {
                    RegridError::invalid_field(format!(
                        "coordinate '{}' uses dimension '{}' which field '{}' does not have",
                        name, dim, self.name
                    ))
                })?;
                if len != coord.len() {
                    return Err(RegridError::invalid_field(format!(
                        "coordinate '{}' has {} values but dimension '{}' has length {}",
                        name,
                        coord.len(),
                        dim,
                        len
                    )));
                }
            }
            None if coord.len() != 1 => {
                return Err(RegridError::invalid_field(format!(
                    "scalar coordinate '{}' must hold exactly one value",
                    name
                )));
            }
            None => {}
        }
        self.coords.insert(name, coord);
        Ok(())
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.axis(dim).map(|a| self.data.shape()[a])
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.axis(dim).is_some()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Logical grid name declared by the metadata layer.
    pub fn grid(&self) -> Option<&str> {
        self.attrs.get("grid").map(String::as_str)
    }

    /// Select positions along `dim`.
    ///
    /// Coordinates along `dim` are subset alongside the data; with
    /// [`Selection::Index`] they become scalar coordinates.
    pub fn isel(&self, dim: &str, selection: Selection) -> Result<Field> {
        let axis = self.axis(dim).ok_or_else(|| {
            RegridError::invalid_field(format!(
                "field '{}' has no dimension '{}'",
                self.name, dim
            ))
        })?;
        let len = self.data.shape()[axis];
        selection.check(dim, len)?;

        let (data, dims) = match &selection {
            Selection::Index(i) => {
                let mut dims = self.dims.clone();
                dims.remove(axis);
                (self.data.index_axis(Axis(axis), *i).to_owned(), dims)
            }
            Selection::Range(r) => (
                self.data
                    .slice_axis(Axis(axis), Slice::from(r.clone()))
                    .to_owned(),
                self.dims.clone(),
            ),
            Selection::Indices(v) => (self.data.select(Axis(axis), v), self.dims.clone()),
        };

        let coords = self
            .coords
            .iter()
            .map(|(name, coord)| {
                let coord = if coord.dim() == Some(dim) {
                    coord.select(&selection)
                } else {
                    coord.clone()
                };
                (name.clone(), coord)
            })
            .collect();

        Ok(Field {
            name: self.name.clone(),
            dims,
            data,
            coords,
            attrs: self.attrs.clone(),
        })
    }

    /// Copy of this field with dataset-level coordinates folded in.
    ///
    /// Field-owned coordinates win on name clashes.
    pub fn with_shared(&self, shared: &BTreeMap<String, Coord>) -> Field {
        let mut field = self.clone();
        for (name, coord) in shared {
            let applies = match coord.dim() {
                None => true,
                Some(dim) => field.dim_len(dim) == Some(coord.len()),
            };
            if applies && !field.coords.contains_key(name) {
                field.coords.insert(name.clone(), coord.clone());
            }
        }
        field
    }
}

/// A set of fields sharing dataset-level coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub fields: BTreeMap<String, Field>,
    /// Coordinates not attributed to a single field.
    pub coords: BTreeMap<String, Coord>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: Field) -> Option<Field> {
        self.fields.insert(field.name.clone(), field)
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Combine fields into one dataset.
    ///
    /// Scalar coordinates that agree across every field carrying them are
    /// promoted to dataset level and no longer attributed to a field.
    /// Conflicting scalar coordinates stay with their fields.
    pub fn merge(fields: Vec<Field>) -> Result<Dataset> {
        let mut candidates: BTreeMap<String, Option<Coord>> = BTreeMap::new();
        for field in &fields {
            for (name, coord) in field.coords.iter().filter(|(_, c)| c.is_scalar()) {
                candidates
                    .entry(name.clone())
                    .and_modify(|existing| {
                        if existing.as_ref() != Some(coord) {
                            *existing = None;
                        }
                    })
                    .or_insert_with(|| Some(coord.clone()));
            }
        }

        let mut dataset = Dataset::new();
        for (name, coord) in &candidates {
            if let Some(coord) = coord {
                dataset.coords.insert(name.clone(), coord.clone());
            }
        }

        for mut field in fields {
            field.coords.retain(|name, _| !dataset.coords.contains_key(name));
            let name = field.name.clone();
            if dataset.insert(field).is_some() {
                return Err(RegridError::invalid_field(format!(
                    "dataset contains field '{}' twice",
                    name
                )));
            }
        }

        Ok(dataset)
    }

    /// Select along `dim` in every field that has it.
    pub fn isel(&self, dim: &str, selection: Selection) -> Result<Dataset> {
        let mut fields = BTreeMap::new();
        for (name, field) in &self.fields {
            let field = if field.has_dim(dim) {
                field.isel(dim, selection.clone())?
            } else {
                field.clone()
            };
            fields.insert(name.clone(), field);
        }

        let coords = self
            .coords
            .iter()
            .map(|(name, coord)| {
                let coord = if coord.dim() == Some(dim) {
                    coord.select(&selection)
                } else {
                    coord.clone()
                };
                (name.clone(), coord)
            })
            .collect();

        Ok(Dataset { fields, coords })
    }
}

//! In-memory structured datasets: named variables, split into coordinates and
//! data variables, plus dataset-level attributes.

mod attrs;
mod variable;

pub use attrs::{attributes_to_json, AttrValue, Attributes};
pub(crate) use variable::with_array;
pub use variable::{DataType, IntoVariableData, Variable, VariableData};

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised by dataset operations.
#[derive(Debug, Error, PartialEq)]
pub enum DatasetError {
    #[error("variable {0:?} not found in dataset")]
    VariableNotFound(String),

    #[error("{dims} dimension names given for an array of rank {ndim}")]
    RankMismatch { dims: usize, ndim: usize },

    #[error("cannot shape {elements} elements as {expected:?}")]
    ShapeMismatch { expected: Vec<usize>, elements: usize },

    #[error("dimension {dim:?} has conflicting lengths {first} and {second}")]
    ConflictingSizes {
        dim: String,
        first: usize,
        second: usize,
    },
}

/// A collection of variables sharing dimensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    variables: BTreeMap<String, Variable>,
    coord_names: BTreeSet<String>,
    /// Global attributes
    pub attrs: Attributes,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a data variable.
    pub fn insert_variable(&mut self, name: impl Into<String>, variable: Variable) {
        let name = name.into();
        self.coord_names.remove(&name);
        self.variables.insert(name, variable);
    }

    /// Add or replace a coordinate variable.
    pub fn insert_coord(&mut self, name: impl Into<String>, variable: Variable) {
        let name = name.into();
        self.coord_names.insert(name.clone());
        self.variables.insert(name, variable);
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Variable> {
        self.coord_names.remove(name);
        self.variables.remove(name)
    }

    /// All variables, coordinates included.
    pub fn variables(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.variables.iter()
    }

    pub fn is_coord(&self, name: &str) -> bool {
        self.coord_names.contains(name)
    }

    pub fn coord_names(&self) -> &BTreeSet<String> {
        &self.coord_names
    }

    pub fn coords(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.variables
            .iter()
            .filter(|(name, _)| self.coord_names.contains(*name))
    }

    pub fn data_vars(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.variables
            .iter()
            .filter(|(name, _)| !self.coord_names.contains(*name))
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Dimension lengths across all variables.
    pub fn sizes(&self) -> Result<BTreeMap<String, usize>, DatasetError> {
        let mut sizes = BTreeMap::new();
        for var in self.variables.values() {
            for (dim, &len) in var.dims.iter().zip(var.shape()) {
                match sizes.get(dim) {
                    Some(&existing) if existing != len => {
                        return Err(DatasetError::ConflictingSizes {
                            dim: dim.clone(),
                            first: existing,
                            second: len,
                        });
                    }
                    Some(_) => {}
                    None => {
                        sizes.insert(dim.clone(), len);
                    }
                }
            }
        }
        Ok(sizes)
    }

    /// Reclassify variables as coordinates.
    ///
    /// Fails without modifying the dataset if any name is absent. Names that
    /// already are coordinates are left as they are.
    pub fn set_coords<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), DatasetError> {
        if let Some(missing) = names.iter().find(|n| !self.contains(n.as_ref())) {
            return Err(DatasetError::VariableNotFound(missing.as_ref().to_string()));
        }
        for name in names {
            self.coord_names.insert(name.as_ref().to_string());
        }
        Ok(())
    }

    /// Reclassify coordinates as data variables.
    pub fn reset_coords<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), DatasetError> {
        if let Some(missing) = names.iter().find(|n| !self.contains(n.as_ref())) {
            return Err(DatasetError::VariableNotFound(missing.as_ref().to_string()));
        }
        for name in names {
            self.coord_names.remove(name.as_ref());
        }
        Ok(())
    }

    /// Mark dimension coordinates and variables listed in `coordinates`
    /// attributes as coordinates.
    pub fn infer_coords(&mut self) {
        let inferred = infer_coord_names(
            self.variables
                .iter()
                .map(|(name, var)| (name.as_str(), var.dims.as_slice(), &var.attrs)),
        );
        for name in inferred {
            if self.variables.contains_key(&name) {
                self.coord_names.insert(name);
            }
        }
    }

    /// Approximate payload size of all variables.
    pub fn nbytes(&self) -> usize {
        self.variables.values().map(|v| v.data.nbytes()).sum()
    }
}

/// Coordinate names implied by variable layout and CF `coordinates` attributes.
pub fn infer_coord_names<'a>(
    variables: impl Iterator<Item = (&'a str, &'a [String], &'a Attributes)>,
) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for (name, dims, attrs) in variables {
        if dims.len() == 1 && dims[0] == name {
            names.insert(name.to_string());
        }
        if let Some(coords) = attrs.get("coordinates").and_then(AttrValue::as_str) {
            names.extend(coords.split_whitespace().map(str::to_string));
        }
    }
    names
}

//! Combine dimensions and the index that locates an input in the output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How inputs along a dimension are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineOp {
    /// Inputs are concatenated along an existing array dimension.
    Concat,
    /// Inputs contribute different variables to the same dataset.
    Merge,
}

/// A dimension along which inputs are concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatDim {
    /// Name of the array dimension, e.g. `time`
    pub name: String,

    /// One key per input, in output order
    pub keys: Vec<String>,

    /// Number of elements each input holds along this dimension.
    /// `None` means "unknown until the input is opened".
    #[serde(default)]
    pub nitems_per_file: Option<usize>,
}

impl ConcatDim {
    /// Create a concat dimension with unknown items per file.
    pub fn new(name: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            keys,
            nitems_per_file: None,
        }
    }

    /// Set a fixed number of items per input.
    pub fn with_nitems_per_file(mut self, nitems: usize) -> Self {
        self.nitems_per_file = Some(nitems);
        self
    }

    /// Total length along the dimension, if every input has a known length.
    pub fn sequence_len(&self) -> Option<usize> {
        self.nitems_per_file.map(|n| n * self.keys.len())
    }
}

/// A dimension along which inputs are merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDim {
    /// Name of the logical dimension, e.g. `variable`
    pub name: String,

    /// One key per input
    pub keys: Vec<String>,
}

impl MergeDim {
    pub fn new(name: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            keys,
        }
    }
}

/// Either kind of combine dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombineDim {
    Concat(ConcatDim),
    Merge(MergeDim),
}

impl CombineDim {
    pub fn name(&self) -> &str {
        match self {
            CombineDim::Concat(d) => &d.name,
            CombineDim::Merge(d) => &d.name,
        }
    }

    pub fn keys(&self) -> &[String] {
        match self {
            CombineDim::Concat(d) => &d.keys,
            CombineDim::Merge(d) => &d.keys,
        }
    }

    pub fn operation(&self) -> CombineOp {
        match self {
            CombineDim::Concat(_) => CombineOp::Concat,
            CombineDim::Merge(_) => CombineOp::Merge,
        }
    }

    /// The `Dimension` key used in an [`Index`].
    pub fn dimension(&self) -> Dimension {
        Dimension::new(self.name(), self.operation())
    }
}

impl From<ConcatDim> for CombineDim {
    fn from(dim: ConcatDim) -> Self {
        CombineDim::Concat(dim)
    }
}

impl From<MergeDim> for CombineDim {
    fn from(dim: MergeDim) -> Self {
        CombineDim::Merge(dim)
    }
}

/// Key of an [`Index`] entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dimension {
    pub name: String,
    pub operation: CombineOp,
}

impl Dimension {
    pub fn new(name: impl Into<String>, operation: CombineOp) -> Self {
        Self {
            name: name.into(),
            operation,
        }
    }
}

/// Location of an input along one dimension.
///
/// An unindexed position is the ordinal of the input among its dimension's
/// keys; an indexed position is the element offset in the combined output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub value: usize,
    pub indexed: bool,
}

impl Position {
    pub fn new(value: usize) -> Self {
        Self {
            value,
            indexed: false,
        }
    }

    pub fn indexed(value: usize) -> Self {
        Self {
            value,
            indexed: true,
        }
    }
}

/// Location of an input in every combine dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Index(BTreeMap<Dimension, Position>);

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dimension: Dimension, position: Position) {
        self.0.insert(dimension, position);
    }

    pub fn get(&self, dimension: &Dimension) -> Option<&Position> {
        self.0.get(dimension)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Dimension, &Position)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Find the concat dimension with the given array dimension name.
    pub fn find_concat_dim(&self, name: &str) -> Option<&Dimension> {
        self.0
            .keys()
            .find(|d| d.operation == CombineOp::Concat && d.name == name)
    }

    /// Position along a concat dimension by name.
    pub fn concat_position(&self, name: &str) -> Option<Position> {
        self.find_concat_dim(name).and_then(|d| self.0.get(d)).copied()
    }

    /// True if this is the first input in every dimension.
    pub fn is_first_item(&self) -> bool {
        self.0.values().all(|p| p.value == 0)
    }

    /// True if this is the first input in every merge dimension.
    pub fn is_first_in_merge_dims(&self) -> bool {
        self.0
            .iter()
            .filter(|(d, _)| d.operation == CombineOp::Merge)
            .all(|(_, p)| p.value == 0)
    }
}

impl FromIterator<(Dimension, Position)> for Index {
    fn from_iter<T: IntoIterator<Item = (Dimension, Position)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(d, p)| {
                let marker = if p.indexed { "@" } else { "#" };
                format!("{}{}{}", d.name, marker, p.value)
            })
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

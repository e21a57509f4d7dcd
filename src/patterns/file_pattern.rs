//! The file pattern: a format function plus the dimensions it is evaluated over.

use super::{CombineDim, CombineOp, ConcatDim, Index, Position, UrlTemplate};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Dimension name → key, passed to a format function.
pub type Keys = BTreeMap<String, String>;

/// Builds the URL of one input from its keys.
pub type FormatFn = Arc<dyn Fn(&Keys) -> String + Send + Sync>;

/// Describes a set of inputs laid out along concat and merge dimensions.
#[derive(Clone)]
pub struct FilePattern {
    format_fn: FormatFn,
    combine_dims: Vec<CombineDim>,
}

impl FilePattern {
    /// Create a pattern from a format function and its combine dimensions.
    pub fn new<F>(format_fn: F, combine_dims: Vec<CombineDim>) -> Self
    where
        F: Fn(&Keys) -> String + Send + Sync + 'static,
    {
        Self {
            format_fn: Arc::new(format_fn),
            combine_dims,
        }
    }

    /// Create a pattern whose format function substitutes into a URL template.
    pub fn from_template(template: UrlTemplate, combine_dims: Vec<CombineDim>) -> Self {
        Self::new(move |keys: &Keys| template.format(keys), combine_dims)
    }

    pub fn combine_dims(&self) -> &[CombineDim] {
        &self.combine_dims
    }

    /// Number of keys per dimension.
    pub fn dims(&self) -> BTreeMap<String, usize> {
        self.combine_dims
            .iter()
            .map(|d| (d.name().to_string(), d.keys().len()))
            .collect()
    }

    /// Number of keys per dimension, in declared order.
    pub fn shape(&self) -> Vec<usize> {
        self.combine_dims.iter().map(|d| d.keys().len()).collect()
    }

    pub fn concat_dims(&self) -> Vec<&str> {
        self.dims_with(CombineOp::Concat)
    }

    pub fn merge_dims(&self) -> Vec<&str> {
        self.dims_with(CombineOp::Merge)
    }

    fn dims_with(&self, op: CombineOp) -> Vec<&str> {
        self.combine_dims
            .iter()
            .filter(|d| d.operation() == op)
            .map(CombineDim::name)
            .collect()
    }

    /// Concat dimension by name.
    pub fn concat_dim(&self, name: &str) -> Option<&ConcatDim> {
        self.combine_dims.iter().find_map(|d| match d {
            CombineDim::Concat(c) if c.name == name => Some(c),
            _ => None,
        })
    }

    /// Items per input for each concat dimension.
    pub fn nitems_per_input(&self) -> BTreeMap<String, Option<usize>> {
        self.concat_only()
            .map(|c| (c.name.clone(), c.nitems_per_file))
            .collect()
    }

    /// Total output length for each concat dimension, where known up front.
    pub fn concat_sequence_lens(&self) -> BTreeMap<String, Option<usize>> {
        self.concat_only()
            .map(|c| (c.name.clone(), c.sequence_len()))
            .collect()
    }

    fn concat_only(&self) -> impl Iterator<Item = &ConcatDim> {
        self.combine_dims.iter().filter_map(|d| match d {
            CombineDim::Concat(c) => Some(c),
            CombineDim::Merge(_) => None,
        })
    }

    /// Total number of inputs.
    pub fn len(&self) -> usize {
        if self.combine_dims.is_empty() {
            return 0;
        }
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the URL for an index.
    pub fn get(&self, index: &Index) -> Option<String> {
        let mut keys = Keys::new();
        for dim in &self.combine_dims {
            let position = index.get(&dim.dimension())?;
            if position.indexed {
                return None;
            }
            let key = dim.keys().get(position.value)?;
            keys.insert(dim.name().to_string(), key.clone());
        }
        Some((self.format_fn)(&keys))
    }

    /// All indices, in row-major order over the declared dimensions.
    pub fn indices(&self) -> Vec<Index> {
        let shape = self.shape();
        let total = self.len();
        let mut out = Vec::with_capacity(total);
        let mut counter = vec![0usize; shape.len()];

        for _ in 0..total {
            let index = self
                .combine_dims
                .iter()
                .zip(&counter)
                .map(|(dim, &i)| (dim.dimension(), Position::new(i)))
                .collect();
            out.push(index);

            // Advance the last dimension fastest.
            for axis in (0..shape.len()).rev() {
                counter[axis] += 1;
                if counter[axis] < shape[axis] {
                    break;
                }
                counter[axis] = 0;
            }
        }
        out
    }

    /// All `(index, url)` pairs.
    pub fn items(&self) -> Vec<(Index, String)> {
        self.indices()
            .into_iter()
            .filter_map(|index| self.get(&index).map(|url| (index, url)))
            .collect()
    }
}

impl fmt::Debug for FilePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePattern")
            .field("combine_dims", &self.combine_dims)
            .finish_non_exhaustive()
    }
}

/// Build a pattern concatenating an explicit list of files along one dimension.
pub fn pattern_from_file_sequence(
    files: Vec<String>,
    concat_dim: &str,
    nitems_per_file: Option<usize>,
) -> FilePattern {
    let keys: Vec<String> = (0..files.len()).map(|i| i.to_string()).collect();
    let mut dim = ConcatDim::new(concat_dim, keys);
    dim.nitems_per_file = nitems_per_file;

    let name = concat_dim.to_string();
    FilePattern::new(
        move |keys: &Keys| {
            keys.get(&name)
                .and_then(|k| k.parse::<usize>().ok())
                .and_then(|i| files.get(i).cloned())
                .unwrap_or_default()
        },
        vec![dim.into()],
    )
}

/// Keep only the first `nkeep` keys of every concat dimension.
///
/// Used to test a recipe on a small piece of its inputs.
pub fn prune_pattern(pattern: &FilePattern, nkeep: usize) -> FilePattern {
    let combine_dims = pattern
        .combine_dims
        .iter()
        .map(|d| match d {
            CombineDim::Concat(c) => {
                let mut pruned = c.clone();
                pruned.keys.truncate(nkeep);
                CombineDim::Concat(pruned)
            }
            CombineDim::Merge(m) => CombineDim::Merge(m.clone()),
        })
        .collect();

    FilePattern {
        format_fn: pattern.format_fn.clone(),
        combine_dims,
    }
}

//! Dataset schemas and their combination along concat and merge dimensions.
//!
//! A schema is a dataset without its data. The recipe opens every input's
//! schema first, combines them into the schema of the output store, and
//! uses the combined schema to size arrays and to place each fragment.

use crate::dataset::{infer_coord_names, Attributes, DataType, Dataset, DatasetError};
use crate::patterns::{CombineOp, FilePattern, Index, Position};
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Structure of one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSchema {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub attrs: Attributes,
    pub is_coord: bool,
}

/// Structure of a dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetSchema {
    pub dims: BTreeMap<String, usize>,
    pub variables: BTreeMap<String, VariableSchema>,
    pub attrs: Attributes,
}

impl DatasetSchema {
    /// Schema of an in-memory dataset.
    pub fn from_dataset(ds: &Dataset) -> Result<Self, DatasetError> {
        let variables = ds
            .variables()
            .map(|(name, var)| {
                (
                    name.clone(),
                    VariableSchema {
                        dims: var.dims.clone(),
                        shape: var.shape().to_vec(),
                        data_type: var.data_type(),
                        attrs: var.attrs.clone(),
                        is_coord: ds.is_coord(name),
                    },
                )
            })
            .collect();

        Ok(Self {
            dims: ds.sizes()?,
            variables,
            attrs: ds.attrs.clone(),
        })
    }

    /// Build from variable schemas, inferring coordinates and dimension sizes.
    pub fn from_variables(
        variables: BTreeMap<String, VariableSchema>,
        attrs: Attributes,
    ) -> Result<Self, DatasetError> {
        let mut schema = Self {
            dims: BTreeMap::new(),
            variables,
            attrs,
        };

        let coords = infer_coord_names(
            schema
                .variables
                .iter()
                .map(|(name, v)| (name.as_str(), v.dims.as_slice(), &v.attrs)),
        );
        for (name, var) in schema.variables.iter_mut() {
            var.is_coord = var.is_coord || coords.contains(name);
        }

        for var in schema.variables.values() {
            for (dim, &len) in var.dims.iter().zip(&var.shape) {
                if let Some(&existing) = schema.dims.get(dim) {
                    if existing != len {
                        return Err(DatasetError::ConflictingSizes {
                            dim: dim.clone(),
                            first: existing,
                            second: len,
                        });
                    }
                } else {
                    schema.dims.insert(dim.clone(), len);
                }
            }
        }
        Ok(schema)
    }

    /// Mark variables as coordinates; see [`Dataset::set_coords`].
    pub fn set_coords<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), DatasetError> {
        if let Some(missing) = names
            .iter()
            .find(|n| !self.variables.contains_key(n.as_ref()))
        {
            return Err(DatasetError::VariableNotFound(missing.as_ref().to_string()));
        }
        for name in names {
            if let Some(var) = self.variables.get_mut(name.as_ref()) {
                var.is_coord = true;
            }
        }
        Ok(())
    }

    pub fn coord_names(&self) -> BTreeSet<&str> {
        self.variables
            .iter()
            .filter(|(_, v)| v.is_coord)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Accumulates fragment schemas into the schema of the combined output.
#[derive(Debug, Default)]
pub struct SchemaAccumulator {
    schema: Option<DatasetSchema>,
    /// concat dim → ordinal position → length of that input along the dim
    lengths: BTreeMap<String, BTreeMap<usize, usize>>,
}

impl SchemaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one input's schema at its (unindexed) position.
    pub fn add_input(&mut self, index: &Index, schema: DatasetSchema) -> Result<()> {
        for (dim, position) in index.iter() {
            if dim.operation != CombineOp::Concat {
                continue;
            }
            let len = *schema.dims.get(&dim.name).with_context(|| {
                format!("Input at {} has no dimension {:?} to concatenate along", index, dim.name)
            })?;
            let lengths = self.lengths.entry(dim.name.clone()).or_default();
            match lengths.get(&position.value) {
                Some(&existing) if existing != len => bail!(
                    "Inputs at position {} of {:?} disagree on its length ({} vs {})",
                    position.value,
                    dim.name,
                    existing,
                    len
                ),
                _ => {
                    lengths.insert(position.value, len);
                }
            }
        }

        let concat_dims: BTreeSet<&str> = index
            .iter()
            .filter(|(d, _)| d.operation == CombineOp::Concat)
            .map(|(d, _)| d.name.as_str())
            .collect();

        match self.schema.as_mut() {
            None => self.schema = Some(schema),
            Some(acc) => merge_schema(acc, schema, &concat_dims)?,
        }
        Ok(())
    }

    /// Merge another accumulator into this one.
    pub fn merge(&mut self, other: SchemaAccumulator) -> Result<()> {
        for (dim, lengths) in other.lengths {
            let mine = self.lengths.entry(dim.clone()).or_default();
            for (position, len) in lengths {
                if let Some(&existing) = mine.get(&position) {
                    if existing != len {
                        bail!("Inputs at position {} of {:?} disagree on its length", position, dim);
                    }
                }
                mine.insert(position, len);
            }
        }
        let concat_dims: BTreeSet<&str> = self.lengths.keys().map(String::as_str).collect();
        match (self.schema.as_mut(), other.schema) {
            (_, None) => {}
            (None, Some(s)) => self.schema = Some(s),
            (Some(acc), Some(s)) => merge_schema(acc, s, &concat_dims)?,
        }
        Ok(())
    }

    /// Finish against the pattern the inputs came from.
    pub fn finish(self, pattern: &FilePattern) -> Result<CombinedSchema> {
        let mut schema = self.schema.context("No input schemas were combined")?;
        let mut offsets = BTreeMap::new();

        for concat in pattern.concat_dims() {
            let expected = pattern.dims()[concat];
            let lengths = self.lengths.get(concat).cloned().unwrap_or_default();
            let nitems = pattern.concat_dim(concat).and_then(|c| c.nitems_per_file);

            let mut starts = Vec::with_capacity(expected);
            let mut total = 0usize;
            for position in 0..expected {
                let len = *lengths.get(&position).with_context(|| {
                    format!("No input was seen at position {} of {:?}", position, concat)
                })?;
                if let Some(n) = nitems {
                    if n != len {
                        bail!(
                            "Input at position {} of {:?} has {} items, expected {} per file",
                            position,
                            concat,
                            len,
                            n
                        );
                    }
                }
                starts.push(total);
                total += len;
            }

            schema.dims.insert(concat.to_string(), total);
            for var in schema.variables.values_mut() {
                for (dim, len) in var.dims.iter().zip(var.shape.iter_mut()) {
                    if dim == concat {
                        *len = total;
                    }
                }
            }
            offsets.insert(concat.to_string(), starts);
        }

        Ok(CombinedSchema { schema, offsets })
    }
}

fn merge_schema(acc: &mut DatasetSchema, other: DatasetSchema, concat_dims: &BTreeSet<&str>) -> Result<()> {
    for (dim, len) in &other.dims {
        if concat_dims.contains(dim.as_str()) {
            continue;
        }
        match acc.dims.get(dim) {
            Some(existing) if existing != len => bail!(
                "Dimension {:?} has length {} in one input and {} in another",
                dim,
                existing,
                len
            ),
            Some(_) => {}
            None => {
                acc.dims.insert(dim.clone(), *len);
            }
        }
    }

    for (name, var) in other.variables {
        match acc.variables.get_mut(&name) {
            None => {
                acc.variables.insert(name, var);
            }
            Some(existing) => {
                if existing.dims != var.dims {
                    bail!(
                        "Variable {:?} has dimensions {:?} in one input and {:?} in another",
                        name,
                        existing.dims,
                        var.dims
                    );
                }
                if existing.data_type != var.data_type {
                    bail!(
                        "Variable {:?} has data type {} in one input and {} in another",
                        name,
                        existing.data_type,
                        var.data_type
                    );
                }
                existing.is_coord = existing.is_coord || var.is_coord;
            }
        }
    }

    for (key, value) in other.attrs {
        acc.attrs.entry(key).or_insert(value);
    }
    Ok(())
}

/// The output schema plus where each input lands along its concat dims.
#[derive(Debug, Clone)]
pub struct CombinedSchema {
    pub schema: DatasetSchema,
    /// concat dim → element offset of each input position
    pub offsets: BTreeMap<String, Vec<usize>>,
}

impl CombinedSchema {
    /// Convert ordinal concat positions into element offsets.
    pub fn index_to_offsets(&self, index: &Index) -> Result<Index> {
        index
            .iter()
            .map(|(dim, position)| {
                if dim.operation != CombineOp::Concat || position.indexed {
                    return Ok((dim.clone(), *position));
                }
                let offset = self
                    .offsets
                    .get(&dim.name)
                    .and_then(|starts| starts.get(position.value))
                    .with_context(|| {
                        format!("Position {} of {:?} is outside the combined schema", position.value, dim.name)
                    })?;
                Ok((dim.clone(), Position::indexed(*offset)))
            })
            .collect()
    }

    /// Fail unless every input's span along each concat dimension starts and
    /// ends on a chunk boundary of every variable that has that dimension.
    pub fn check_chunk_alignment(&self, chunks: &BTreeMap<String, Vec<u64>>) -> Result<()> {
        for (dim, starts) in &self.offsets {
            let total = self.schema.dims.get(dim).copied().unwrap_or_default();
            for (name, var) in &self.schema.variables {
                let Some(axis) = var.dims.iter().position(|d| d == dim) else {
                    continue;
                };
                let chunk = chunks
                    .get(name)
                    .and_then(|c| c.get(axis))
                    .copied()
                    .with_context(|| format!("No chunk shape determined for {:?}", name))?
                    as usize;

                for (position, &start) in starts.iter().enumerate() {
                    let end = starts.get(position + 1).copied().unwrap_or(total);
                    if start % chunk != 0 || (end % chunk != 0 && end != total) {
                        bail!(
                            "Input {} of {:?} covers {}..{}, which does not align with chunk size {} of {:?}",
                            position,
                            dim,
                            start,
                            end,
                            chunk,
                            name
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Chunk shape of every variable for a target chunk scheme.
///
/// Dimensions without a target are stored in a single chunk. Targets larger
/// than the dimension are clamped to it.
pub fn determine_target_chunks(
    schema: &DatasetSchema,
    target_chunks: &BTreeMap<String, usize>,
) -> Result<BTreeMap<String, Vec<u64>>> {
    for (dim, &size) in target_chunks {
        if !schema.dims.contains_key(dim) {
            bail!("Target chunks name dimension {:?}, which is not in the dataset", dim);
        }
        if size == 0 {
            bail!("Target chunk size for {:?} must be > 0", dim);
        }
    }

    Ok(schema
        .variables
        .iter()
        .map(|(name, var)| {
            let chunks = var
                .dims
                .iter()
                .zip(&var.shape)
                .map(|(dim, &len)| {
                    let chunk = target_chunks.get(dim).map_or(len, |&t| t.min(len));
                    chunk.max(1) as u64
                })
                .collect();
            (name.clone(), chunks)
        })
        .collect())
}

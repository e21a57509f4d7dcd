//! Per-fragment preprocessing applied between opening an input and writing it.

use super::DatasetSchema;
use crate::dataset::Dataset;
use crate::patterns::Index;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;

/// A dataset fragment together with its location in the combined output.
pub type IndexedDataset = (Index, Dataset);

/// A transformation applied to every fragment of a recipe.
///
/// Implementations must also describe their effect on schemas so that the
/// output store is laid out for the preprocessed data.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn preprocess(&self, item: IndexedDataset) -> Result<IndexedDataset>;

    fn preprocess_schema(&self, schema: DatasetSchema) -> Result<DatasetSchema> {
        Ok(schema)
    }
}

/// Reclassify named data variables as coordinates.
///
/// Useful for grid-mapping and bounds variables that would otherwise be
/// written once per fragment as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoteToCoordinate {
    names: Vec<String>,
}

impl PromoteToCoordinate {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Preprocessor for PromoteToCoordinate {
    fn name(&self) -> &str {
        "promote_to_coordinate"
    }

    fn preprocess(&self, (index, mut ds): IndexedDataset) -> Result<IndexedDataset> {
        ds.set_coords(self.names.as_slice())
            .with_context(|| format!("Failed to promote coordinates for {}", index))?;
        Ok((index, ds))
    }

    fn preprocess_schema(&self, mut schema: DatasetSchema) -> Result<DatasetSchema> {
        schema.set_coords(self.names.as_slice())?;
        Ok(schema)
    }
}

/// Preprocessors applied in order.
#[derive(Clone, Default)]
pub struct PreprocessChain {
    steps: Vec<Arc<dyn Preprocessor>>,
}

impl PreprocessChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Arc<dyn Preprocessor>) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, item: IndexedDataset) -> Result<IndexedDataset> {
        self.steps.iter().try_fold(item, |item, step| step.preprocess(item))
    }

    pub fn apply_schema(&self, schema: DatasetSchema) -> Result<DatasetSchema> {
        self.steps
            .iter()
            .try_fold(schema, |schema, step| step.preprocess_schema(schema))
    }
}

impl fmt::Debug for PreprocessChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

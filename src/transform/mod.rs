//! Dataset transformations: per-fragment preprocessing and schema combination.

mod preprocess;
mod schema;

pub use preprocess::{IndexedDataset, PreprocessChain, Preprocessor, PromoteToCoordinate};
pub use schema::{
    determine_target_chunks, CombinedSchema, DatasetSchema, SchemaAccumulator, VariableSchema,
};

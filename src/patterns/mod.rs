//! File patterns: enumerate the input URLs of a recipe and their positions
//! in the combined output.

mod dims;
mod file_pattern;
mod url;

pub use dims::{CombineDim, CombineOp, ConcatDim, Dimension, Index, MergeDim, Position};
pub use file_pattern::{pattern_from_file_sequence, prune_pattern, FilePattern, FormatFn, Keys};
pub use url::{narr_air_url, UrlTemplate, NARR_AIR_URL_TEMPLATE};

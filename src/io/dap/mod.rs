//! OPeNDAP (DAP2) client: metadata parsing, XDR decoding and an HTTP reader.

mod constraint;
mod das;
mod dds;
mod lexer;
mod metadata_cache;
mod reader;
mod xdr;

pub use constraint::{build_constraint, subset_shape, DimSlice, Subset};
pub use das::{parse_das, Das, GLOBAL_CONTAINER};
pub use dds::{parse_dds, ArrayDecl, AtomicType, Dds, Declaration, DimDecl, FlatVariable};
pub use metadata_cache::{DapMetadata, MetadataCache};
pub use reader::{dataset_from_dods, schema_from_metadata, DapReader};
pub use xdr::{decode_values, split_dods};

#[cfg(test)]
pub(crate) use das::tests::NARR_DAS;
#[cfg(test)]
pub(crate) use dds::tests::NARR_DDS;
#[cfg(test)]
pub(crate) use xdr::encode;

use thiserror::Error;

/// Errors raised while talking to a DAP2 server or decoding its responses.
#[derive(Debug, Error)]
pub enum DapError {
    #[error("DAP parse error: {0}")]
    Parse(String),

    #[error("unsupported DAP construct: {0}")]
    Unsupported(String),

    #[error("XDR payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("variable {variable:?} declares {declared} values but {encoded} were encoded")]
    LengthMismatch {
        variable: String,
        declared: usize,
        encoded: usize,
    },

    #[error("invalid subset: {0}")]
    InvalidSubset(String),

    #[error("server error for {url}: {message}")]
    Server { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl DapError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DapError::Status { status, .. } => *status == 429 || *status >= 500,
            DapError::Request { .. } => true,
            _ => false,
        }
    }
}

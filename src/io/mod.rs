//! I/O: reading DAP2 inputs and writing Zarr outputs.

pub mod dap;
mod inspect;
pub(crate) mod opener;
mod store;
mod zarr_writer;

#[cfg(test)]
mod zarr_writer_integration_tests;

pub use dap::{DapReader, DimSlice, Subset};
pub use inspect::{inspect_store, ArrayInfo};
pub use opener::DatasetOpener;
pub use store::{create_output_store, open_store_uri, output_target, parse_s3_uri};
pub use zarr_writer::{check_alignment, ZarrWriter};

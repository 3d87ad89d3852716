//! Self-describing container file.
//!
//! A container holds a hierarchy of dataset groups. Each group owns one
//! one-dimensional `data` array with a structured row type and may carry
//! reference tables and region indices under `ref/...` subpaths. Datasets
//! are chunked and extendible; the catalog describing them is serialized
//! into the file so it can be reopened without external schema.

mod dtype;
mod file;

pub use dtype::{ref_dtype, ref_region_dtype, Dtype, Field, Scalar};
pub use file::{TableFile, DEFAULT_CHUNK_ROWS, FORMAT_VERSION};

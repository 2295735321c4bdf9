//! Core data structures for imgforge.
//!
//! - The image catalog and its validation
//! - The error taxonomy shared by every layer

pub mod catalog;
pub mod errors;

pub use catalog::{ArtifactDef, Catalog, ChecksumAlgorithm, ChecksumSpec};
pub use errors::{CatalogIssue, ForgeError};

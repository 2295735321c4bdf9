//! imgforge - builds hypervisor VM templates from a catalog of cloud images
//!
//! This crate provides the library behind the `imgforge` binary: catalog
//! loading and validation, change tracking, the per-artifact build pipeline,
//! and the adapters for the hypervisor control plane, the image tools and
//! image downloads.

pub mod backend;
pub mod builder;
pub mod core;
pub mod ops;
pub mod util;

/// Test utilities for imgforge unit tests.
///
/// Only compiled for tests. Provides a recording fake for every collaborator
/// trait and a small catalog fixture.
#[cfg(test)]
pub mod test_support;

pub use core::catalog::{ArtifactDef, Catalog};
pub use core::errors::ForgeError;
pub use util::context::Settings;

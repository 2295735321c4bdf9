//! Template build machinery.
//!
//! This module implements the per-artifact pipeline together with the change
//! tracking that lets an unchanged artifact be skipped.

pub mod events;
pub mod pipeline;
pub mod signature;
pub mod state;

pub use events::BuildEvent;
pub use pipeline::{ArtifactOutcome, ArtifactReport, Pipeline, PipelineError, Step};
pub use signature::{compute_signature, SignatureInputs};
pub use state::{StateRecord, StateStore};

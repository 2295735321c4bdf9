//! Build event types for JSON output.
//!
//! This module defines the stable JSON schema for machine-readable build output.
//! These events are emitted when using `--message-format=json`, one object per
//! line on stdout.
//!
//! # Event Types
//!
//! - `artifact-started`: an artifact entered the pipeline
//! - `step-finished`: one pipeline step completed (or was simulated)
//! - `artifact-skipped`: the gate found nothing to do
//! - `artifact-built`: the template was produced and state persisted
//! - `artifact-failed`: a step failed; names the step and the cause
//! - `unverified`: no checksum was declared for the source
//! - `build-finished`: the run completed (success or failure)
//!
//! # Stability
//!
//! New fields may be added, but existing fields should not be removed or renamed.

use serde::Serialize;

/// A build event emitted during the build process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason")]
pub enum BuildEvent {
    #[serde(rename = "artifact-started")]
    ArtifactStarted {
        label: String,
        vmid: u32,
        dry_run: bool,
    },

    #[serde(rename = "step-finished")]
    StepFinished {
        label: String,
        step: String,
        /// True when the step only logged what it would do
        simulated: bool,
        duration_ms: u64,
    },

    #[serde(rename = "artifact-skipped")]
    ArtifactSkipped { label: String, vmid: u32 },

    #[serde(rename = "artifact-built")]
    ArtifactBuilt {
        label: String,
        vmid: u32,
        signature: String,
        dry_run: bool,
        duration_ms: u64,
    },

    #[serde(rename = "artifact-failed")]
    ArtifactFailed {
        label: String,
        vmid: u32,
        step: String,
        /// Error class (`integrity`, `collaborator`, `timeout`, ...)
        kind: String,
        message: String,
    },

    #[serde(rename = "unverified")]
    Unverified { label: String, source: String },

    #[serde(rename = "build-finished")]
    BuildFinished {
        success: bool,
        built: u64,
        skipped: u64,
        failed: u64,
        /// Selected but never attempted because an earlier artifact failed
        not_attempted: u64,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_file: Option<String>,
    },
}

impl BuildEvent {
    /// Serialize this event to a JSON value for [`Shell::json_event`].
    ///
    /// [`Shell::json_event`]: crate::util::shell::Shell::json_event
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Serialize this event to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

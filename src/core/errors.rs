//! Error taxonomy.
//!
//! Startup-class errors ([`ForgeError::Validation`], [`ForgeError::Configuration`])
//! stop the whole run before any collaborator is touched. The others are raised
//! while building one artifact and are wrapped in a
//! [`PipelineError`](crate::builder::pipeline::PipelineError) naming the step.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::diagnostic::{suggestions, Diagnostic};

/// One problem found while validating the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIssue {
    /// Position of the offending entry (zero-based); `None` when the
    /// document as a whole could not be read
    pub index: Option<usize>,
    pub reason: String,
}

impl CatalogIssue {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        CatalogIssue {
            index: Some(index),
            reason: reason.into(),
        }
    }

    pub fn document(reason: impl Into<String>) -> Self {
        CatalogIssue {
            index: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "image[{}]: {}", index, self.reason),
            None => write!(f, "document: {}", self.reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("catalog `{}` is invalid ({} problem(s))", .path.display(), .issues.len())]
    Validation {
        path: PathBuf,
        issues: Vec<CatalogIssue>,
    },

    #[error(
        "checksum mismatch for `{}`: expected {algorithm}:{expected}, found {actual}",
        .path.display()
    )]
    Integrity {
        path: PathBuf,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("{operation} failed: {message}")]
    Collaborator { operation: String, message: String },

    #[error("{operation} did not finish within {}s", .timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ForgeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ForgeError::Configuration(message.into())
    }

    /// Whether this error must halt the run before any artifact is attempted.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            ForgeError::Validation { .. } | ForgeError::Configuration(_)
        )
    }

    /// Short machine-friendly name for events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeError::Validation { .. } => "validation",
            ForgeError::Integrity { .. } => "integrity",
            ForgeError::Collaborator { .. } => "collaborator",
            ForgeError::Timeout { .. } => "timeout",
            ForgeError::Configuration(_) => "configuration",
        }
    }

    /// Convert to a user-friendly diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ForgeError::Validation { path, issues } => {
                let mut diag = Diagnostic::error(format!(
                    "catalog has {} problem(s); nothing was built",
                    issues.len()
                ))
                .with_location(path.clone());
                for issue in issues {
                    diag = diag.with_context(issue.to_string());
                }
                diag.with_suggestion(suggestions::FIX_CATALOG)
            }
            ForgeError::Integrity { path, .. } => Diagnostic::error(self.to_string())
                .with_location(path.clone())
                .with_suggestion(suggestions::CHECKSUM_MISMATCH),
            ForgeError::Collaborator { .. } => {
                Diagnostic::error(self.to_string()).with_suggestion(suggestions::COLLABORATOR_FAILED)
            }
            ForgeError::Timeout { .. } => {
                Diagnostic::error(self.to_string()).with_suggestion(suggestions::TIMEOUT)
            }
            ForgeError::Configuration(_) => {
                Diagnostic::error(self.to_string()).with_suggestion(suggestions::CONFIGURATION)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_diagnostic_lists_every_issue() {
        let err = ForgeError::Validation {
            path: PathBuf::from("catalog.toml"),
            issues: vec![
                CatalogIssue::new(1, "duplicate vmid 9000 (first used by image[0])"),
                CatalogIssue::new(2, "missing `source`"),
            ],
        };

        assert!(err.is_startup());
        assert_eq!(err.to_string(), "catalog `catalog.toml` is invalid (2 problem(s))");

        let rendered = err.to_diagnostic().format(false);
        assert!(rendered.contains("image[1]: duplicate vmid 9000"));
        assert!(rendered.contains("image[2]: missing `source`"));
        assert!(rendered.contains("--> catalog.toml"));
    }

    #[test]
    fn test_per_artifact_errors_are_not_startup() {
        let err = ForgeError::Timeout {
            operation: "qm importdisk".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert!(!err.is_startup());
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "qm importdisk did not finish within 600s");
    }
}

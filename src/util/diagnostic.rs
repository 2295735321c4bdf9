//! User-friendly diagnostic messages.
//!
//! Every error shown to the operator carries the root cause, the context that
//! led to it, and what to try next.

use std::fmt;
use std::path::PathBuf;

/// Common suggestion messages for consistent error handling.
pub mod suggestions {
    pub const FIX_CATALOG: &str =
        "Fix the entries listed above, then run `imgforge build --validate-only`";

    pub const CHECKSUM_MISMATCH: &str =
        "Delete the cached image to force a fresh download, or update the catalog digest";

    pub const COLLABORATOR_FAILED: &str =
        "Run `imgforge doctor` to check the host tools, and see the log file for the full output";

    pub const TIMEOUT: &str = "Raise the matching value in the `[timeouts]` config section";

    pub const CONFIGURATION: &str = "Check imgforge.toml or pass --config <path>";

    pub const NO_SELECTION: &str =
        "Pass labels as arguments, or `--all` to build the whole catalog";
}

/// Severity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A diagnostic message with optional suggestions.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Primary message
    pub message: String,
    pub severity: Severity,
    /// Additional context lines
    pub context: Vec<String>,
    /// Suggested fixes
    pub suggestions: Vec<String>,
    /// Related location (file path)
    pub location: Option<PathBuf>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            severity: Severity::Error,
            context: Vec::new(),
            suggestions: Vec::new(),
            location: None,
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(message)
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Some(path.into());
        self
    }

    /// Format the diagnostic for terminal output.
    pub fn format(&self, color: bool) -> String {
        let mut output = String::new();

        let severity_str = match (color, self.severity) {
            (true, Severity::Error) => "\x1b[1;31merror\x1b[0m".to_string(),
            (true, Severity::Warning) => "\x1b[1;33mwarning\x1b[0m".to_string(),
            (false, severity) => severity.to_string(),
        };

        output.push_str(&format!("{}: {}\n", severity_str, self.message));

        if let Some(ref path) = self.location {
            output.push_str(&format!("  --> {}\n", path.display()));
        }

        for ctx in &self.context {
            output.push_str(&format!("  = {}\n", ctx));
        }

        if !self.suggestions.is_empty() {
            let help_prefix = if color {
                "\x1b[1;32mhelp\x1b[0m"
            } else {
                "help"
            };
            for suggestion in &self.suggestions {
                output.push_str(&format!("{}: {}\n", help_prefix, suggestion));
            }
        }

        output
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

/// Print a diagnostic to stderr.
pub fn emit(diagnostic: &Diagnostic, color: bool) {
    eprint!("{}", diagnostic.format(color));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_formatting() {
        let diag = Diagnostic::error("Debian 12: step `import-disk` failed")
            .with_context("qm importdisk exited with code 255")
            .with_context("full log: /var/log/imgforge/imgforge-1700000000.log")
            .with_suggestion(suggestions::COLLABORATOR_FAILED);

        let output = diag.format(false);
        assert!(output.starts_with("error: Debian 12: step `import-disk` failed\n"));
        assert!(output.contains("  = qm importdisk exited with code 255"));
        assert!(output.contains("help: Run `imgforge doctor`"));
    }

    #[test]
    fn test_warning_severity() {
        let diag = Diagnostic::warning("unknown label `Fedora 40`");
        assert!(diag.to_string().starts_with("warning: unknown label"));
    }
}

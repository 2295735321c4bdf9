//! Command implementations

use std::path::PathBuf;
use std::sync::Arc;

use imgforge::util::diagnostic::{emit, Diagnostic};
use imgforge::util::shell::Shell;
use imgforge::Settings;

pub mod build;
pub mod completions;
pub mod doctor;
pub mod list;
pub mod state;

/// Everything a command needs, resolved once in `main`.
pub struct RunContext {
    pub settings: Settings,
    pub shell: Arc<Shell>,
    /// Log file for this run, if one was created
    pub log_file: Option<PathBuf>,
    pub verbose: u8,
}

impl RunContext {
    pub fn emit(&self, diagnostic: &Diagnostic) {
        emit(diagnostic, self.shell.use_color());
    }
}

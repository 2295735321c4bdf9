//! High-level operations.
//!
//! This module contains the implementation of imgforge commands.

pub mod doctor;
pub mod forge_build;
pub mod select;

pub use doctor::{doctor, format_report, CheckResult, DoctorReport};
pub use forge_build::{build, BuildOptions, RunSummary};
pub use select::{parse_menu_input, resolve, Selection, SelectionMode};

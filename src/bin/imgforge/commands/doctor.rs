//! `imgforge doctor` command

use std::process::ExitCode;

use anyhow::Result;
use imgforge::ops::doctor::{doctor, format_report};

use super::RunContext;

pub fn execute(ctx: &RunContext) -> Result<ExitCode> {
    let report = doctor(&ctx.settings);
    print!("{}", format_report(&report, ctx.verbose > 0));

    if report.all_required_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

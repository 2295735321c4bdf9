//! `imgforge list` command

use std::process::ExitCode;

use anyhow::Result;
use imgforge::builder::state::StateStore;
use imgforge::Catalog;

use super::RunContext;

pub fn execute(ctx: &RunContext) -> Result<ExitCode> {
    let catalog = Catalog::load(&ctx.settings.catalog_path)?;
    let state = StateStore::new(&ctx.settings.state_dir);

    let label_width = catalog
        .labels()
        .map(str::len)
        .max()
        .unwrap_or(0)
        .max("LABEL".len());

    println!("{:>6}  {:<label_width$}  {:<8}  SOURCE", "VMID", "LABEL", "STATE");
    for artifact in catalog.artifacts() {
        let tracked = if state.read(artifact.vmid).is_some() {
            "tracked"
        } else {
            "-"
        };
        println!(
            "{:>6}  {:<label_width$}  {:<8}  {}",
            artifact.vmid, artifact.label, tracked, artifact.source
        );
    }

    Ok(ExitCode::SUCCESS)
}

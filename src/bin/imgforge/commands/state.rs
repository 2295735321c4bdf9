//! `imgforge state` command

use std::process::ExitCode;

use anyhow::Result;
use imgforge::builder::state::{StateRecord, StateStore};
use imgforge::util::shell::Status;

use super::RunContext;
use crate::cli::{StateArgs, StateCommand};

pub fn execute(args: &StateArgs, ctx: &RunContext) -> Result<ExitCode> {
    let store = StateStore::new(&ctx.settings.state_dir);

    match args.command {
        StateCommand::Show { vmid: Some(vmid) } => match store.read(vmid) {
            Some(record) => print_records(&[(vmid, record)]),
            None => ctx
                .shell
                .note(format!("no state recorded for vmid {}", vmid)),
        },
        StateCommand::Show { vmid: None } => {
            let records = store.list()?;
            if records.is_empty() {
                ctx.shell.note(format!(
                    "no state recorded in {}",
                    store.dir().display()
                ));
            } else {
                print_records(&records);
            }
        }
        StateCommand::Clear { vmid } => {
            if store.remove(vmid)? {
                ctx.shell
                    .status(Status::Finished, format!("cleared state for vmid {}", vmid));
            } else {
                ctx.shell
                    .note(format!("no state recorded for vmid {}", vmid));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_records(records: &[(u32, StateRecord)]) {
    println!("{:>6}  {:>12}  {:>12}  SIGNATURE", "VMID", "SOURCE MTIME", "BUILT AT");
    for (vmid, record) in records {
        let built_at = record
            .built_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>6}  {:>12}  {:>12}  {}",
            vmid, record.source_mtime, built_at, record.signature
        );
    }
}

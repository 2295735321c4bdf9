//! Interactive image menu.

use std::io::{self, IsTerminal, Write};

use anyhow::Result;
use imgforge::ops::select::parse_menu_input;
use imgforge::Catalog;

/// Whether both stdin and stderr are attached to a terminal.
pub fn is_interactive() -> bool {
    io::stdin().is_terminal() && io::stderr().is_terminal()
}

/// Print a numbered menu on stderr and read the operator's choice.
///
/// Returns the requested labels, unresolved; an empty line yields nothing.
pub fn choose_images(catalog: &Catalog) -> Result<Vec<String>> {
    let mut err = io::stderr().lock();
    writeln!(err, "Available images:")?;
    for (i, artifact) in catalog.artifacts().iter().enumerate() {
        writeln!(err, "  {:>2}) {} (vmid {})", i + 1, artifact.label, artifact.vmid)?;
    }
    write!(err, "Build which? [numbers or labels, `all` for everything] ")?;
    err.flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(parse_menu_input(catalog, &input))
}

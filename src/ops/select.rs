//! Resolving the requested subset of the catalog.

use crate::core::catalog::{Catalog, ALL_SENTINEL};

/// How the operator asked for artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    /// Every entry, in declared order
    All,
    /// Explicit labels, taken verbatim
    Labels(Vec<String>),
}

/// Ordered labels to build, plus the requested labels that matched nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub labels: Vec<String>,
    pub unknown: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Resolve a selection mode against the catalog.
///
/// The sentinel `all` anywhere in an explicit list selects everything.
/// Explicit labels keep the order given; a label named twice is built once.
pub fn resolve(catalog: &Catalog, mode: &SelectionMode) -> Selection {
    let requested = match mode {
        SelectionMode::All => return all(catalog),
        SelectionMode::Labels(labels) => labels,
    };

    if requested
        .iter()
        .any(|l| l.trim().eq_ignore_ascii_case(ALL_SENTINEL))
    {
        let mut selection = all(catalog);
        selection.unknown = unknown_labels(catalog, requested);
        warn_unknown(&selection.unknown);
        return selection;
    }

    let mut selection = Selection::default();
    for label in requested {
        let label = label.trim();
        if catalog.by_label(label).is_none() {
            selection.unknown.push(label.to_string());
        } else if !selection.labels.iter().any(|l| l == label) {
            selection.labels.push(label.to_string());
        }
    }
    warn_unknown(&selection.unknown);
    selection
}

fn all(catalog: &Catalog) -> Selection {
    Selection {
        labels: catalog.labels().map(str::to_string).collect(),
        unknown: Vec::new(),
    }
}

fn unknown_labels(catalog: &Catalog, requested: &[String]) -> Vec<String> {
    requested
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.eq_ignore_ascii_case(ALL_SENTINEL) && catalog.by_label(l).is_none())
        .map(str::to_string)
        .collect()
}

fn warn_unknown(unknown: &[String]) {
    for label in unknown {
        tracing::warn!("unknown label `{}`, skipping", label);
    }
}

/// Turn a line typed at the interactive menu into requested labels.
///
/// Entries are comma separated. Each entry is a label, `all`, or one or more
/// whitespace separated menu numbers (1-based). Anything else is passed
/// through so [`resolve`] reports it as unknown.
pub fn parse_menu_input(catalog: &Catalog, input: &str) -> Vec<String> {
    let mut requested = Vec::new();

    for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if entry.eq_ignore_ascii_case(ALL_SENTINEL) || catalog.by_label(entry).is_some() {
            requested.push(entry.to_string());
            continue;
        }

        let numbers: Option<Vec<usize>> = entry
            .split_whitespace()
            .map(|n| n.parse::<usize>().ok())
            .collect();
        match numbers {
            Some(numbers) => {
                for n in numbers {
                    match n.checked_sub(1).and_then(|i| catalog.artifacts().get(i)) {
                        Some(artifact) => requested.push(artifact.label.clone()),
                        None => requested.push(n.to_string()),
                    }
                }
            }
            None => requested.push(entry.to_string()),
        }
    }

    requested
}

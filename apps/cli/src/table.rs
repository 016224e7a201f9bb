//! Stash listing output.

use std::path::Path;

use stashctl_core::{ListFilter, StashEntry};

/// Replaces a leading home directory with `~`.
fn abbreviate(path: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home
        && let Ok(rest) = path.strip_prefix(home)
    {
        if rest.as_os_str().is_empty() {
            return "~".to_string();
        }
        return format!("~/{}", rest.display());
    }
    path.display().to_string()
}

/// Renders one name per line.
pub fn render_raw(entries: &[StashEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}\n", e.name))
        .collect()
}

/// Renders an aligned table. Empty when there is nothing to show.
///
/// The unmounted view leaves out the state and mount point columns.
pub fn render(entries: &[StashEntry], filter: ListFilter, home: Option<&Path>) -> String {
    if entries.is_empty() {
        return String::new();
    }

    let with_mount = filter != ListFilter::Unmounted;
    let header: Vec<&str> = if with_mount {
        vec!["NAME", "STATE", "ROOT", "SIZE", "PATH", "REMOTE"]
    } else {
        vec!["NAME", "ROOT", "SIZE", "REMOTE"]
    };

    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            let root = abbreviate(&e.vault_root, home);
            let size = e.size.clone().unwrap_or_else(|| "-".to_string());
            let remote = e.remote.clone().unwrap_or_else(|| "-".to_string());
            if with_mount {
                let path = e
                    .mount_point
                    .as_deref()
                    .map(|p| abbreviate(p, home))
                    .unwrap_or_else(|| "-".to_string());
                vec![e.name.clone(), e.state.to_string(), root, size, path, remote]
            } else {
                vec![e.name.clone(), root, size, remote]
            }
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    for row in std::iter::once(&header).chain(&rows) {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ");
        output.push_str(line.trim_end());
        output.push('\n');
    }
    output
}

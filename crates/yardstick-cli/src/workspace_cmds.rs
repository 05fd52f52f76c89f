//! `yardstick list` and `yardstick clean`: inspect and delete run
//! workspaces.

use std::path::Path;

use anyhow::{Result, bail};

use yardstick_core::workspace::{Workspace, WorkspaceManager};

/// Print every workspace under the root.
pub fn run_list(manager: &WorkspaceManager) -> Result<()> {
    let entries = manager.list_workspaces()?;
    if entries.is_empty() {
        println!("No workspaces under {}", manager.root().display());
        return Ok(());
    }

    println!("{:<24}  {:<10}  PATH", "RUN ID", "LOCK");
    for entry in &entries {
        let lock = match entry.locked_by {
            Some(pid) => format!("pid {pid}"),
            None => "-".to_string(),
        };
        println!("{:<24}  {:<10}  {}", entry.run_id, lock, entry.path.display());
    }
    Ok(())
}

/// Delete one workspace (by run id or path), or every unlocked workspace
/// with `all`.
pub fn run_clean(manager: &WorkspaceManager, target: Option<&str>, all: bool) -> Result<()> {
    let workspaces = match (target, all) {
        (Some(_), true) => bail!("pass either a workspace or --all, not both"),
        (None, false) => bail!("nothing to clean: pass a run id, a path, or --all"),
        (Some(target), false) => vec![open_target(manager, target)?],
        (None, true) => manager
            .list_workspaces()?
            .into_iter()
            .map(|entry| Workspace::open(&entry.path))
            .collect::<Result<Vec<_>, _>>()?,
    };

    let mut removed = 0;
    let mut skipped = 0;
    for workspace in workspaces {
        let root = workspace.root().to_path_buf();
        match workspace.cleanup() {
            Ok(()) => {
                println!("  Removed: {}", root.display());
                removed += 1;
            }
            Err(e) if target.is_some() => return Err(e.into()),
            Err(e) => {
                eprintln!("  Skipped {}: {e}", root.display());
                skipped += 1;
            }
        }
    }

    println!("\nCleanup complete: {removed} workspace(s) removed, {skipped} skipped.");
    Ok(())
}

fn open_target(manager: &WorkspaceManager, target: &str) -> Result<Workspace> {
    let path = Path::new(target);
    if target.contains(std::path::MAIN_SEPARATOR) || path.is_dir() {
        return Ok(Workspace::open(path)?);
    }
    Ok(manager.open(target)?)
}

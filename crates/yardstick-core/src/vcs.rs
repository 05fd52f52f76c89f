//! Thin wrappers around the `git` binary.
//!
//! Every call is synchronous; async callers wrap them in
//! `tokio::task::spawn_blocking`. Nothing here mutates a working tree
//! except [`clone_at`], which creates one.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Errors from git invocations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git binary could not be launched.
    #[error("git command failed: {message}")]
    Launch {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The requested branch, tag, or commit does not exist in the remote.
    #[error("ref {reference:?} not found in {url}: {stderr}")]
    RefNotFound {
        reference: String,
        url: String,
        stderr: String,
    },

    /// Reading a working-tree file failed.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-file line counts between a base commit and the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Path relative to the repository root.
    pub path: String,
    /// Lines added; `None` for binary files.
    pub added: Option<u64>,
    /// Lines removed; `None` for binary files.
    pub removed: Option<u64>,
    /// Whether the file is untracked (created and never added).
    pub untracked: bool,
}

impl FileChange {
    /// Added plus removed lines (binary files count as zero).
    pub fn total(&self) -> u64 {
        self.added.unwrap_or(0) + self.removed.unwrap_or(0)
    }
}

/// Run git with `args` in `dir` and return stdout on success.
pub fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    tracing::debug!(dir = %dir.display(), args = ?args, "running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Launch {
            message: format!("failed to run git {}", args.first().unwrap_or(&"")),
            source: e,
        })?;

    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.first().unwrap_or(&"").to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check whether git is installed.
pub fn is_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve the commit checked out in `dir`.
pub fn head_sha(dir: &Path) -> Result<String, GitError> {
    let sha = git(dir, &["rev-parse", "HEAD"])?.trim().to_string();
    if sha.is_empty() {
        return Err(GitError::Exit {
            command: "rev-parse".into(),
            code: 0,
            stderr: "empty output".into(),
        });
    }
    Ok(sha)
}

/// Shallow-clone `url` into `dest` at `reference` and return the resolved
/// commit SHA.
///
/// Branches and tags are cloned with `--depth 1 --branch`. If that fails
/// the reference is treated as a full commit SHA and fetched directly.
/// `dest` must not exist yet; on failure it is removed again.
pub fn clone_at(url: &str, reference: &str, dest: &Path) -> Result<String, GitError> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    let dest_str = dest.to_string_lossy();

    let branch_clone = git(
        parent,
        &[
            "clone",
            "--quiet",
            "--depth",
            "1",
            "--branch",
            reference,
            "--",
            url,
            dest_str.as_ref(),
        ],
    );

    match branch_clone {
        Ok(_) => return head_sha(dest),
        Err(GitError::Launch { message, source }) => {
            return Err(GitError::Launch { message, source });
        }
        Err(e) => {
            tracing::debug!(reference, error = %e, "branch clone failed, trying commit fetch");
            remove_partial(dest);
        }
    }

    std::fs::create_dir_all(dest).map_err(|e| GitError::Launch {
        message: format!("failed to create {}", dest.display()),
        source: e,
    })?;

    let result = fetch_commit(url, reference, dest);
    if result.is_err() {
        remove_partial(dest);
    }
    result
}

fn fetch_commit(url: &str, reference: &str, dest: &Path) -> Result<String, GitError> {
    git(dest, &["init", "--quiet"])?;
    git(dest, &["remote", "add", "origin", url])?;
    match git(dest, &["fetch", "--quiet", "--depth", "1", "origin", reference]) {
        Ok(_) => {}
        Err(GitError::Exit { stderr, .. }) => {
            return Err(GitError::RefNotFound {
                reference: reference.to_string(),
                url: url.to_string(),
                stderr,
            });
        }
        Err(e) => return Err(e),
    }
    git(dest, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])?;
    head_sha(dest)
}

fn remove_partial(dest: &Path) {
    if dest.exists() {
        tracing::warn!(path = %dest.display(), "removing partial clone");
        let _ = std::fs::remove_dir_all(dest);
    }
}

/// Line counts for every file that differs between `base` (default
/// `HEAD`) and the working tree, including untracked files.
///
/// Read-only: the index and object store are never written.
pub fn diff_numstat(dir: &Path, base: Option<&str>) -> Result<Vec<FileChange>, GitError> {
    let base = base.unwrap_or("HEAD");
    let out = git(dir, &["diff", "--numstat", "--no-renames", "-z", base])?;
    let mut changes = parse_numstat_z(&out);

    for path in untracked_files(dir)? {
        let full = dir.join(&path);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            // Gone since git listed it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(GitError::Read { path: full, source: e }),
        };
        let added = if meta.file_type().is_symlink() {
            // git stores the link target as a one-line blob.
            Some(1)
        } else if meta.is_dir() {
            // Nested repository, listed as `dir/`.
            continue;
        } else {
            let bytes = std::fs::read(&full).map_err(|e| GitError::Read {
                path: full.clone(),
                source: e,
            })?;
            if crate::diff::is_binary(&bytes) {
                None
            } else {
                Some(String::from_utf8_lossy(&bytes).lines().count() as u64)
            }
        };
        changes.push(FileChange {
            path,
            added,
            removed: added.map(|_| 0),
            untracked: true,
        });
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

/// Untracked, non-ignored files relative to the repository root.
pub fn untracked_files(dir: &Path) -> Result<Vec<String>, GitError> {
    let out = git(dir, &["ls-files", "--others", "--exclude-standard", "-z"])?;
    Ok(out
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// Unified patch of tracked changes between `base` and the working tree.
pub fn diff_patch(dir: &Path, base: Option<&str>) -> Result<String, GitError> {
    git(dir, &["diff", "--no-renames", "--no-color", base.unwrap_or("HEAD")])
}

/// Parse `git diff --numstat -z --no-renames` output.
///
/// Each record is `added\tremoved\tpath\0`; binary files report `-` for
/// both counts.
fn parse_numstat_z(out: &str) -> Vec<FileChange> {
    out.split('\0')
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let mut parts = record.splitn(3, '\t');
            let added = parts.next()?;
            let removed = parts.next()?;
            let path = parts.next()?.trim_start_matches('\n');
            Some(FileChange {
                path: path.to_string(),
                added: added.trim().parse().ok(),
                removed: removed.trim().parse().ok(),
                untracked: false,
            })
        })
        .collect()
}

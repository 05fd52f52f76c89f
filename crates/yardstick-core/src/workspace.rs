//! Per-run filesystem sandboxes.
//!
//! Every run gets its own directory under a workspace root:
//!
//! ```text
//! <root>/run-<id>/
//!     modified/              clone the agent works in
//!     expected/              optional known-good reference clone
//!     artifacts/
//!         log.json
//!         results.json
//!         evaluator-artifacts/<evaluator>/...
//!     .lock                  pid of the process that owns the run
//! ```
//!
//! The lock is advisory. A lock file only blocks a new run while the
//! process it names is still alive, so a crashed run never wedges its
//! workspace. PID liveness is an approximation: a recycled PID can make a
//! stale lock look held. A lock file that cannot be parsed is treated as
//! held, never as stale.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use thiserror::Error;

use crate::vcs::{self, GitError};

pub const MODIFIED_DIR: &str = "modified";
pub const EXPECTED_DIR: &str = "expected";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const EVALUATOR_ARTIFACTS_DIR: &str = "evaluator-artifacts";
pub const LOCK_FILE: &str = ".lock";
const RUN_DIR_PREFIX: &str = "run-";

/// Errors that can occur while managing a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The workspace root cannot be created or written.
    #[error("workspace root {path} is not writable: {source}")]
    RootNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A workspace with the same run id already exists.
    #[error("workspace already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Another live process holds the workspace lock.
    #[error("workspace {path} is locked by running process {pid}")]
    AlreadyLocked { path: PathBuf, pid: u32 },

    /// The lock file exists but does not name a process.
    #[error("lock file {0} is unreadable; delete it if no run is using this workspace")]
    LockUnreadable(PathBuf),

    /// A filesystem operation inside the workspace failed.
    #[error("workspace I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cloning one of the repository variants failed.
    #[error("failed to clone {target} tree: {source}")]
    Clone {
        target: CloneTarget,
        #[source]
        source: GitError,
    },

    /// The path does not look like a workspace.
    #[error("not a workspace: {0}")]
    NotAWorkspace(PathBuf),
}

/// Which repository variant a clone populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneTarget {
    /// The tree the agent modifies.
    Modified,
    /// The known-good reference tree.
    Expected,
}

impl CloneTarget {
    pub fn dir_name(self) -> &'static str {
        match self {
            CloneTarget::Modified => MODIFIED_DIR,
            CloneTarget::Expected => EXPECTED_DIR,
        }
    }
}

impl fmt::Display for CloneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Unique run identifier: UTC timestamp plus a random suffix, so two runs
/// started in the same second (or under clock skew) still differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&rand::distr::Alphanumeric)
            .take(6)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!("{}-{suffix}", Utc::now().format("%Y%m%dT%H%M%S")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A workspace directory found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub run_id: String,
    pub path: PathBuf,
    /// PID of the live process holding the lock, if any.
    pub locked_by: Option<u32>,
}

/// Allocates workspaces under a root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<root>/run-<id>/` with its artifacts directories.
    ///
    /// Fails with [`WorkspaceError::RootNotWritable`] if the root cannot be
    /// created or written, and [`WorkspaceError::AlreadyExists`] if the run
    /// id collides with an existing workspace.
    pub fn create_workspace(&self, run_id: &RunId) -> Result<Workspace, WorkspaceError> {
        std::fs::create_dir_all(&self.root).map_err(|e| WorkspaceError::RootNotWritable {
            path: self.root.clone(),
            source: e,
        })?;

        let dir = self.root.join(format!("{RUN_DIR_PREFIX}{run_id}"));
        if let Err(e) = std::fs::create_dir(&dir) {
            return Err(match e.kind() {
                std::io::ErrorKind::AlreadyExists => WorkspaceError::AlreadyExists(dir),
                _ => WorkspaceError::RootNotWritable {
                    path: self.root.clone(),
                    source: e,
                },
            });
        }

        let workspace = Workspace::layout(run_id.to_string(), dir);
        let evaluator_dir = workspace.artifacts_dir.join(EVALUATOR_ARTIFACTS_DIR);
        if let Err(e) = std::fs::create_dir_all(&evaluator_dir) {
            let _ = std::fs::remove_dir_all(&workspace.root);
            return Err(WorkspaceError::Io {
                path: evaluator_dir,
                source: e,
            });
        }

        tracing::info!(run_id = %run_id, path = %workspace.root.display(), "created workspace");
        Ok(workspace)
    }

    /// List every workspace under the root, sorted by run id.
    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceEntry>, WorkspaceError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.root).map_err(|e| WorkspaceError::Io {
            path: self.root.clone(),
            source: e,
        })?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(run_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(RUN_DIR_PREFIX))
                .map(str::to_string)
            else {
                continue;
            };
            if !path.is_dir() {
                continue;
            }
            let locked_by = read_lock_pid(&path.join(LOCK_FILE)).filter(|pid| pid_alive(*pid));
            found.push(WorkspaceEntry {
                run_id,
                path,
                locked_by,
            });
        }
        found.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(found)
    }

    /// Re-open the workspace for `run_id`.
    pub fn open(&self, run_id: &str) -> Result<Workspace, WorkspaceError> {
        Workspace::open(&self.root.join(format!("{RUN_DIR_PREFIX}{run_id}")))
    }
}

/// Held lock: the file we wrote and the pid we wrote into it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockHandle {
    path: PathBuf,
    pid: u32,
}

/// One run's sandbox. Directories are only written by the clones made at
/// setup time and by the agent process; evaluators only read.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    modified_dir: PathBuf,
    expected_dir: Option<PathBuf>,
    artifacts_dir: PathBuf,
    lock: Option<LockHandle>,
}

impl Workspace {
    fn layout(id: String, root: PathBuf) -> Self {
        Self {
            id,
            modified_dir: root.join(MODIFIED_DIR),
            expected_dir: None,
            artifacts_dir: root.join(ARTIFACTS_DIR),
            root,
            lock: None,
        }
    }

    /// Open an existing workspace directory without taking its lock.
    pub fn open(root: &Path) -> Result<Self, WorkspaceError> {
        let id = root
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(RUN_DIR_PREFIX))
            .map(str::to_string);
        let Some(id) = id.filter(|_| root.is_dir()) else {
            return Err(WorkspaceError::NotAWorkspace(root.to_path_buf()));
        };

        let mut workspace = Self::layout(id, root.to_path_buf());
        let expected = root.join(EXPECTED_DIR);
        if expected.is_dir() {
            workspace.expected_dir = Some(expected);
        }
        Ok(workspace)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn modified_dir(&self) -> &Path {
        &self.modified_dir
    }

    pub fn expected_dir(&self) -> Option<&Path> {
        self.expected_dir.as_deref()
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Directory reserved for one evaluator's artifacts.
    pub fn evaluator_artifacts_dir(&self, evaluator: &str) -> PathBuf {
        self.artifacts_dir
            .join(EVALUATOR_ARTIFACTS_DIR)
            .join(artifact_dir_name(evaluator))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Shallow-clone `url` at `reference` into the `target` subdirectory and
    /// return the resolved commit SHA.
    pub fn clone_repository(
        &mut self,
        url: &str,
        reference: &str,
        target: CloneTarget,
    ) -> Result<String, WorkspaceError> {
        let dest = self.root.join(target.dir_name());
        let sha = vcs::clone_at(url, reference, &dest)
            .map_err(|source| WorkspaceError::Clone { target, source })?;

        if target == CloneTarget::Expected {
            self.expected_dir = Some(dest);
        }
        tracing::info!(
            run_id = %self.id,
            target = %target,
            reference,
            commit = %sha,
            "cloned repository"
        );
        Ok(sha)
    }

    /// Take the workspace lock for the current process.
    ///
    /// Fails with [`WorkspaceError::AlreadyLocked`] if the lock file names a
    /// process that is still alive, and [`WorkspaceError::LockUnreadable`]
    /// if it names none. A lock left by a dead process is reclaimed.
    ///
    /// Acquirers on the same workspace are serialized with an exclusive
    /// `flock` on the workspace directory, and the lock file only appears
    /// once its pid is written: it is filled in under a temporary name and
    /// hard-linked into place, which fails if a lock already exists.
    pub fn acquire_lock(&mut self) -> Result<(), WorkspaceError> {
        if self.lock.is_some() {
            return Ok(());
        }
        let path = self.lock_path();
        let _exclusive = DirLock::acquire(&self.root)?;

        match lock_state(&path) {
            LockState::Free => {}
            LockState::Held(pid) => return Err(WorkspaceError::AlreadyLocked { path, pid }),
            LockState::Unreadable => return Err(WorkspaceError::LockUnreadable(path)),
            LockState::Stale(stale_pid) => {
                tracing::warn!(
                    path = %path.display(),
                    stale_pid,
                    "reclaiming stale workspace lock"
                );
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(WorkspaceError::Io { path, source: e }),
                }
            }
        }

        let pid = std::process::id();
        self.publish_lock(&path, pid)?;

        tracing::debug!(path = %path.display(), pid, "acquired workspace lock");
        self.lock = Some(LockHandle { path, pid });
        Ok(())
    }

    /// Write `pid` to a private file, then link it to `path`.
    fn publish_lock(&self, path: &Path, pid: u32) -> Result<(), WorkspaceError> {
        let suffix: u32 = rand::rng().random();
        let staging = self.root.join(format!("{LOCK_FILE}.{pid}.{suffix:08x}"));
        let io_err = |source| WorkspaceError::Io {
            path: staging.clone(),
            source,
        };

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .and_then(|mut file| {
                writeln!(file, "{pid}")?;
                file.sync_all()
            });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&staging);
            return Err(io_err(e));
        }

        let linked = std::fs::hard_link(&staging, path);
        let _ = std::fs::remove_file(&staging);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Written by something that does not take the directory lock.
                Err(match lock_state(path) {
                    LockState::Held(holder) | LockState::Stale(holder) => {
                        WorkspaceError::AlreadyLocked {
                            path: path.to_path_buf(),
                            pid: holder,
                        }
                    }
                    LockState::Free | LockState::Unreadable => {
                        WorkspaceError::LockUnreadable(path.to_path_buf())
                    }
                })
            }
            Err(e) => Err(WorkspaceError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Whether a live process holds the lock (this one included).
    pub fn is_locked(&self) -> bool {
        self.lock_holder().is_some()
    }

    /// PID of the live lock holder, if any.
    pub fn lock_holder(&self) -> Option<u32> {
        read_lock_pid(&self.lock_path()).filter(|pid| pid_alive(*pid))
    }

    /// Release a lock taken by [`Workspace::acquire_lock`]. A lock file that
    /// now names a different process is left alone.
    pub fn release_lock(&mut self) -> Result<(), WorkspaceError> {
        let Some(handle) = self.lock.take() else {
            return Ok(());
        };
        if read_lock_pid(&handle.path) != Some(handle.pid) {
            tracing::warn!(path = %handle.path.display(), "lock file changed owner, not removing");
            return Ok(());
        }
        match std::fs::remove_file(&handle.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::Io {
                path: handle.path,
                source: e,
            }),
        }
    }

    /// Release our lock and delete the whole workspace tree.
    ///
    /// Refuses if another live process holds the lock.
    pub fn cleanup(mut self) -> Result<(), WorkspaceError> {
        self.release_lock()?;
        if let Some(pid) = self.lock_holder() {
            return Err(WorkspaceError::AlreadyLocked {
                path: self.lock_path(),
                pid,
            });
        }
        remove_tree(&self.root)
    }
}

/// File-system-safe directory name for an evaluator's artifacts. Distinct
/// names can map to the same directory; configuration validation rejects
/// such pairs.
pub fn artifact_dir_name(evaluator: &str) -> String {
    evaluator
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn remove_tree(root: &Path) -> Result<(), WorkspaceError> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => {
            tracing::info!(path = %root.display(), "removed workspace");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::Io {
            path: root.to_path_buf(),
            source: e,
        }),
    }
}

/// Scoped ownership of a workspace.
///
/// Dropping the guard releases the lock and, unless [`WorkspaceGuard::keep`]
/// was called, deletes the tree. This runs on every exit path of the
/// orchestrator: normal return, `?` propagation, task cancellation.
#[derive(Debug)]
pub struct WorkspaceGuard {
    workspace: Option<Workspace>,
    remove_on_drop: bool,
}

impl WorkspaceGuard {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace: Some(workspace),
            remove_on_drop: true,
        }
    }

    /// Keep (`true`) or delete (`false`) the tree when the guard drops.
    pub fn keep(&mut self, keep: bool) {
        self.remove_on_drop = !keep;
    }

    pub fn workspace(&self) -> &Workspace {
        self.workspace
            .as_ref()
            .unwrap_or_else(|| unreachable!("workspace taken before drop"))
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        self.workspace
            .as_mut()
            .unwrap_or_else(|| unreachable!("workspace taken before drop"))
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let Some(mut workspace) = self.workspace.take() else {
            return;
        };
        if let Err(e) = workspace.release_lock() {
            tracing::warn!(run_id = %workspace.id, error = %e, "failed to release workspace lock");
        }
        if self.remove_on_drop {
            if let Err(e) = remove_tree(&workspace.root) {
                tracing::warn!(run_id = %workspace.id, error = %e, "failed to remove workspace");
            }
        }
    }
}

fn read_lock_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// What a lock file says about its workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Free,
    Held(u32),
    Stale(u32),
    /// Present but empty, garbled, or unreadable.
    Unreadable,
}

fn lock_state(path: &Path) -> LockState {
    match std::fs::read_to_string(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => LockState::Free,
        Err(_) => LockState::Unreadable,
        Ok(text) => match text.trim().parse::<u32>() {
            Ok(pid) if pid_alive(pid) => LockState::Held(pid),
            Ok(pid) => LockState::Stale(pid),
            Err(_) => LockState::Unreadable,
        },
    }
}

/// Exclusive `flock` on a directory, released when dropped.
#[cfg(unix)]
struct DirLock(std::fs::File);

#[cfg(unix)]
impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, WorkspaceError> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::File::open(dir).map_err(|e| WorkspaceError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        // SAFETY: the descriptor is owned by `file` and outlives the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(WorkspaceError::Io {
                path: dir.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self(file))
    }
}

#[cfg(not(unix))]
struct DirLock;

#[cfg(not(unix))]
impl DirLock {
    fn acquire(_dir: &Path) -> Result<Self, WorkspaceError> {
        Ok(Self)
    }
}

/// Probe whether `pid` names a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let ret = unsafe { libc::kill(raw, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a liveness probe, any recorded pid is treated as alive.
#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, WorkspaceManager) {
        let dir = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(dir.path().join("workspaces"));
        (dir, mgr)
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn run_ids_are_unique() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), "20260101T000000-abcdef".len());
    }

    #[test]
    fn create_lays_out_directories() {
        let (_dir, mgr) = manager();
        let ws = mgr.create_workspace(&RunId::from("one")).unwrap();
        assert!(ws.root().ends_with("run-one"));
        assert!(ws.artifacts_dir().join(EVALUATOR_ARTIFACTS_DIR).is_dir());
        assert!(!ws.modified_dir().exists());
        assert!(ws.expected_dir().is_none());
        assert_eq!(
            ws.evaluator_artifacts_dir("agentic-judge:security"),
            ws.artifacts_dir()
                .join(EVALUATOR_ARTIFACTS_DIR)
                .join("agentic-judge_security")
        );
    }

    #[test]
    fn duplicate_run_id_is_rejected() {
        let (_dir, mgr) = manager();
        mgr.create_workspace(&RunId::from("dup")).unwrap();
        let err = mgr.create_workspace(&RunId::from("dup")).unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_root_is_reported() {
        use std::os::unix::fs::PermissionsExt;
        if unsafe { libc::geteuid() } == 0 {
            // root ignores directory permissions
            return;
        }
        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("ro");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

        let mgr = WorkspaceManager::new(&locked);
        let err = mgr.create_workspace(&RunId::generate()).unwrap_err();
        assert!(matches!(err, WorkspaceError::RootNotWritable { .. }), "got {err:?}");

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[test]
    fn lock_round_trip() {
        let (_dir, mgr) = manager();
        let mut ws = mgr.create_workspace(&RunId::from("lock")).unwrap();
        assert!(!ws.is_locked());

        ws.acquire_lock().unwrap();
        assert!(ws.is_locked());
        assert_eq!(ws.lock_holder(), Some(std::process::id()));

        ws.release_lock().unwrap();
        assert!(!ws.is_locked());
        assert!(!ws.lock_path().exists());
    }

    #[test]
    fn live_lock_blocks_second_handle() {
        let (_dir, mgr) = manager();
        let mut first = mgr.create_workspace(&RunId::from("shared")).unwrap();
        first.acquire_lock().unwrap();

        let mut second = mgr.open("shared").unwrap();
        let err = second.acquire_lock().unwrap_err();
        match err {
            WorkspaceError::AlreadyLocked { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let (_dir, mgr) = manager();
        let mut ws = mgr.create_workspace(&RunId::from("stale")).unwrap();
        let pid = dead_pid();
        std::fs::write(ws.lock_path(), format!("{pid}\n")).unwrap();
        assert!(!ws.is_locked());

        ws.acquire_lock().unwrap();
        assert_eq!(ws.lock_holder(), Some(std::process::id()));
    }

    #[test]
    fn unreadable_lock_is_treated_as_held() {
        let (_dir, mgr) = manager();
        let mut ws = mgr.create_workspace(&RunId::from("garbage")).unwrap();
        for contents in ["not a pid", "", "\n"] {
            std::fs::write(ws.lock_path(), contents).unwrap();
            let err = ws.acquire_lock().unwrap_err();
            assert!(matches!(err, WorkspaceError::LockUnreadable(_)), "got {err:?}");
            assert_eq!(std::fs::read_to_string(ws.lock_path()).unwrap(), contents);
        }
    }

    #[test]
    fn lock_being_written_is_not_taken() {
        let (_dir, mgr) = manager();
        let mut ws = mgr.create_workspace(&RunId::from("midwrite")).unwrap();
        // Another writer has created the file but not yet written its pid.
        let _pending = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(ws.lock_path())
            .unwrap();

        assert!(ws.acquire_lock().is_err());
        assert!(std::fs::read_to_string(ws.lock_path()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_reclaimers_get_one_lock() {
        let (_dir, mgr) = manager();
        let ws = mgr.create_workspace(&RunId::from("contended")).unwrap();
        std::fs::write(ws.lock_path(), format!("{}\n", dead_pid())).unwrap();
        let root = ws.root().to_path_buf();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut ws = Workspace::open(&root).unwrap();
                    barrier.wait();
                    // Keep the handle so a winner's lock is not released.
                    let result = ws.acquire_lock();
                    (result.is_ok(), ws)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results.iter().filter(|(ok, _)| *ok).count();
        assert_eq!(winners, 1);
        assert_eq!(ws.lock_holder(), Some(std::process::id()));
        let staging_left = std::fs::read_dir(&root)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".lock."))
            .count();
        assert_eq!(staging_left, 0);
    }

    #[test]
    fn cleanup_refuses_foreign_live_lock() {
        let (_dir, mgr) = manager();
        let mut owner = mgr.create_workspace(&RunId::from("busy")).unwrap();
        owner.acquire_lock().unwrap();

        let other = mgr.open("busy").unwrap();
        let err = other.cleanup().unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyLocked { .. }));
        assert!(owner.root().exists());

        let root = owner.root().to_path_buf();
        owner.cleanup().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn guard_removes_tree_by_default() {
        let (_dir, mgr) = manager();
        let mut ws = mgr.create_workspace(&RunId::from("guarded")).unwrap();
        ws.acquire_lock().unwrap();
        let root = ws.root().to_path_buf();
        {
            let _guard = WorkspaceGuard::new(ws);
        }
        assert!(!root.exists());
    }

    #[test]
    fn guard_keep_retains_tree_but_releases_lock() {
        let (_dir, mgr) = manager();
        let mut ws = mgr.create_workspace(&RunId::from("kept")).unwrap();
        ws.acquire_lock().unwrap();
        let root = ws.root().to_path_buf();
        {
            let mut guard = WorkspaceGuard::new(ws);
            guard.keep(true);
            assert!(guard.workspace().is_locked());
        }
        assert!(root.exists());
        assert!(!root.join(LOCK_FILE).exists());
    }

    #[test]
    fn list_reports_lock_state() {
        let (_dir, mgr) = manager();
        assert!(mgr.list_workspaces().unwrap().is_empty());

        let mut a = mgr.create_workspace(&RunId::from("a")).unwrap();
        a.acquire_lock().unwrap();
        mgr.create_workspace(&RunId::from("b")).unwrap();
        std::fs::create_dir_all(mgr.root().join("not-a-run")).unwrap();

        let entries = mgr.list_workspaces().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].run_id, "a");
        assert_eq!(entries[0].locked_by, Some(std::process::id()));
        assert_eq!(entries[1].run_id, "b");
        assert_eq!(entries[1].locked_by, None);
    }

    #[test]
    fn open_rejects_non_workspace() {
        let dir = TempDir::new().unwrap();
        let err = Workspace::open(dir.path()).unwrap_err();
        assert!(matches!(err, WorkspaceError::NotAWorkspace(_)));
    }

    #[test]
    fn pid_probe() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(dead_pid()));
        assert!(!pid_alive(0));
    }
}

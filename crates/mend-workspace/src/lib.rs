//! Scoped git working tree for the modify stage.
//!
//! One shared directory bound to a remote, guarded by a mutex: only one
//! modifier sequence (ensure → branch → write → commit) runs at a time.
//! Snapshots deep-copy the tree (minus `.git`) into a bounded ring so a
//! failed test round can restore its pre-modification baseline
//! byte-for-byte.
//!
//! The repository is opened fresh for each operation; local repo opens are
//! sub-millisecond and this avoids stale index state between calls.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use mend_core::config::RepoConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("git operation failed: {0}")]
    Git(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("working tree not initialized: {0}")]
    NotInitialized(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),
}

impl From<git2::Error> for WorkspaceError {
    fn from(e: git2::Error) -> Self {
        WorkspaceError::Git(e.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the file with the new content.
    Replace,
    /// Append the content plus a trailing newline to the existing file.
    Insert,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
}

#[derive(Debug)]
struct Snapshot {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    /// Relative path → file bytes.
    files: Vec<(PathBuf, Vec<u8>)>,
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

struct Inner {
    remote_url: Option<String>,
    work_dir: PathBuf,
    snapshots: VecDeque<Snapshot>,
    snapshot_capacity: usize,
}

/// The shared working tree. Call [`Workspace::lock`] and perform the whole
/// mutation sequence through the returned guard; operations are blocking
/// and belong inside `spawn_blocking` on async callers.
pub struct Workspace {
    inner: Mutex<Inner>,
}

impl Workspace {
    pub fn new(config: &RepoConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                remote_url: config.url.clone(),
                work_dir: config.work_dir.clone(),
                snapshots: VecDeque::new(),
                snapshot_capacity: config.snapshot_capacity.max(1),
            }),
        }
    }

    pub fn lock(&self) -> WorkspaceGuard<'_> {
        WorkspaceGuard(self.inner.lock().expect("workspace lock poisoned"))
    }
}

pub struct WorkspaceGuard<'a>(MutexGuard<'a, Inner>);

impl WorkspaceGuard<'_> {
    pub fn work_dir(&self) -> &Path {
        &self.0.work_dir
    }

    /// Make the working tree exist. Idempotent: an existing repository is
    /// left untouched; otherwise the remote is cloned, or — with no remote
    /// configured — a fresh repository is initialized with a root commit so
    /// branching works immediately (local fixtures, tests).
    pub fn ensure(&mut self) -> Result<()> {
        let work_dir = self.0.work_dir.clone();
        if work_dir.join(".git").exists() {
            return Ok(());
        }

        match self.0.remote_url.clone() {
            Some(url) => {
                info!(%url, dir = %work_dir.display(), "cloning working tree");
                git2::Repository::clone(&url, &work_dir)?;
            }
            None => {
                info!(dir = %work_dir.display(), "initializing empty working tree");
                std::fs::create_dir_all(&work_dir)?;
                let repo = git2::Repository::init(&work_dir)?;
                let sig = signature()?;
                let tree_id = repo.index()?.write_tree()?;
                let tree = repo.find_tree(tree_id)?;
                repo.commit(Some("HEAD"), &sig, &sig, "initialize working tree", &tree, &[])?;
            }
        }
        Ok(())
    }

    fn open(&self) -> Result<git2::Repository> {
        let work_dir = &self.0.work_dir;
        if !work_dir.join(".git").exists() {
            return Err(WorkspaceError::NotInitialized(
                work_dir.display().to_string(),
            ));
        }
        Ok(git2::Repository::open(work_dir)?)
    }

    /// Create and check out a new branch at the current head.
    pub fn checkout_new_branch(&mut self, name: &str) -> Result<()> {
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(name, &head, false)?;
        repo.set_head(&format!("refs/heads/{name}"))?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        debug!(branch = name, "checked out new branch");
        Ok(())
    }

    /// Write a file relative to the tree root. Returns the number of lines
    /// the written content contributes.
    pub fn write_file(&mut self, path: &str, content: &str, mode: WriteMode) -> Result<usize> {
        let full = self.0.work_dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match mode {
            WriteMode::Replace => std::fs::write(&full, content)?,
            WriteMode::Insert => {
                let mut existing = match std::fs::read_to_string(&full) {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                    Err(e) => return Err(WorkspaceError::Io(e)),
                };
                existing.push_str(content);
                existing.push('\n');
                std::fs::write(&full, existing)?;
            }
        }
        Ok(content.lines().count())
    }

    /// Remove a file from the tree. Removing a file that is already gone
    /// is not an error.
    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let full = self.0.work_dir.join(path);
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::Io(e)),
        }
    }

    /// Stage everything and commit. Returns the commit hash.
    pub fn commit(&mut self, message: &str) -> Result<String> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        // add_all does not stage deletions; update_all does.
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature()?;

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(commit = %oid, "committed working tree");
        Ok(oid.to_string())
    }

    /// Deep-copy the working tree (minus `.git`) into the snapshot ring.
    /// The oldest snapshot is evicted beyond the configured capacity.
    pub fn snapshot(&mut self, name: &str) -> Result<Uuid> {
        let work_dir = self.0.work_dir.clone();
        if !work_dir.exists() {
            return Err(WorkspaceError::NotInitialized(
                work_dir.display().to_string(),
            ));
        }
        let mut files = Vec::new();
        collect_files(&work_dir, &work_dir, &mut files)?;

        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
            files,
        };
        let id = snapshot.id;
        debug!(%id, name, files = snapshot.files.len(), "captured snapshot");

        self.0.snapshots.push_back(snapshot);
        while self.0.snapshots.len() > self.0.snapshot_capacity {
            self.0.snapshots.pop_front();
        }
        Ok(id)
    }

    /// Write every file captured by the snapshot back, byte-for-byte.
    pub fn restore(&mut self, id: Uuid) -> Result<()> {
        let work_dir = self.0.work_dir.clone();
        let snapshot = self
            .0
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .ok_or(WorkspaceError::SnapshotNotFound(id))?;

        for (rel, bytes) in &snapshot.files {
            let full = work_dir.join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, bytes)?;
        }
        info!(%id, files = snapshot.files.len(), "restored snapshot");
        Ok(())
    }

    /// Most recent snapshot id, if any.
    pub fn latest_snapshot(&self) -> Option<Uuid> {
        self.0.snapshots.back().map(|s| s.id)
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.0
            .snapshots
            .iter()
            .map(|s| SnapshotInfo {
                id: s.id,
                name: s.name.clone(),
                created_at: s.created_at,
                file_count: s.files.len(),
            })
            .collect()
    }
}

fn signature() -> Result<git2::Signature<'static>> {
    Ok(git2::Signature::now("mend", "mend@localhost")?)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| WorkspaceError::Git("path outside working tree".into()))?
                .to_path_buf();
            out.push((rel, std::fs::read(&path)?));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Hierarchical document model.
//!
//! Every key in a repo partition holds one of the shapes below. Directories and
//! the repo root carry pointer indexes: for each immediate child name, the
//! timestamp of that child's last known mutation, split into "present" and
//! "deleted". A name lives in at most one of the two maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Timestamp, Version};

/// A stored document body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Document {
    File(FileDoc),
    Directory(DirectoryDoc),
    Repo(RepoDoc),
    /// Retired revision; never returned as a live document
    Tombstone,
}

/// Coarse shape of a document, for error messages and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    File,
    Directory,
    Repo,
    Tombstone,
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocKind::File => "file",
            DocKind::Directory => "directory",
            DocKind::Repo => "repo",
            DocKind::Tombstone => "tombstone",
        };
        f.write_str(name)
    }
}

impl Document {
    pub fn kind(&self) -> DocKind {
        match self {
            Document::File(_) => DocKind::File,
            Document::Directory(_) => DocKind::Directory,
            Document::Repo(_) => DocKind::Repo,
            Document::Tombstone => DocKind::Tombstone,
        }
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Document::File(file) => Some(file.timestamp),
            Document::Directory(dir) => Some(dir.timestamp),
            Document::Repo(repo) => Some(repo.tree.timestamp),
            Document::Tombstone => None,
        }
    }

    /// The directory-shaped part of a directory or repo document
    pub fn as_tree(&self) -> Option<&DirectoryDoc> {
        match self {
            Document::Directory(dir) => Some(dir),
            Document::Repo(repo) => Some(&repo.tree),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Document::Tombstone)
    }
}

/// An opaque file blob with its version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDoc {
    pub timestamp: Timestamp,
    /// Descending and unique; `versions[0]` is the current version
    pub versions: Vec<Version>,
    /// `None` once the file has been deleted
    pub content: Option<Vec<u8>>,
}

impl FileDoc {
    /// Empty template for a path that has never been written
    pub fn template() -> Self {
        Self {
            timestamp: 0,
            versions: Vec::new(),
            content: None,
        }
    }

    /// Current version, 0 for a template
    pub fn version(&self) -> Version {
        self.versions.first().copied().unwrap_or(0)
    }

    pub fn is_removed(&self) -> bool {
        self.content.is_none()
    }

    pub fn pointer_state(&self) -> PointerState {
        if self.is_removed() {
            PointerState::Deleted
        } else {
            PointerState::Present
        }
    }

    /// Record a new write. The new version must exceed every retained one.
    pub fn record_write(&mut self, version: Version, timestamp: Timestamp, content: Option<Vec<u8>>) {
        debug_assert!(version > self.version());
        self.versions.insert(0, version);
        self.timestamp = self.timestamp.max(timestamp);
        self.content = content;
    }

    /// Largest superseded version that is at or below `bound`
    pub fn historical_version_at_or_below(&self, bound: Version) -> Option<Version> {
        self.versions.iter().skip(1).copied().filter(|v| *v <= bound).max()
    }
}

/// Which pointer map a child name lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerState {
    Present,
    Deleted,
}

/// Child-name -> timestamp indexes of a directory-like document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointers {
    pub paths: BTreeMap<String, Timestamp>,
    pub deleted: BTreeMap<String, Timestamp>,
}

impl Pointers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<(PointerState, Timestamp)> {
        if let Some(ts) = self.paths.get(name) {
            return Some((PointerState::Present, *ts));
        }
        self.deleted.get(name).map(|ts| (PointerState::Deleted, *ts))
    }

    /// Point `name` at `timestamp` in the given map, removing it from the other
    pub fn set(&mut self, name: impl Into<String>, state: PointerState, timestamp: Timestamp) {
        let name = name.into();
        match state {
            PointerState::Present => {
                self.deleted.remove(&name);
                self.paths.insert(name, timestamp);
            }
            PointerState::Deleted => {
                self.paths.remove(&name);
                self.deleted.insert(name, timestamp);
            }
        }
    }

    /// All entries in name order
    pub fn entries(&self) -> impl Iterator<Item = (&str, PointerState, Timestamp)> + '_ {
        let mut all: Vec<_> = self
            .paths
            .iter()
            .map(|(name, ts)| (name.as_str(), PointerState::Present, *ts))
            .chain(
                self.deleted
                    .iter()
                    .map(|(name, ts)| (name.as_str(), PointerState::Deleted, *ts)),
            )
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all.into_iter()
    }

    /// Entries strictly newer than `baseline`
    pub fn entries_after(
        &self,
        baseline: Timestamp,
    ) -> impl Iterator<Item = (&str, PointerState, Timestamp)> + '_ {
        self.entries().filter(move |(_, _, ts)| *ts > baseline)
    }

    /// Pointer-merge rule: per name the largest timestamp survives, in the map
    /// that held it. A tie between the two maps keeps the name deleted.
    pub fn merge(&mut self, other: &Pointers) {
        for (name, state, ts) in other.entries() {
            let keep_incoming = match self.get(name) {
                None => true,
                Some((current_state, current_ts)) => {
                    ts > current_ts
                        || (ts == current_ts
                            && current_state == PointerState::Present
                            && state == PointerState::Deleted)
                }
            };
            if keep_incoming {
                self.set(name, state, ts);
            }
        }
    }

    pub fn merged(mut self, other: &Pointers) -> Self {
        self.merge(other);
        self
    }
}

/// A directory: its own timestamp is the max of its children's
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDoc {
    pub timestamp: Timestamp,
    pub pointers: Pointers,
    /// Set when conflict resolution merged siblings that disagreed; diffs
    /// through this document lower their baseline to it
    pub merge_base_timestamp: Option<Timestamp>,
}

impl DirectoryDoc {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            pointers: Pointers::new(),
            merge_base_timestamp: None,
        }
    }
}

/// Aggregate counters maintained on the repo document.
///
/// Replicas merge these by per-field maximum, so after concurrent writes on
/// different masters they are lower bounds rather than exact totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUsage {
    pub write_count: u64,
    pub bytes_written: u64,
}

impl RepoUsage {
    /// Per-field maximum, used when merging conflicting repo documents.
    /// Increments made concurrently on two masters count once.
    pub fn max(self, other: RepoUsage) -> RepoUsage {
        RepoUsage {
            write_count: self.write_count.max(other.write_count),
            bytes_written: self.bytes_written.max(other.bytes_written),
        }
    }
}

/// Provenance carried over from a migrated git repo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitProvenance {
    pub last_git_hash: Option<String>,
    pub last_git_time: Option<Timestamp>,
}

/// The root of a repo's tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDoc {
    pub tree: DirectoryDoc,
    pub created_at: Timestamp,
    pub provenance: GitProvenance,
    pub usage: RepoUsage,
}

impl RepoDoc {
    pub fn new(created_at: Timestamp, provenance: GitProvenance) -> Self {
        Self {
            tree: DirectoryDoc::new(created_at),
            created_at,
            provenance,
            usage: RepoUsage::default(),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.tree.timestamp
    }
}

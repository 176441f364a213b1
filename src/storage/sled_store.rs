//! Sled-based storage implementation.
//!
//! Each key's revision tree is stored as one bincode value. Writes run in a
//! transaction over two trees:
//! - `documents` holds the revision trees, keyed `{repoId}:{path}`
//! - `versions` indexes current file versions, keyed
//!   `{repoId}:{version:020}:{docKey}`, so checkpoint views are range scans
//!   that never decode a document
//!
//! A stale `expected_rev` still surfaces as a write conflict for the retry
//! driver; sled reruns the transaction itself when two writers race on a key.

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

use super::{
    BulkWriteResult, DocWrite, DocumentStore, FetchResult, Revision, RevisionTree, StorageConfig,
    StorageError, StorageResult, VersionAggregate, WriteError, WriteOutcome,
};
use crate::sync::document::Document;
use crate::sync::paths::{split_key, ROOT};
use crate::sync::Version;

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_VERSIONS: &str = "versions";

/// Width of the zero-padded version in index keys
const VERSION_WIDTH: usize = 20;

fn version_entry(key: &str, version: Version) -> Option<String> {
    let (repo_id, _) = split_key(key)?;
    Some(format!("{}:{:020}:{}", repo_id, version, key))
}

/// Index key bounds for versions in `[from, ..)` of one repo
fn version_range(repo_id: &str, from: Version) -> (String, String) {
    (format!("{}:{:020}", repo_id, from), format!("{};", repo_id))
}

/// Index key bounds for versions in `[0, end)` of one repo
fn version_range_below(repo_id: &str, end: Version) -> (String, String) {
    (format!("{}:", repo_id), format!("{}:{:020}", repo_id, end))
}

fn parse_version(repo_id: &str, entry: &[u8]) -> StorageResult<Version> {
    let start = repo_id.len() + 1;
    entry
        .get(start..start + VERSION_WIDTH)
        .and_then(|digits| std::str::from_utf8(digits).ok())
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| StorageError::Corruption(format!("bad version index entry in {}", repo_id)))
}

/// Sled-backed document store
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    documents: Tree,
    versions: Tree,
    replica_id: String,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let versions = db.open_tree(TREE_VERSIONS)?;
        let replica_id = format!("sled-{}", db.generate_id()?);

        Ok(Self {
            db: Arc::new(db),
            documents,
            versions,
            replica_id,
        })
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> StorageResult<RevisionTree> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn load_tree(&self, key: &str) -> StorageResult<Option<RevisionTree>> {
        match self.documents.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decoded trees of one repo partition, in key order
    fn scan_partition(&self, repo_id: &str) -> StorageResult<Vec<(String, RevisionTree)>> {
        let prefix = format!("{}:", repo_id);
        let mut trees = Vec::new();
        for item in self.documents.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Corruption(format!("non-utf8 key: {}", e)))?;
            trees.push((key, Self::decode(&value)?));
        }
        Ok(trees)
    }

    /// Run `f` against the stored tree under `key` in one transaction with the
    /// version index. `f` reports whether it changed the tree; unchanged trees
    /// are not written back.
    fn transact<R>(
        &self,
        key: &str,
        f: impl Fn(&mut RevisionTree) -> (R, bool),
    ) -> StorageResult<(R, RevisionTree)> {
        let result = (&self.documents, &self.versions).transaction(
            |(documents, versions)| -> ConflictableTransactionResult<(R, RevisionTree), StorageError> {
                let mut tree = match documents.get(key.as_bytes())? {
                    Some(bytes) => Self::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    None => RevisionTree::default(),
                };
                let before = tree.file_version();
                let (outcome, changed) = f(&mut tree);
                if !changed {
                    return Ok((outcome, tree));
                }

                let encoded = bincode::serialize(&tree)
                    .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;
                documents.insert(key.as_bytes(), encoded)?;

                let after = tree.file_version();
                if before != after {
                    if let Some(entry) = before.and_then(|v| version_entry(key, v)) {
                        versions.remove(entry.as_bytes())?;
                    }
                    if let Some(entry) = after.and_then(|v| version_entry(key, v)) {
                        versions.insert(entry.as_bytes(), key.as_bytes())?;
                    }
                }
                Ok((outcome, tree))
            },
        );

        result.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StorageError::Sled(err),
        })
    }

    fn write_one(&self, write: DocWrite) -> StorageResult<Result<WriteOutcome, WriteError>> {
        let (applied, tree) = self.transact(&write.key, |tree| {
            match tree.apply(write.expected_rev.as_deref(), write.doc.clone()) {
                Ok(revision) => (Ok(revision), true),
                Err(err) => (Err(err), false),
            }
        })?;

        Ok(applied.map(|revision| {
            trace!(key = %write.key, rev = %revision.rev, "sled write");
            WriteOutcome {
                conflicted: tree.is_conflicted(),
                key: write.key,
                rev: revision.rev,
            }
        }))
    }

    /// Versions of one repo whose index keys fall in `[start, end)`
    fn indexed(
        &self,
        repo_id: &str,
        (start, end): (String, String),
    ) -> impl Iterator<Item = StorageResult<(Version, String)>> + '_ {
        let repo_id = repo_id.to_string();
        self.versions
            .range(start.into_bytes()..end.into_bytes())
            .map(move |item| {
                let (entry, key) = item?;
                let version = parse_version(&repo_id, &entry)?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| StorageError::Corruption(format!("non-utf8 key: {}", e)))?;
                Ok((version, key))
            })
    }
}

fn fetch_result(tree: Option<RevisionTree>) -> FetchResult {
    match tree {
        Some(tree) if tree.is_conflicted() => FetchResult::Conflicted(tree.siblings()),
        Some(tree) => match tree.winner() {
            Some(winner) => FetchResult::Found(winner.clone()),
            None => FetchResult::NotFound,
        },
        None => FetchResult::NotFound,
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    fn replica_id(&self) -> &str {
        &self.replica_id
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Revision>> {
        Ok(self.load_tree(key)?.and_then(|tree| tree.winner().cloned()))
    }

    async fn head(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .load_tree(key)?
            .map_or(false, |tree| tree.winner().is_some()))
    }

    async fn fetch(&self, keys: &[String]) -> StorageResult<Vec<FetchResult>> {
        keys.iter()
            .map(|key| self.load_tree(key).map(fetch_result))
            .collect()
    }

    async fn bulk(&self, writes: Vec<DocWrite>) -> StorageResult<BulkWriteResult> {
        writes.into_iter().map(|write| self.write_one(write)).collect()
    }

    async fn version_aggregate(
        &self,
        repo_id: &str,
        upper: Option<Version>,
    ) -> StorageResult<VersionAggregate> {
        let bounds = match upper.and_then(|bound| bound.checked_add(1)) {
            Some(end) => version_range_below(repo_id, end),
            None => version_range(repo_id, 0),
        };
        let versions = self
            .indexed(repo_id, bounds)
            .map(|item| item.map(|(version, _)| version))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(VersionAggregate::of(versions))
    }

    async fn files_since(&self, repo_id: &str, after: Version) -> StorageResult<Vec<(String, Revision)>> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut files = Vec::new();
        for item in self.indexed(repo_id, version_range(repo_id, start)) {
            let (_, key) = item?;
            if let Some(winner) = self.load_tree(&key)?.and_then(|tree| tree.winner().cloned()) {
                files.push((key, winner));
            }
        }
        Ok(files)
    }

    async fn conflicted_keys(&self, repo_id: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .scan_partition(repo_id)?
            .into_iter()
            .filter(|(_, tree)| tree.is_conflicted())
            .map(|(key, _)| key)
            .collect())
    }

    async fn repo_ids(&self) -> StorageResult<Vec<String>> {
        let suffix = format!(":{}", ROOT);
        let mut ids = Vec::new();
        for item in self.documents.iter() {
            let (key, value) = item?;
            let Some(repo_id) = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.strip_suffix(suffix.as_str()))
            else {
                continue;
            };
            let tree = Self::decode(&value)?;
            if matches!(tree.winner().map(|w| &w.doc), Some(Document::Repo(_))) {
                ids.push(repo_id.to_string());
            }
        }
        Ok(ids)
    }

    async fn export_partition(&self, repo_id: &str) -> StorageResult<Vec<(String, RevisionTree)>> {
        self.scan_partition(repo_id)
    }

    async fn import_tree(&self, key: &str, tree: &RevisionTree) -> StorageResult<bool> {
        let (changed, _) = self.transact(key, |local| {
            let changed = local.merge_from(tree);
            (changed, changed)
        })?;
        Ok(changed)
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

//! In-process document store.
//!
//! Each repo partition is a sorted map of key -> revision tree behind its own
//! lock, so writers to different repos never contend. Next to the trees every
//! partition keeps an index of current file versions, which answers the
//! checkpoint views without touching the documents. Several instances can be
//! wired together with [`super::replicate`] to stand in for replicas of a
//! multi-master database.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

use super::{
    BulkWriteResult, DocWrite, DocumentStore, FetchResult, Revision, RevisionTree, StorageResult,
    VersionAggregate, WriteError, WriteOutcome,
};
use crate::sync::document::Document;
use crate::sync::paths::{split_key, ROOT};
use crate::sync::Version;

#[derive(Default)]
struct Partition {
    trees: BTreeMap<String, RevisionTree>,
    /// `(current version, key)` of every live file winner
    versions: BTreeSet<(Version, String)>,
    /// Sum over `versions`
    version_sum: u64,
}

impl Partition {
    /// Run `f` against the tree under `key`, keeping the version index in step
    fn update<R>(&mut self, key: &str, f: impl FnOnce(&mut RevisionTree) -> R) -> R {
        let tree = self.trees.entry(key.to_string()).or_default();
        let before = tree.file_version();
        let result = f(tree);
        let after = tree.file_version();

        if before != after {
            if let Some(version) = before {
                if self.versions.remove(&(version, key.to_string())) {
                    self.version_sum -= version;
                }
            }
            if let Some(version) = after {
                if self.versions.insert((version, key.to_string())) {
                    self.version_sum += version;
                }
            }
        }
        result
    }

    fn aggregate(&self, upper: Option<Version>) -> VersionAggregate {
        match upper.and_then(|bound| bound.checked_add(1)) {
            Some(end) => VersionAggregate::of(
                self.versions
                    .range(..(end, String::new()))
                    .map(|(version, _)| *version),
            ),
            None if upper.is_some() => VersionAggregate::of(self.versions.iter().map(|(v, _)| *v)),
            None => VersionAggregate {
                max: self.versions.last().map_or(0, |(version, _)| *version),
                sum: self.version_sum,
                count: self.versions.len() as u64,
            },
        }
    }

    fn files_since(&self, after: Version) -> Vec<(String, Revision)> {
        let Some(start) = after.checked_add(1) else {
            return Vec::new();
        };
        self.versions
            .range((start, String::new())..)
            .filter_map(|(_, key)| {
                let winner = self.trees.get(key)?.winner()?;
                Some((key.clone(), winner.clone()))
            })
            .collect()
    }
}

/// Memory-backed document store
pub struct MemoryStore {
    replica_id: String,
    partitions: DashMap<String, RwLock<Partition>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_replica_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_replica_id(replica_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            partitions: DashMap::new(),
        }
    }

    fn read_tree(&self, key: &str) -> Option<RevisionTree> {
        let (repo_id, _) = split_key(key)?;
        let partition = self.partitions.get(repo_id)?;
        let partition = partition.read();
        partition.trees.get(key).cloned()
    }

    fn write_one(&self, write: DocWrite) -> Result<WriteOutcome, WriteError> {
        let (repo_id, _) = split_key(&write.key)
            .ok_or_else(|| WriteError::Rejected(format!("malformed key: {}", write.key)))?;
        let entry = self.partitions.entry(repo_id.to_string()).or_default();
        let mut partition = entry.write();
        let (revision, conflicted) = partition.update(&write.key, |tree| {
            let revision = tree.apply(write.expected_rev.as_deref(), write.doc)?;
            Ok::<_, WriteError>((revision, tree.is_conflicted()))
        })?;
        trace!(key = %write.key, rev = %revision.rev, "memory write");
        Ok(WriteOutcome {
            conflicted,
            key: write.key,
            rev: revision.rev,
        })
    }

    fn with_partition<R>(&self, repo_id: &str, f: impl FnOnce(&Partition) -> R) -> Option<R> {
        let partition = self.partitions.get(repo_id)?;
        let partition = partition.read();
        Some(f(&partition))
    }
}

fn fetch_result(tree: Option<&RevisionTree>) -> FetchResult {
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
impl DocumentStore for MemoryStore {
    fn replica_id(&self) -> &str {
        &self.replica_id
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Revision>> {
        Ok(self.read_tree(key).and_then(|tree| tree.winner().cloned()))
    }

    async fn head(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .read_tree(key)
            .map_or(false, |tree| tree.winner().is_some()))
    }

    async fn fetch(&self, keys: &[String]) -> StorageResult<Vec<FetchResult>> {
        Ok(keys
            .iter()
            .map(|key| fetch_result(self.read_tree(key).as_ref()))
            .collect())
    }

    async fn bulk(&self, writes: Vec<DocWrite>) -> StorageResult<BulkWriteResult> {
        Ok(writes.into_iter().map(|write| self.write_one(write)).collect())
    }

    async fn version_aggregate(
        &self,
        repo_id: &str,
        upper: Option<Version>,
    ) -> StorageResult<VersionAggregate> {
        Ok(self
            .with_partition(repo_id, |partition| partition.aggregate(upper))
            .unwrap_or_default())
    }

    async fn files_since(&self, repo_id: &str, after: Version) -> StorageResult<Vec<(String, Revision)>> {
        Ok(self
            .with_partition(repo_id, |partition| partition.files_since(after))
            .unwrap_or_default())
    }

    async fn conflicted_keys(&self, repo_id: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .with_partition(repo_id, |partition| {
                partition
                    .trees
                    .iter()
                    .filter(|(_, tree)| tree.is_conflicted())
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn repo_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .partitions
            .iter()
            .filter(|entry| {
                let root_key = format!("{}:{}", entry.key(), ROOT);
                let partition = entry.value().read();
                matches!(
                    partition.trees.get(&root_key).and_then(|t| t.winner()).map(|w| &w.doc),
                    Some(Document::Repo(_))
                )
            })
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn export_partition(&self, repo_id: &str) -> StorageResult<Vec<(String, RevisionTree)>> {
        Ok(self
            .with_partition(repo_id, |partition| {
                partition.trees.iter().map(|(k, t)| (k.clone(), t.clone())).collect()
            })
            .unwrap_or_default())
    }

    async fn import_tree(&self, key: &str, tree: &RevisionTree) -> StorageResult<bool> {
        let Some((repo_id, _)) = split_key(key) else {
            return Ok(false);
        };
        let entry = self.partitions.entry(repo_id.to_string()).or_default();
        let mut partition = entry.write();
        Ok(partition.update(key, |local| local.merge_from(tree)))
    }
}

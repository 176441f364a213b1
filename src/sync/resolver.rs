//! Deterministic resolution of replication conflicts.
//!
//! When two masters accept conflicting writes to one key, replication leaves
//! several live sibling revisions under it. Resolution picks (files) or merges
//! (directories and repos) them into one document written over the winning
//! leaf, and tombstones every other leaf.
//!
//! The outcome depends only on the set of siblings, never on their order, so
//! any replica can resolve the same conflict independently and converge.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::document::{
    DirectoryDoc, Document, FileDoc, PointerState, Pointers, RepoDoc, RepoUsage,
};
use super::retry::{check_bulk, retry_on_conflict};
use super::{SyncError, SyncResult, Timestamp};
use crate::storage::{DocWrite, DocumentStore, FetchResult, Revision};

/// The merged outcome for one conflicted key
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: String,
    /// Leaf the merged document is written over
    pub base_rev: String,
    pub document: Document,
    /// Whether `document` differs from the base leaf's body
    pub rewrite: bool,
    /// Leaves to tombstone, in id order
    pub losers: Vec<String>,
}

impl Resolution {
    pub fn writes(&self) -> Vec<DocWrite> {
        let mut writes = Vec::with_capacity(self.losers.len() + 1);
        if self.rewrite {
            writes.push(DocWrite::new(
                self.key.clone(),
                Some(self.base_rev.clone()),
                self.document.clone(),
            ));
        }
        writes.extend(
            self.losers
                .iter()
                .map(|rev| DocWrite::tombstone(self.key.clone(), rev.clone())),
        );
        writes
    }
}

/// Summary of one resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub keys: usize,
    pub rewritten: usize,
    pub tombstoned: usize,
}

impl ResolveReport {
    fn add(&mut self, resolution: &Resolution) {
        self.keys += 1;
        self.rewritten += usize::from(resolution.rewrite);
        self.tombstoned += resolution.losers.len();
    }
}

/// Merge the live siblings of `key` into a single resolution.
pub fn resolve_siblings(key: &str, siblings: &[Revision]) -> SyncResult<Resolution> {
    if siblings.is_empty() {
        return Err(SyncError::Structural(format!("no revisions to resolve for {}", key)));
    }
    if let Some(dead) = siblings.iter().find(|s| s.is_deleted()) {
        return Err(SyncError::Structural(format!(
            "tombstone {} offered as a live sibling of {}",
            dead.rev, key
        )));
    }

    let all_files = siblings.iter().all(|s| matches!(s.doc, Document::File(_)));
    let all_trees = siblings.iter().all(|s| s.doc.as_tree().is_some());

    let merged = if all_files {
        merge_files(siblings)
    } else if all_trees {
        merge_trees(siblings)
    } else {
        pick_latest(siblings)
    };
    let (base, document) = merged
        .ok_or_else(|| SyncError::Structural(format!("unmergeable siblings for {}", key)))?;

    let mut losers: Vec<String> = siblings
        .iter()
        .filter(|s| s.rev != base.rev)
        .map(|s| s.rev.clone())
        .collect();
    losers.sort();

    Ok(Resolution {
        key: key.to_string(),
        rewrite: document != base.doc,
        base_rev: base.rev.clone(),
        document,
        losers,
    })
}

fn file_of(rev: &Revision) -> Option<&FileDoc> {
    match &rev.doc {
        Document::File(file) => Some(file),
        _ => None,
    }
}

/// Higher current version, then later timestamp, then larger revision id.
/// Histories are unioned; every loser that shared the winner's current
/// version adds one to a synthetic version prepended to the history.
fn merge_files(siblings: &[Revision]) -> Option<(&Revision, Document)> {
    let files: Vec<(&Revision, &FileDoc)> = siblings
        .iter()
        .filter_map(|rev| file_of(rev).map(|file| (rev, file)))
        .collect();

    let (winner, winner_file) = files
        .iter()
        .copied()
        .max_by(|(ra, fa), (rb, fb)| {
            (fa.version(), fa.timestamp, ra.rev.as_str()).cmp(&(fb.version(), fb.timestamp, rb.rev.as_str()))
        })?;

    let history: BTreeSet<u64> = files
        .iter()
        .flat_map(|(_, file)| file.versions.iter().copied())
        .collect();
    let mut versions: Vec<u64> = history.into_iter().rev().collect();

    let duplicates = files
        .iter()
        .filter(|(rev, file)| rev.rev != winner.rev && file.version() == winner_file.version())
        .count() as u64;
    if duplicates > 0 {
        versions.insert(0, winner_file.version() + duplicates);
    }

    let timestamp = files.iter().map(|(_, f)| f.timestamp).max().unwrap_or(winner_file.timestamp);

    let merged = FileDoc {
        timestamp,
        versions,
        content: winner_file.content.clone(),
    };
    Some((winner, Document::File(merged)))
}

/// Union of directory-like siblings under the pointer-merge rule.
fn merge_trees(siblings: &[Revision]) -> Option<(&Revision, Document)> {
    let trees: Vec<(&Revision, &DirectoryDoc)> = siblings
        .iter()
        .filter_map(|rev| rev.doc.as_tree().map(|tree| (rev, tree)))
        .collect();

    let base = trees
        .iter()
        .map(|(rev, tree)| (*rev, tree.timestamp))
        .max_by(|(ra, ta), (rb, tb)| (ta, ra.rev.as_str()).cmp(&(tb, rb.rev.as_str())))
        .map(|(rev, _)| rev)?;

    let pointers = trees
        .iter()
        .fold(Pointers::new(), |acc, (_, tree)| acc.merged(&tree.pointers));
    let timestamp = trees.iter().map(|(_, t)| t.timestamp).max().unwrap_or_default();

    let merge_base_timestamp = disagreement_base(&trees, &pointers)
        .into_iter()
        .chain(trees.iter().filter_map(|(_, t)| t.merge_base_timestamp))
        .min();

    let dir = DirectoryDoc {
        timestamp,
        pointers,
        merge_base_timestamp,
    };

    let repos: Vec<&RepoDoc> = siblings
        .iter()
        .filter_map(|rev| match &rev.doc {
            Document::Repo(repo) => Some(repo),
            _ => None,
        })
        .collect();

    let document = if repos.is_empty() {
        Document::Directory(dir)
    } else {
        let created_at = repos.iter().map(|r| r.created_at).min().unwrap_or_default();
        let provenance = repos
            .iter()
            .map(|r| &r.provenance)
            .max_by(|a, b| {
                (a.last_git_time, &a.last_git_hash).cmp(&(b.last_git_time, &b.last_git_hash))
            })
            .cloned()
            .unwrap_or_default();
        let usage = repos
            .iter()
            .map(|r| r.usage)
            .fold(RepoUsage::default(), RepoUsage::max);
        Document::Repo(RepoDoc {
            tree: dir,
            created_at,
            provenance,
            usage,
        })
    };

    Some((base, document))
}

/// One less than the smallest surviving timestamp among names the siblings
/// disagree on. A client that synced against any one sibling may have a
/// baseline past those entries; diffs lower their baseline to this value.
fn disagreement_base(trees: &[(&Revision, &DirectoryDoc)], merged: &Pointers) -> Option<Timestamp> {
    let mut views: BTreeMap<&str, BTreeSet<Option<(PointerState, Timestamp)>>> = BTreeMap::new();
    for (name, _, _) in merged.entries() {
        let entry = views.entry(name).or_default();
        for (_, tree) in trees {
            entry.insert(tree.pointers.get(name));
        }
    }

    views
        .into_iter()
        .filter(|(_, seen)| seen.len() > 1)
        .filter_map(|(name, _)| merged.get(name).map(|(_, ts)| ts - 1))
        .min()
}

/// Structural conflicts (file vs. directory) keep the later document whole.
fn pick_latest(siblings: &[Revision]) -> Option<(&Revision, Document)> {
    let winner = siblings
        .iter()
        .max_by(|a, b| {
            let ta = a.doc.timestamp().unwrap_or(Timestamp::MIN);
            let tb = b.doc.timestamp().unwrap_or(Timestamp::MIN);
            (ta, a.rev.as_str()).cmp(&(tb, b.rev.as_str()))
        })?;
    Some((winner, winner.doc.clone()))
}

/// Applies resolutions against a document store
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn DocumentStore>,
    max_attempts: usize,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: usize) -> Self {
        Self { store, max_attempts }
    }

    /// Resolve every conflicted key in a repo. Idempotent: a repo without
    /// conflicts is left untouched.
    pub async fn resolve_repo(&self, repo_id: &str) -> SyncResult<ResolveReport> {
        retry_on_conflict(self.max_attempts, move |_| async move {
            let keys = self.store.conflicted_keys(repo_id).await?;
            self.resolve_keys(&keys).await
        })
        .await
    }

    /// Resolve the given keys, skipping any that are not conflicted
    pub async fn resolve_keys(&self, keys: &[String]) -> SyncResult<ResolveReport> {
        if keys.is_empty() {
            return Ok(ResolveReport::default());
        }
        let fetched = self.store.fetch(keys).await?;
        let resolutions = keys
            .iter()
            .zip(fetched)
            .filter_map(|(key, result)| match result {
                FetchResult::Conflicted(siblings) => Some(resolve_siblings(key, &siblings)),
                _ => None,
            })
            .collect::<SyncResult<Vec<_>>>()?;
        self.persist(&resolutions).await
    }

    /// Bulk-fetch keys for a reader, resolving conflicted ones on the way so
    /// the caller only ever sees one document per key.
    pub async fn fetch_resolved(&self, keys: &[String]) -> SyncResult<Vec<Option<Document>>> {
        let fetched = self.store.fetch(keys).await?;
        let mut docs = Vec::with_capacity(keys.len());
        let mut resolutions = Vec::new();

        for (key, result) in keys.iter().zip(fetched) {
            match result {
                FetchResult::NotFound => docs.push(None),
                FetchResult::Found(revision) => docs.push(Some(revision.doc)),
                FetchResult::Conflicted(siblings) => {
                    let resolution = resolve_siblings(key, &siblings)?;
                    docs.push(Some(resolution.document.clone()));
                    resolutions.push(resolution);
                }
            }
        }

        if !resolutions.is_empty() {
            match self.persist(&resolutions).await {
                Ok(_) => {}
                // Someone else moved the key on; the resolved view is still valid to serve
                Err(SyncError::Conflict(key)) => {
                    debug!(key = %key, "resolution raced another writer");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(docs)
    }

    async fn persist(&self, resolutions: &[Resolution]) -> SyncResult<ResolveReport> {
        let mut report = ResolveReport::default();
        let writes: Vec<DocWrite> = resolutions
            .iter()
            .inspect(|r| report.add(r))
            .flat_map(Resolution::writes)
            .collect();
        if writes.is_empty() {
            return Ok(report);
        }

        let results = self.store.bulk(writes.clone()).await?;
        check_bulk(&writes, results)?;

        info!(
            replica = self.store.replica_id(),
            keys = report.keys,
            rewritten = report.rewritten,
            tombstoned = report.tombstoned,
            "resolved conflicts"
        );
        Ok(report)
    }
}

//! Pointer-propagation write engine.
//!
//! A changeset touches one file document per path plus every ancestor
//! directory and the repo root. All of them are computed from one snapshot
//! and submitted in a single bulk write. Only the nearest directory of a
//! deleted file records the deletion; higher ancestors keep the child present.
//!
//! The bulk write is atomic per document. When an ancestor loses a race the
//! file documents may already be committed; the retry recognises them by
//! revision, restamps them and rebuilds the ancestor pointers around them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::document::{DirectoryDoc, Document, FileDoc, PointerState, Pointers, RepoDoc};
use super::paths::{self, doc_key, leaf_name, parent_paths, ROOT};
use super::resolver::ConflictResolver;
use super::retry::{check_bulk, retry_on_conflict, Committed};
use super::{now_millis, ChangeSet, ClientError, SyncError, SyncResult, Timestamp};
use crate::storage::{DocWrite, DocumentStore, FetchResult, Revision};

/// Pointer changes requested for one directory
#[derive(Debug, Default)]
struct PendingPointers {
    pointers: Pointers,
    timestamp: Timestamp,
    /// Names this write marks deleted
    deleting: BTreeSet<String>,
}

impl PendingPointers {
    /// `fresh` is false for a deletion an earlier attempt already committed
    fn set(&mut self, name: &str, state: PointerState, timestamp: Timestamp, fresh: bool) {
        self.pointers.set(name, state, timestamp);
        self.timestamp = self.timestamp.max(timestamp);
        if state == PointerState::Deleted && fresh {
            self.deleting.insert(name.to_string());
        }
    }
}

/// Applies client changesets to the hierarchical model
#[derive(Clone)]
pub struct WriteEngine {
    store: Arc<dyn DocumentStore>,
    resolver: ConflictResolver,
    max_attempts: usize,
}

impl WriteEngine {
    pub fn new(store: Arc<dyn DocumentStore>, resolver: ConflictResolver, max_attempts: usize) -> Self {
        Self {
            store,
            resolver,
            max_attempts,
        }
    }

    /// Apply `changes` on behalf of a client that last synced at `baseline`.
    /// Returns the timestamp assigned to the write.
    pub async fn apply_change_set(
        &self,
        repo_id: &str,
        changes: &ChangeSet,
        baseline: Timestamp,
    ) -> SyncResult<Timestamp> {
        paths::validate_repo_id(repo_id)?;
        validate_change_set(changes)?;

        let committed = Committed::default();
        let committed = &committed;
        let timestamp = retry_on_conflict(self.max_attempts, move |attempt| {
            self.attempt(repo_id, changes, baseline, committed, attempt)
        })
        .await?;

        info!(repo_id, paths = changes.len(), timestamp, "applied changeset");
        Ok(timestamp)
    }

    async fn attempt(
        &self,
        repo_id: &str,
        changes: &ChangeSet,
        baseline: Timestamp,
        committed: &Committed,
        attempt: usize,
    ) -> SyncResult<Timestamp> {
        let repo_key = doc_key(repo_id, ROOT);
        let mut dir_paths: BTreeSet<String> = BTreeSet::new();
        for path in changes.keys() {
            dir_paths.extend(parent_paths(path));
        }

        let mut keys = vec![repo_key.clone()];
        keys.extend(changes.keys().map(|path| doc_key(repo_id, path)));
        keys.extend(dir_paths.iter().map(|path| doc_key(repo_id, path)));

        let fetched = self.store.fetch(&keys).await?;
        let conflicted: Vec<String> = keys
            .iter()
            .zip(&fetched)
            .filter(|(_, result)| result.is_conflicted())
            .map(|(key, _)| key.clone())
            .collect();
        if let Some(first) = conflicted.first().cloned() {
            debug!(repo_id, attempt, keys = conflicted.len(), "resolving conflicts before write");
            self.resolver.resolve_keys(&conflicted).await?;
            return Err(SyncError::Conflict(first));
        }

        let snapshot: BTreeMap<String, Revision> = keys
            .into_iter()
            .zip(fetched)
            .filter_map(|(key, result)| match result {
                FetchResult::Found(revision) => Some((key, revision)),
                _ => None,
            })
            .collect();

        let repo_rev = snapshot
            .get(&repo_key)
            .ok_or_else(|| ClientError::not_found(format!("repo does not exist: {}", repo_id)))?;
        let Document::Repo(repo_doc) = &repo_rev.doc else {
            return Err(SyncError::Structural(format!(
                "{} holds a {}, expected a repo",
                repo_key,
                repo_rev.doc.kind()
            )));
        };

        let timestamp = now_millis().max(repo_doc.timestamp() + 1);
        let first_version = self.store.version_aggregate(repo_id, None).await?.max + 1;

        let mut writes = Vec::new();
        let mut pending: BTreeMap<String, PendingPointers> = BTreeMap::new();
        let mut bytes_written = 0u64;

        for (i, (path, content)) in changes.iter().enumerate() {
            let key = doc_key(repo_id, path);
            let existing = snapshot.get(&key);
            let reapplied = existing.map_or(false, |rev| committed.contains(&key, &rev.rev));
            let mut file = match existing.map(|rev| &rev.doc) {
                Some(Document::File(file)) if reapplied => file.clone(),
                Some(Document::File(file)) => {
                    if file.timestamp > baseline {
                        return Err(ClientError::conflict(format!(
                            "{} changed since baseline {}",
                            path, baseline
                        ))
                        .into());
                    }
                    if content.is_none() && file.is_removed() {
                        return Err(ClientError::unprocessable(format!("already deleted: {}", path)).into());
                    }
                    file.clone()
                }
                Some(other) => {
                    return Err(ClientError::unprocessable(format!(
                        "existing document is not a file: {} is a {}",
                        path,
                        other.kind()
                    ))
                    .into());
                }
                None => {
                    if content.is_none() {
                        return Err(ClientError::unprocessable(format!("document does not exist: {}", path)).into());
                    }
                    FileDoc::template()
                }
            };

            bytes_written += content.as_ref().map_or(0, |c| c.len() as u64);
            if reapplied {
                // Keep the version, move the timestamp to this attempt's
                file.timestamp = timestamp;
            } else {
                file.record_write(first_version + i as u64, timestamp, content.clone());
            }
            let state = file.pointer_state();
            writes.push(DocWrite::new(
                key,
                existing.map(|rev| rev.rev.clone()),
                Document::File(file),
            ));

            // The file itself, then each ancestor, indexed in its container
            let mut child = path.clone();
            let mut child_state = state;
            for container in parent_paths(path).into_iter().chain(std::iter::once(ROOT.to_string())) {
                pending
                    .entry(container.clone())
                    .or_default()
                    .set(leaf_name(&child), child_state, timestamp, !reapplied);
                child = container;
                child_state = PointerState::Present;
            }
        }

        for (dir_path, update) in &pending {
            if dir_path == ROOT {
                continue;
            }
            let key = doc_key(repo_id, dir_path);
            let existing = snapshot.get(&key);
            let base = match existing.map(|rev| &rev.doc) {
                None => DirectoryDoc::new(update.timestamp),
                Some(Document::Directory(dir)) => dir.clone(),
                // A deleted file's key can be reused as a directory
                Some(Document::File(file)) if file.is_removed() => DirectoryDoc::new(update.timestamp),
                Some(other) => {
                    return Err(ClientError::unprocessable(format!(
                        "existing document is not a directory: {} is a {}",
                        dir_path,
                        other.kind()
                    ))
                    .into());
                }
            };
            let dir = apply_pointers(dir_path, base, update)?;
            writes.push(DocWrite::new(
                key,
                existing.map(|rev| rev.rev.clone()),
                Document::Directory(dir),
            ));
        }

        let mut repo = repo_doc.clone();
        if let Some(update) = pending.get(ROOT) {
            repo.tree = apply_pointers(ROOT, repo.tree, update)?;
        }
        if !committed.contains(&repo_key, &repo_rev.rev) {
            repo.usage.write_count += 1;
            repo.usage.bytes_written += bytes_written;
        }
        writes.push(DocWrite::new(
            repo_key,
            Some(repo_rev.rev.clone()),
            Document::Repo(repo),
        ));

        let results = self.store.bulk(writes.clone()).await?;
        committed.record(&results);
        let outcomes = check_bulk(&writes, results)?;

        let still_conflicted: Vec<String> = outcomes
            .into_iter()
            .filter(|outcome| outcome.conflicted)
            .map(|outcome| outcome.key)
            .collect();
        if !still_conflicted.is_empty() {
            debug!(repo_id, keys = still_conflicted.len(), "resolving conflicts after write");
            self.resolver.resolve_keys(&still_conflicted).await?;
        }

        Ok(timestamp)
    }

    /// Create the root document of a repo
    pub async fn create_repo(&self, repo_id: &str, repo: RepoDoc) -> SyncResult<Timestamp> {
        paths::validate_repo_id(repo_id)?;
        let key = doc_key(repo_id, ROOT);
        if self.store.head(&key).await? {
            return Err(ClientError::conflict(format!("repo already exists: {}", repo_id)).into());
        }

        let timestamp = repo.timestamp();
        let writes = vec![DocWrite::new(key, None, Document::Repo(repo))];
        let results = self.store.bulk(writes.clone()).await?;
        match check_bulk(&writes, results) {
            Ok(_) => {
                info!(repo_id, "created repo");
                Ok(timestamp)
            }
            Err(SyncError::Conflict(_)) => {
                Err(ClientError::conflict(format!("repo already exists: {}", repo_id)).into())
            }
            Err(err) => Err(err),
        }
    }
}

/// Merge a directory's pending pointer changes into its stored state.
fn apply_pointers(dir_path: &str, mut dir: DirectoryDoc, update: &PendingPointers) -> SyncResult<DirectoryDoc> {
    if let Some(name) = update
        .deleting
        .iter()
        .find(|name| dir.pointers.deleted.contains_key(name.as_str()))
    {
        return Err(ClientError::unprocessable(format!(
            "already deleted: {}",
            paths::join(dir_path, name)
        ))
        .into());
    }
    dir.pointers.merge(&update.pointers);
    dir.timestamp = dir.timestamp.max(update.timestamp);
    Ok(dir)
}

fn validate_change_set(changes: &ChangeSet) -> Result<(), ClientError> {
    if changes.is_empty() {
        return Err(ClientError::bad_request("changeset is empty"));
    }
    for path in changes.keys() {
        paths::validate_file_path(path)?;
    }
    // A path cannot be both a file and the directory of another change
    for path in changes.keys() {
        if let Some(parent) = parent_paths(path).into_iter().find(|p| changes.contains_key(p)) {
            return Err(ClientError::unprocessable(format!(
                "existing document is not a directory: {} is written as a file",
                parent
            )));
        }
    }
    Ok(())
}

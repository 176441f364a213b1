//! Incremental diff over the pointer indexes.
//!
//! The walk only descends into children whose pointer is newer than the
//! baseline, one bulk fetch per tree level, so its cost follows the number of
//! changed paths rather than the size of the repo.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::document::{DirectoryDoc, Document, PointerState, Pointers};
use super::paths::{self, doc_key, ROOT};
use super::resolver::ConflictResolver;
use super::{ClientError, SyncError, SyncResult, Timestamp};

/// Options for a diff request
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Walk the whole tree and report every directory's pointer maps
    pub ignore_timestamps: bool,
}

/// Everything that changed in a repo after a baseline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeDiff {
    /// The repo's current timestamp
    pub timestamp: Timestamp,
    pub paths: BTreeMap<String, Timestamp>,
    pub deleted: BTreeMap<String, Timestamp>,
    /// False when a pointer and the document it names disagree, which happens
    /// while replication is still catching up
    pub is_consistent: bool,
    /// Pointer maps of each visited directory; only filled with `ignore_timestamps`
    pub directories: BTreeMap<String, Pointers>,
}

impl TreeDiff {
    fn empty(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            is_consistent: true,
            ..Default::default()
        }
    }
}

/// A directory still to be expanded, with the baseline that applies below it
struct PendingDir {
    path: String,
    dir: DirectoryDoc,
    baseline: Timestamp,
}

/// A child named by a pointer newer than its directory's baseline
struct Candidate {
    path: String,
    state: PointerState,
    timestamp: Timestamp,
    baseline: Timestamp,
}

/// Computes diffs, resolving any conflicted document it reads
#[derive(Clone)]
pub struct DiffEngine {
    resolver: ConflictResolver,
}

impl DiffEngine {
    pub fn new(resolver: ConflictResolver) -> Self {
        Self { resolver }
    }

    pub async fn diff_since(
        &self,
        repo_id: &str,
        baseline: Timestamp,
        options: DiffOptions,
    ) -> SyncResult<TreeDiff> {
        paths::validate_repo_id(repo_id)?;
        let repo_key = doc_key(repo_id, ROOT);
        let repo = match self.resolver.fetch_resolved(&[repo_key.clone()]).await?.pop().flatten() {
            Some(Document::Repo(repo)) => repo,
            Some(Document::Tombstone) | None => {
                return Err(ClientError::not_found(format!("repo does not exist: {}", repo_id)).into());
            }
            Some(other) => {
                return Err(SyncError::Structural(format!(
                    "{} holds a {}, expected a repo",
                    repo_key,
                    other.kind()
                )));
            }
        };

        let baseline = if options.ignore_timestamps {
            Timestamp::MIN
        } else {
            lowered(baseline, repo.tree.merge_base_timestamp)
        };

        let mut diff = TreeDiff::empty(repo.timestamp());
        if baseline >= repo.timestamp() {
            return Ok(diff);
        }

        let mut frontier = vec![PendingDir {
            path: ROOT.to_string(),
            dir: repo.tree,
            baseline,
        }];
        let mut visited = 0usize;

        while !frontier.is_empty() {
            let mut candidates = Vec::new();
            for pending in frontier.drain(..) {
                candidates.extend(pending.dir.pointers.entries_after(pending.baseline).map(
                    |(name, state, timestamp)| Candidate {
                        path: paths::join(&pending.path, name),
                        state,
                        timestamp,
                        baseline: pending.baseline,
                    },
                ));
                if options.ignore_timestamps {
                    diff.directories.insert(pending.path, pending.dir.pointers);
                }
            }
            if candidates.is_empty() {
                break;
            }

            let keys: Vec<String> = candidates.iter().map(|c| doc_key(repo_id, &c.path)).collect();
            let docs = self.resolver.fetch_resolved(&keys).await?;
            visited += keys.len();

            for (candidate, doc) in candidates.into_iter().zip(docs) {
                match doc {
                    Some(Document::File(file)) => {
                        let state = file.pointer_state();
                        if file.timestamp != candidate.timestamp || state != candidate.state {
                            debug!(
                                repo_id,
                                path = %candidate.path,
                                pointer = candidate.timestamp,
                                file = file.timestamp,
                                "pointer does not match file"
                            );
                            diff.is_consistent = false;
                        }
                        match state {
                            PointerState::Present => diff.paths.insert(candidate.path, file.timestamp),
                            PointerState::Deleted => diff.deleted.insert(candidate.path, file.timestamp),
                        };
                    }
                    Some(Document::Directory(dir)) => {
                        if dir.timestamp != candidate.timestamp || candidate.state == PointerState::Deleted {
                            diff.is_consistent = false;
                        }
                        frontier.push(PendingDir {
                            baseline: lowered(candidate.baseline, dir.merge_base_timestamp),
                            path: candidate.path,
                            dir,
                        });
                    }
                    Some(Document::Repo(_)) => {
                        return Err(SyncError::Structural(format!(
                            "repo document below the root at {}:{}",
                            repo_id, candidate.path
                        )));
                    }
                    Some(Document::Tombstone) | None => {
                        debug!(repo_id, path = %candidate.path, "pointer names a missing document");
                        diff.is_consistent = false;
                    }
                }
            }
        }

        if !diff.is_consistent {
            warn!(repo_id, "diff served from a partially replicated tree");
        }
        debug!(
            repo_id,
            visited,
            paths = diff.paths.len(),
            deleted = diff.deleted.len(),
            "computed diff"
        );
        Ok(diff)
    }
}

fn lowered(baseline: Timestamp, merge_base: Option<Timestamp>) -> Timestamp {
    merge_base.map_or(baseline, |base| baseline.min(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{replicate, DocWrite, DocumentStore, MemoryStore};
    use crate::sync::document::{FileDoc, GitProvenance, RepoDoc};
    use crate::sync::writer::WriteEngine;
    use crate::sync::{now_millis, ChangeSet};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<dyn DocumentStore>,
        writer: WriteEngine,
        diff: DiffEngine,
        created: Timestamp,
    }

    async fn fixture(store: Arc<dyn DocumentStore>) -> Fixture {
        let resolver = ConflictResolver::new(store.clone(), 10);
        let writer = WriteEngine::new(store.clone(), resolver.clone(), 10);
        let created = writer
            .create_repo("r", RepoDoc::new(now_millis(), GitProvenance::default()))
            .await
            .unwrap();
        Fixture {
            store,
            writer,
            diff: DiffEngine::new(resolver),
            created,
        }
    }

    fn set(entries: &[(&str, Option<&str>)]) -> ChangeSet {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.map(|c| c.as_bytes().to_vec())))
            .collect()
    }

    #[tokio::test]
    async fn test_pointer_propagation_visible_in_full_walk() {
        let fx = fixture(Arc::new(MemoryStore::new())).await;
        let t1 = fx
            .writer
            .apply_change_set("r", &set(&[("/a/b/c", Some("x"))]), fx.created)
            .await
            .unwrap();

        let diff = fx
            .diff
            .diff_since("r", 0, DiffOptions { ignore_timestamps: true })
            .await
            .unwrap();
        assert!(diff.is_consistent);
        assert_eq!(diff.timestamp, t1);
        assert_eq!(diff.directories["/"].paths.get("a"), Some(&t1));
        assert_eq!(diff.directories["/a"].paths.get("b"), Some(&t1));
        assert_eq!(diff.directories["/a/b"].paths.get("c"), Some(&t1));
        assert_eq!(diff.paths.get("/a/b/c"), Some(&t1));
    }

    #[tokio::test]
    async fn test_diff_only_reports_newer_changes() {
        let fx = fixture(Arc::new(MemoryStore::new())).await;
        let t1 = fx
            .writer
            .apply_change_set("r", &set(&[("/old/f", Some("x")), ("/keep", Some("k"))]), fx.created)
            .await
            .unwrap();
        let t2 = fx
            .writer
            .apply_change_set("r", &set(&[("/new/g", Some("y")), ("/old/f", None)]), t1)
            .await
            .unwrap();

        let diff = fx.diff.diff_since("r", t1, DiffOptions::default()).await.unwrap();
        assert!(diff.is_consistent);
        assert_eq!(diff.timestamp, t2);
        assert_eq!(diff.paths, BTreeMap::from([("/new/g".to_string(), t2)]));
        assert_eq!(diff.deleted, BTreeMap::from([("/old/f".to_string(), t2)]));
        assert!(diff.directories.is_empty());

        let everything = fx.diff.diff_since("r", 0, DiffOptions::default()).await.unwrap();
        assert_eq!(everything.paths.len(), 2);
        assert_eq!(everything.paths.get("/keep"), Some(&t1));
    }

    #[tokio::test]
    async fn test_current_client_gets_empty_diff() {
        let fx = fixture(Arc::new(MemoryStore::new())).await;
        let t1 = fx
            .writer
            .apply_change_set("r", &set(&[("/f", Some("x"))]), fx.created)
            .await
            .unwrap();

        let diff = fx.diff.diff_since("r", t1, DiffOptions::default()).await.unwrap();
        assert!(diff.paths.is_empty() && diff.deleted.is_empty());
        assert!(diff.is_consistent);
        assert_eq!(diff.timestamp, t1);
    }

    #[tokio::test]
    async fn test_missing_repo() {
        let fx = fixture(Arc::new(MemoryStore::new())).await;
        let err = fx
            .diff
            .diff_since("absent", 0, DiffOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.client().map(|c| c.status()), Some(404));
    }

    #[tokio::test]
    async fn test_pointer_without_document_is_inconsistent() {
        let fx = fixture(Arc::new(MemoryStore::new())).await;
        let t1 = fx
            .writer
            .apply_change_set("r", &set(&[("/f", Some("x")), ("/g", Some("y"))]), fx.created)
            .await
            .unwrap();

        // Simulate a replica that received the repo document but not /g
        let rev = fx.store.get("r:/g").await.unwrap().unwrap().rev;
        fx.store
            .bulk(vec![DocWrite::tombstone("r:/g", rev)])
            .await
            .unwrap();

        let diff = fx.diff.diff_since("r", 0, DiffOptions::default()).await.unwrap();
        assert!(!diff.is_consistent);
        assert_eq!(diff.paths, BTreeMap::from([("/f".to_string(), t1)]));
    }

    #[tokio::test]
    async fn test_stale_pointer_timestamp_is_inconsistent() {
        let fx = fixture(Arc::new(MemoryStore::new())).await;
        fx.writer
            .apply_change_set("r", &set(&[("/f", Some("x"))]), fx.created)
            .await
            .unwrap();

        let current = fx.store.get("r:/f").await.unwrap().unwrap();
        let Document::File(file) = current.doc else {
            panic!("expected file");
        };
        let newer = FileDoc {
            timestamp: file.timestamp + 50,
            ..file
        };
        fx.store
            .bulk(vec![DocWrite::new("r:/f", Some(current.rev), Document::File(newer))])
            .await
            .unwrap();

        let diff = fx.diff.diff_since("r", 0, DiffOptions::default()).await.unwrap();
        assert!(!diff.is_consistent);
        assert_eq!(diff.paths.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_base_surfaces_masked_changes() {
        let a: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_replica_id("a"));
        let b: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_replica_id("b"));
        let fx_a = fixture(a.clone()).await;
        replicate(a.as_ref(), b.as_ref(), "r").await.unwrap();
        let resolver_b = ConflictResolver::new(b.clone(), 10);
        let writer_b = WriteEngine::new(b.clone(), resolver_b, 10);

        let ta = fx_a
            .writer
            .apply_change_set("r", &set(&[("/from_a", Some("a"))]), fx_a.created)
            .await
            .unwrap();
        let tb = writer_b
            .apply_change_set("r", &set(&[("/from_b", Some("b"))]), fx_a.created)
            .await
            .unwrap();
        replicate(b.as_ref(), a.as_ref(), "r").await.unwrap();

        // A client that synced with replica a only knows about ta; the merged
        // repo timestamp is the later of the two writes.
        let diff = fx_a.diff.diff_since("r", ta, DiffOptions::default()).await.unwrap();
        assert_eq!(diff.timestamp, ta.max(tb));
        assert!(diff.paths.contains_key("/from_b"));
        assert!(a.conflicted_keys("r").await.unwrap().is_empty());
    }
}

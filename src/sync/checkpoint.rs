//! Checkpoint/version sync.
//!
//! Every file write takes a repo-wide increasing version. A checkpoint is the
//! pair `(max version, sum of current versions)` a client saw. Because conflict
//! resolution can merge histories underneath a client, the sum lets the server
//! detect a checkpoint it can no longer vouch for and fall back to an older one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::document::{Document, FileDoc};
use super::paths::{self, doc_key, split_key, ROOT};
use super::resolver::ConflictResolver;
use super::retry::{check_bulk, retry_on_conflict, Committed};
use super::{now_millis, ChangeSet, ClientError, SyncError, SyncResult, Version};
use crate::storage::{DocWrite, DocumentStore, FetchResult};

/// Default number of checkpoints kept in an encoded chain
pub const DEFAULT_CHAIN_LIMIT: usize = 10;

/// A client-visible sync position, encoded as `"version:sum"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub version: Version,
    pub sum: u64,
}

impl Checkpoint {
    pub fn new(version: Version, sum: u64) -> Self {
        Self { version, sum }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.sum)
    }
}

impl FromStr for Checkpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ClientError::bad_request(format!("malformed checkpoint: {:?}", s));
        let (version, sum) = s.trim().split_once(':').ok_or_else(malformed)?;
        Ok(Self {
            version: version.parse().map_err(|_| malformed())?,
            sum: sum.parse().map_err(|_| malformed())?,
        })
    }
}

/// Checkpoints a client holds, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointChain(pub Vec<Checkpoint>);

impl CheckpointChain {
    /// Parse a comma-joined chain; the empty string is the empty chain
    pub fn parse(encoded: &str) -> Result<Self, ClientError> {
        if encoded.trim().is_empty() {
            return Ok(Self::default());
        }
        encoded
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Comma-joined form keeping at most `limit` newest entries
    pub fn encode(&self, limit: usize) -> String {
        self.0
            .iter()
            .take(limit)
            .map(Checkpoint::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for CheckpointChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode(usize::MAX))
    }
}

/// Result of a checkpoint read: the client's new chain and what it is missing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointUpdates {
    pub chain: CheckpointChain,
    pub changes: ChangeSet,
    /// Number of client checkpoints that failed verification
    pub dropped: usize,
}

#[derive(Clone)]
pub struct CheckpointAccumulator {
    store: Arc<dyn DocumentStore>,
    resolver: ConflictResolver,
    max_attempts: usize,
    chain_limit: usize,
}

impl CheckpointAccumulator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        resolver: ConflictResolver,
        max_attempts: usize,
        chain_limit: usize,
    ) -> Self {
        Self {
            store,
            resolver,
            max_attempts,
            chain_limit: chain_limit.max(1),
        }
    }

    /// Checkpoint covering every current version at or below `upper`
    pub async fn get_checkpoint_at(&self, repo_id: &str, upper: Option<Version>) -> SyncResult<Checkpoint> {
        let aggregate = self.store.version_aggregate(repo_id, upper).await?;
        Ok(Checkpoint::new(aggregate.max, aggregate.sum))
    }

    /// Write file contents with fresh versions. Directory pointers are not
    /// maintained here.
    pub async fn write_updates(&self, repo_id: &str, changes: &ChangeSet) -> SyncResult<Version> {
        paths::validate_repo_id(repo_id)?;
        if changes.is_empty() {
            return Err(ClientError::bad_request("changeset is empty").into());
        }
        for path in changes.keys() {
            paths::validate_file_path(path)?;
        }
        if !self.store.head(&doc_key(repo_id, ROOT)).await? {
            return Err(ClientError::not_found(format!("repo does not exist: {}", repo_id)).into());
        }

        let committed = Committed::default();
        let committed = &committed;
        let version = retry_on_conflict(self.max_attempts, move |attempt| {
            self.write_attempt(repo_id, changes, committed, attempt)
        })
        .await?;
        info!(repo_id, paths = changes.len(), version, "wrote versioned updates");
        Ok(version)
    }

    async fn write_attempt(
        &self,
        repo_id: &str,
        changes: &ChangeSet,
        committed: &Committed,
        attempt: usize,
    ) -> SyncResult<Version> {
        let keys: Vec<String> = changes.keys().map(|path| doc_key(repo_id, path)).collect();
        let fetched = self.store.fetch(&keys).await?;

        let conflicted: Vec<String> = keys
            .iter()
            .zip(&fetched)
            .filter(|(_, result)| result.is_conflicted())
            .map(|(key, _)| key.clone())
            .collect();
        if let Some(first) = conflicted.first().cloned() {
            debug!(repo_id, attempt, keys = conflicted.len(), "resolving conflicts before versioned write");
            self.resolver.resolve_keys(&conflicted).await?;
            return Err(SyncError::Conflict(first));
        }

        let max = self.store.version_aggregate(repo_id, None).await?.max;
        let timestamp = now_millis();
        let mut writes = Vec::with_capacity(keys.len());
        let mut last = max;

        for ((key, content), result) in keys.into_iter().zip(changes.values()).zip(fetched) {
            let (expected_rev, mut file) = match result {
                // Committed by an earlier attempt of this call
                FetchResult::Found(revision) if committed.contains(&key, &revision.rev) => continue,
                FetchResult::Found(revision) => match revision.doc {
                    Document::File(file) if content.is_none() && file.is_removed() => {
                        return Err(ClientError::unprocessable(format!("already deleted: {}", key)).into());
                    }
                    Document::File(file) => (Some(revision.rev), file),
                    other => {
                        return Err(ClientError::unprocessable(format!(
                            "existing document is not a file: {} is a {}",
                            key,
                            other.kind()
                        ))
                        .into());
                    }
                },
                FetchResult::NotFound if content.is_none() => {
                    return Err(ClientError::unprocessable(format!("document does not exist: {}", key)).into());
                }
                FetchResult::NotFound => (None, FileDoc::template()),
                FetchResult::Conflicted(_) => return Err(SyncError::Conflict(key)),
            };

            last += 1;
            file.record_write(last, timestamp.max(file.timestamp + 1), content.clone());
            writes.push(DocWrite::new(key, expected_rev, Document::File(file)));
        }

        let results = self.store.bulk(writes.clone()).await?;
        committed.record(&results);
        let conflicted: Vec<String> = check_bulk(&writes, results)?
            .into_iter()
            .filter(|outcome| outcome.conflicted)
            .map(|outcome| outcome.key)
            .collect();
        if !conflicted.is_empty() {
            self.resolver.resolve_keys(&conflicted).await?;
        }
        Ok(last)
    }

    /// Everything a client holding `chain` is missing, plus its new chain.
    ///
    /// Checkpoints are tried newest first; one whose sum no longer matches the
    /// server's history is dropped. The implicit `0:0` checkpoint after the
    /// last entry always verifies and means a full resync.
    pub async fn read_updates(&self, repo_id: &str, chain: &CheckpointChain) -> SyncResult<CheckpointUpdates> {
        paths::validate_repo_id(repo_id)?;
        if !self.store.head(&doc_key(repo_id, ROOT)).await? {
            return Err(ClientError::not_found(format!("repo does not exist: {}", repo_id)).into());
        }
        self.resolver.resolve_repo(repo_id).await?;

        for start in 0..=chain.0.len() {
            let current = chain.0.get(start).copied().unwrap_or_default();
            let fetched = self.store.files_since(repo_id, current.version).await?;
            let files: Vec<(String, FileDoc)> = fetched
                .into_iter()
                .filter_map(|(key, revision)| match revision.doc {
                    Document::File(file) => Some((key, file)),
                    _ => None,
                })
                .collect();

            let wip_sum = self.get_checkpoint_at(repo_id, Some(current.version)).await?.sum;
            let overwrite_diff: u64 = files
                .iter()
                .filter_map(|(_, file)| file.historical_version_at_or_below(current.version))
                .sum();

            if wip_sum + overwrite_diff != current.sum {
                warn!(
                    repo_id,
                    checkpoint = %current,
                    wip_sum,
                    overwrite_diff,
                    "checkpoint does not match history, falling back"
                );
                continue;
            }

            let version = files
                .iter()
                .map(|(_, file)| file.version())
                .fold(current.version, Version::max);
            let sum = current.sum
                + files
                    .iter()
                    .map(|(_, file)| {
                        file.version() - file.historical_version_at_or_below(current.version).unwrap_or(0)
                    })
                    .sum::<u64>();
            let latest = Checkpoint::new(version, sum);

            let mut kept: Vec<Checkpoint> = chain.0[start..].to_vec();
            if latest != current {
                kept.insert(0, latest);
            }
            kept.truncate(self.chain_limit);

            let changes: ChangeSet = files
                .into_iter()
                .filter_map(|(key, file)| {
                    split_key(&key).map(|(_, path)| (path.to_string(), file.content))
                })
                .collect();

            debug!(repo_id, checkpoint = %latest, dropped = start, files = changes.len(), "read updates");
            return Ok(CheckpointUpdates {
                chain: CheckpointChain(kept),
                changes,
                dropped: start,
            });
        }

        // 0:0 always verifies, so the loop returns before running out
        Err(SyncError::Structural(format!(
            "no checkpoint of {} verified against {}",
            repo_id,
            chain
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{replicate, MemoryStore};
    use crate::sync::document::{GitProvenance, RepoDoc};
    use crate::sync::writer::WriteEngine;

    fn set(entries: &[(&str, Option<&str>)]) -> ChangeSet {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.map(|c| c.as_bytes().to_vec())))
            .collect()
    }

    async fn accumulator(store: Arc<dyn DocumentStore>) -> CheckpointAccumulator {
        let resolver = ConflictResolver::new(store.clone(), 10);
        WriteEngine::new(store.clone(), resolver.clone(), 10)
            .create_repo("r", RepoDoc::new(now_millis(), GitProvenance::default()))
            .await
            .unwrap();
        CheckpointAccumulator::new(store, resolver, 10, DEFAULT_CHAIN_LIMIT)
    }

    #[test]
    fn test_chain_encoding() {
        let chain = CheckpointChain::parse("12:40,7:15,0:0").unwrap();
        assert_eq!(
            chain.0,
            vec![Checkpoint::new(12, 40), Checkpoint::new(7, 15), Checkpoint::new(0, 0)]
        );
        assert_eq!(chain.to_string(), "12:40,7:15,0:0");
        assert_eq!(chain.encode(2), "12:40,7:15");
        assert_eq!(CheckpointChain::parse(&chain.to_string()).unwrap(), chain);

        assert!(CheckpointChain::parse("").unwrap().0.is_empty());
        assert!(CheckpointChain::parse("12").is_err());
        assert!(CheckpointChain::parse("1:2,x:3").is_err());
        assert_eq!(
            "-1:0".parse::<Checkpoint>().unwrap_err().status(),
            400
        );
    }

    #[tokio::test]
    async fn test_incremental_reads() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let acc = accumulator(store).await;

        assert_eq!(acc.write_updates("r", &set(&[("/a", Some("1")), ("/b", Some("2"))])).await.unwrap(), 2);
        let first = acc.read_updates("r", &CheckpointChain::default()).await.unwrap();
        assert_eq!(first.chain.0, vec![Checkpoint::new(2, 3)]);
        assert_eq!(first.changes.len(), 2);
        assert_eq!(first.dropped, 0);

        // Overwrite /a: version 1 is superseded by 3
        acc.write_updates("r", &set(&[("/a", Some("1b"))])).await.unwrap();
        let second = acc.read_updates("r", &first.chain).await.unwrap();
        assert_eq!(second.chain.0, vec![Checkpoint::new(3, 5), Checkpoint::new(2, 3)]);
        assert_eq!(second.changes, set(&[("/a", Some("1b"))]));
        assert_eq!(acc.get_checkpoint_at("r", None).await.unwrap(), Checkpoint::new(3, 5));

        // Nothing new: chain unchanged
        let third = acc.read_updates("r", &second.chain).await.unwrap();
        assert_eq!(third.chain, second.chain);
        assert!(third.changes.is_empty());

        // Deletions travel as None
        acc.write_updates("r", &set(&[("/b", None)])).await.unwrap();
        let fourth = acc.read_updates("r", &third.chain).await.unwrap();
        assert_eq!(fourth.changes, set(&[("/b", None)]));
        assert_eq!(fourth.chain.0.first(), Some(&Checkpoint::new(4, 7)));
    }

    #[tokio::test]
    async fn test_stale_checkpoint_falls_back() {
        let a: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_replica_id("a"));
        let b: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_replica_id("b"));
        let acc_a = accumulator(a.clone()).await;
        replicate(a.as_ref(), b.as_ref(), "r").await.unwrap();
        let acc_b = CheckpointAccumulator::new(b.clone(), ConflictResolver::new(b.clone(), 10), 10, 10);

        // Both masters hand out version 1 for different files
        acc_a.write_updates("r", &set(&[("/x", Some("x"))])).await.unwrap();
        acc_b.write_updates("r", &set(&[("/y", Some("y"))])).await.unwrap();
        let seen = acc_a.read_updates("r", &CheckpointChain::default()).await.unwrap();
        assert_eq!(seen.chain.0, vec![Checkpoint::new(1, 1)]);

        replicate(b.as_ref(), a.as_ref(), "r").await.unwrap();

        // 1:1 no longer adds up (two files now sit at version 1); the client
        // must get /y rather than an empty diff.
        let updates = acc_a.read_updates("r", &seen.chain).await.unwrap();
        assert_eq!(updates.dropped, 1);
        assert_eq!(updates.chain.0, vec![Checkpoint::new(1, 2)]);
        assert_eq!(updates.changes, set(&[("/x", Some("x")), ("/y", Some("y"))]));
    }

    #[tokio::test]
    async fn test_conflict_merge_keeps_checkpoint_valid() {
        let a: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_replica_id("a"));
        let b: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_replica_id("b"));
        let acc_a = accumulator(a.clone()).await;
        replicate(a.as_ref(), b.as_ref(), "r").await.unwrap();
        let acc_b = CheckpointAccumulator::new(b.clone(), ConflictResolver::new(b.clone(), 10), 10, 10);

        acc_a.write_updates("r", &set(&[("/f", Some("a"))])).await.unwrap();
        acc_b.write_updates("r", &set(&[("/f", Some("b"))])).await.unwrap();
        let seen = acc_a.read_updates("r", &CheckpointChain::default()).await.unwrap();
        assert_eq!(seen.chain.0, vec![Checkpoint::new(1, 1)]);

        replicate(b.as_ref(), a.as_ref(), "r").await.unwrap();

        // Resolution prepends a synthetic version 2 over the shared version 1
        let updates = acc_a.read_updates("r", &seen.chain).await.unwrap();
        assert_eq!(updates.dropped, 0);
        assert_eq!(updates.chain.0, vec![Checkpoint::new(2, 2), Checkpoint::new(1, 1)]);
        assert_eq!(updates.changes.len(), 1);
        let Document::File(file) = a.get("r:/f").await.unwrap().unwrap().doc else {
            panic!("expected file");
        };
        assert_eq!(file.versions, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_write_errors() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let acc = accumulator(store).await;

        let missing_repo = acc.write_updates("nope", &set(&[("/f", Some("x"))])).await.unwrap_err();
        assert_eq!(missing_repo.client().map(|c| c.status()), Some(404));

        let missing_file = acc.write_updates("r", &set(&[("/f", None)])).await.unwrap_err();
        assert_eq!(missing_file.client().map(|c| c.status()), Some(422));

        let empty = acc.write_updates("r", &ChangeSet::new()).await.unwrap_err();
        assert_eq!(empty.client().map(|c| c.status()), Some(400));
    }

    #[tokio::test]
    async fn test_delete_twice_is_rejected() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let acc = accumulator(store).await;

        assert_eq!(acc.write_updates("r", &set(&[("/f", Some("x"))])).await.unwrap(), 1);
        assert_eq!(acc.write_updates("r", &set(&[("/f", None)])).await.unwrap(), 2);

        let again = acc.write_updates("r", &set(&[("/f", None)])).await.unwrap_err();
        assert_eq!(again.client().map(|c| c.status()), Some(422));
        assert_eq!(acc.get_checkpoint_at("r", None).await.unwrap(), Checkpoint::new(2, 2));

        // Writing the path again makes it deletable once more
        assert_eq!(acc.write_updates("r", &set(&[("/f", Some("y"))])).await.unwrap(), 3);
        assert_eq!(acc.write_updates("r", &set(&[("/f", None)])).await.unwrap(), 4);
    }
}

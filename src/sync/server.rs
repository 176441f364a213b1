//! SyncServer: the engine facade the request layer talks to.
//!
//! Every request runs independently against the shared document store; the
//! server itself holds no per-repo state. Coordination between concurrent
//! requests, and between replicas, happens only through optimistic
//! concurrency on the store plus the conflict resolver. A background task
//! periodically sweeps every repo for replication conflicts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::checkpoint::{CheckpointAccumulator, CheckpointChain, CheckpointUpdates, DEFAULT_CHAIN_LIMIT};
use super::diff::{DiffEngine, DiffOptions, TreeDiff};
use super::document::{Document, GitProvenance, RepoDoc, RepoUsage};
use super::paths::{self, doc_key, ROOT};
use super::resolver::{ConflictResolver, ResolveReport};
use super::retry::DEFAULT_MAX_ATTEMPTS;
use super::writer::WriteEngine;
use super::{now_millis, ChangeSet, ClientError, SyncError, SyncResult, Timestamp, Version};
use crate::storage::DocumentStore;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Attempts per operation before a write conflict becomes fatal
    pub max_conflict_retries: usize,
    /// Checkpoints kept in a client's chain
    pub checkpoint_chain_limit: usize,
    /// Period of the background conflict sweep; `None` disables it
    pub conflict_sweep_interval: Option<Duration>,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: DEFAULT_MAX_ATTEMPTS,
            checkpoint_chain_limit: DEFAULT_CHAIN_LIMIT,
            conflict_sweep_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Public view of a repo document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSummary {
    pub repo_id: String,
    pub timestamp: Timestamp,
    pub created_at: Timestamp,
    pub last_git_hash: Option<String>,
    pub last_git_time: Option<Timestamp>,
    pub usage: RepoUsage,
}

impl RepoSummary {
    fn new(repo_id: &str, repo: &RepoDoc) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            timestamp: repo.timestamp(),
            created_at: repo.created_at,
            last_git_hash: repo.provenance.last_git_hash.clone(),
            last_git_time: repo.provenance.last_git_time,
            usage: repo.usage,
        }
    }
}

/// The main synchronization server
pub struct SyncServer {
    /// Server configuration
    config: SyncServerConfig,
    /// Shared document store
    store: Arc<dyn DocumentStore>,
    writer: WriteEngine,
    diff: DiffEngine,
    resolver: ConflictResolver,
    checkpoints: CheckpointAccumulator,
    /// Server start time
    started_at: Instant,
    /// Completed conflict sweeps
    sweeps: AtomicU64,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server
    pub fn new(store: Arc<dyn DocumentStore>, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let attempts = config.max_conflict_retries.max(1);
        let resolver = ConflictResolver::new(store.clone(), attempts);
        Self {
            writer: WriteEngine::new(store.clone(), resolver.clone(), attempts),
            diff: DiffEngine::new(resolver.clone()),
            checkpoints: CheckpointAccumulator::new(
                store.clone(),
                resolver.clone(),
                attempts,
                config.checkpoint_chain_limit,
            ),
            resolver,
            store,
            config,
            started_at: Instant::now(),
            sweeps: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, SyncServerConfig::default())
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get storage
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn create_repo(&self, repo_id: &str, provenance: GitProvenance) -> SyncResult<RepoSummary> {
        let repo = RepoDoc::new(now_millis(), provenance);
        self.writer.create_repo(repo_id, repo.clone()).await?;
        Ok(RepoSummary::new(repo_id, &repo))
    }

    pub async fn repo_summary(&self, repo_id: &str) -> SyncResult<RepoSummary> {
        paths::validate_repo_id(repo_id)?;
        let key = doc_key(repo_id, ROOT);
        match self.resolver.fetch_resolved(&[key.clone()]).await?.pop().flatten() {
            Some(Document::Repo(repo)) => Ok(RepoSummary::new(repo_id, &repo)),
            Some(Document::Tombstone) | None => {
                Err(ClientError::not_found(format!("repo does not exist: {}", repo_id)).into())
            }
            Some(other) => Err(SyncError::Structural(format!(
                "{} holds a {}, expected a repo",
                key,
                other.kind()
            ))),
        }
    }

    pub async fn apply_change_set(
        &self,
        repo_id: &str,
        changes: &ChangeSet,
        baseline: Timestamp,
    ) -> SyncResult<Timestamp> {
        self.writer.apply_change_set(repo_id, changes, baseline).await
    }

    pub async fn diff_since(&self, repo_id: &str, baseline: Timestamp, options: DiffOptions) -> SyncResult<TreeDiff> {
        self.diff.diff_since(repo_id, baseline, options).await
    }

    /// Resolve every replication conflict in a repo. Idempotent.
    pub async fn resolve_conflicts(&self, repo_id: &str) -> SyncResult<ResolveReport> {
        paths::validate_repo_id(repo_id)?;
        self.resolver.resolve_repo(repo_id).await
    }

    pub async fn checkpoint_read(&self, repo_id: &str, chain: &CheckpointChain) -> SyncResult<CheckpointUpdates> {
        self.checkpoints.read_updates(repo_id, chain).await
    }

    pub async fn checkpoint_write(&self, repo_id: &str, changes: &ChangeSet) -> SyncResult<Version> {
        self.checkpoints.write_updates(repo_id, changes).await
    }

    /// Resolve conflicts in every repo. A failing repo is logged and skipped.
    pub async fn sweep_conflicts(&self) -> SyncResult<ResolveReport> {
        let mut total = ResolveReport::default();
        for repo_id in self.store.repo_ids().await? {
            match self.resolver.resolve_repo(&repo_id).await {
                Ok(report) => {
                    total.keys += report.keys;
                    total.rewritten += report.rewritten;
                    total.tombstoned += report.tombstoned;
                }
                Err(e) => error!("Conflict sweep failed for repo {}: {}", repo_id, e),
            }
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        Ok(total)
    }

    /// Get server statistics
    pub async fn stats(&self) -> SyncResult<ServerStats> {
        Ok(ServerStats {
            replica_id: self.store.replica_id().to_string(),
            repos: self.store.repo_ids().await?.len(),
            conflict_sweeps: self.sweeps.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        })
    }

    /// Start the background conflict sweep, if configured
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let Some(sweep_interval) = self.config.conflict_sweep_interval else {
            info!("Conflict sweep disabled");
            return BackgroundTaskHandles { sweep_task: None };
        };

        let server = self.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match server.sweep_conflicts().await {
                            Ok(report) if report.keys > 0 => {
                                info!(
                                    keys = report.keys,
                                    tombstoned = report.tombstoned,
                                    "Conflict sweep resolved keys"
                                );
                            }
                            Ok(_) => debug!("Conflict sweep found nothing"),
                            Err(e) => error!("Conflict sweep failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Conflict sweep shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            sweep_task: Some(sweep_handle),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub replica_id: String,
    pub repos: usize,
    pub conflict_sweeps: u64,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweep_task: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        if let Some(task) = self.sweep_task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{replicate, MemoryStore, Revision, SledStore, StorageConfig};
    use tempfile::tempdir;

    fn memory_server(replica: &str) -> SyncServer {
        SyncServer::with_store(Arc::new(MemoryStore::with_replica_id(replica)))
    }

    fn set(entries: &[(&str, Option<&str>)]) -> ChangeSet {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.map(|c| c.as_bytes().to_vec())))
            .collect()
    }

    async fn winner(server: &SyncServer, key: &str) -> Revision {
        server.store().get(key).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = memory_server("a");
        let stats = server.stats().await.unwrap();
        assert_eq!(stats.repos, 0);
        assert_eq!(stats.replica_id, "a");
    }

    #[tokio::test]
    async fn test_create_and_describe_repo() {
        let server = memory_server("a");
        let provenance = GitProvenance {
            last_git_hash: Some("abc123".into()),
            last_git_time: Some(1_600_000_000_000),
        };
        let created = server.create_repo("notes", provenance).await.unwrap();
        assert_eq!(created.last_git_hash.as_deref(), Some("abc123"));

        let summary = server.repo_summary("notes").await.unwrap();
        assert_eq!(summary, created);

        let again = server.create_repo("notes", GitProvenance::default()).await.unwrap_err();
        assert_eq!(again.client().map(|c| c.status()), Some(409));

        let missing = server.repo_summary("other").await.unwrap_err();
        assert_eq!(missing.client().map(|c| c.status()), Some(404));

        let invalid = server.repo_summary("no:colons").await.unwrap_err();
        assert_eq!(invalid.client().map(|c| c.status()), Some(400));
    }

    #[tokio::test]
    async fn test_two_masters_converge() {
        let a = memory_server("a");
        let b = memory_server("b");
        let t0 = a.create_repo("r", GitProvenance::default()).await.unwrap().timestamp;
        replicate(a.store().as_ref(), b.store().as_ref(), "r").await.unwrap();

        a.apply_change_set("r", &set(&[("/f", Some("A"))]), t0).await.unwrap();
        b.apply_change_set("r", &set(&[("/f", Some("BB"))]), t0).await.unwrap();
        let rev_a = winner(&a, "r:/f").await;
        let rev_b = winner(&b, "r:/f").await;
        let expected = [rev_a, rev_b]
            .into_iter()
            .max_by(|x, y| {
                let tx = x.doc.timestamp();
                let ty = y.doc.timestamp();
                (tx, x.rev.clone()).cmp(&(ty, y.rev.clone()))
            })
            .unwrap();
        let Document::File(expected_file) = expected.doc else {
            panic!("expected file");
        };

        replicate(b.store().as_ref(), a.store().as_ref(), "r").await.unwrap();
        replicate(a.store().as_ref(), b.store().as_ref(), "r").await.unwrap();

        let report = a.resolve_conflicts("r").await.unwrap();
        assert_eq!(report.keys, 2);
        b.resolve_conflicts("r").await.unwrap();

        for server in [&a, &b] {
            assert!(server.store().conflicted_keys("r").await.unwrap().is_empty());
            let Document::File(file) = winner(server, "r:/f").await.doc else {
                panic!("expected file");
            };
            assert_eq!(file.content, expected_file.content);
            assert_eq!(file.versions, vec![2, 1]);

            let diff = server.diff_since("r", 0, DiffOptions::default()).await.unwrap();
            assert!(diff.is_consistent);
            assert_eq!(diff.paths.len(), 1);
            assert!(diff.paths.contains_key("/f"));
            assert!(diff.deleted.is_empty());
        }

        // Resolving again changes nothing
        assert_eq!(a.resolve_conflicts("r").await.unwrap(), ResolveReport::default());
        assert_eq!(winner(&a, "r:/f").await, winner(&b, "r:/f").await);
    }

    #[tokio::test]
    async fn test_double_deletion_is_rejected() {
        let server = memory_server("a");
        let t0 = server.create_repo("r", GitProvenance::default()).await.unwrap().timestamp;
        let t1 = server.apply_change_set("r", &set(&[("/dir/f", Some("x"))]), t0).await.unwrap();
        let t2 = server.apply_change_set("r", &set(&[("/dir/f", None)]), t1).await.unwrap();

        let err = server.apply_change_set("r", &set(&[("/dir/f", None)]), t2).await.unwrap_err();
        assert_eq!(err.client().map(|c| c.status()), Some(422));

        let diff = server.diff_since("r", t1, DiffOptions::default()).await.unwrap();
        assert_eq!(diff.deleted.get("/dir/f"), Some(&t2));
        assert!(diff.paths.is_empty());
    }

    #[tokio::test]
    async fn test_both_models_share_files() {
        let server = memory_server("a");
        let t0 = server.create_repo("r", GitProvenance::default()).await.unwrap().timestamp;
        server
            .apply_change_set("r", &set(&[("/a", Some("1")), ("/b/c", Some("2"))]), t0)
            .await
            .unwrap();

        let updates = server.checkpoint_read("r", &CheckpointChain::default()).await.unwrap();
        assert_eq!(updates.changes.len(), 2);
        assert_eq!(updates.chain.to_string(), "2:3");

        assert_eq!(server.checkpoint_write("r", &set(&[("/a", Some("3"))])).await.unwrap(), 3);
        let next = server.checkpoint_read("r", &updates.chain).await.unwrap();
        assert_eq!(next.changes, set(&[("/a", Some("3"))]));
        assert_eq!(next.chain.to_string(), "3:5,2:3");
    }

    #[tokio::test]
    async fn test_sweep_resolves_every_repo() {
        let a = memory_server("a");
        let b = memory_server("b");
        for repo in ["one", "two"] {
            let t0 = a.create_repo(repo, GitProvenance::default()).await.unwrap().timestamp;
            replicate(a.store().as_ref(), b.store().as_ref(), repo).await.unwrap();
            a.apply_change_set(repo, &set(&[("/x", Some("a"))]), t0).await.unwrap();
            b.apply_change_set(repo, &set(&[("/y", Some("b"))]), t0).await.unwrap();
            replicate(b.store().as_ref(), a.store().as_ref(), repo).await.unwrap();
        }

        let report = a.sweep_conflicts().await.unwrap();
        assert_eq!(report.keys, 2);
        for repo in ["one", "two"] {
            assert!(a.store().conflicted_keys(repo).await.unwrap().is_empty());
            let summary = a.repo_summary(repo).await.unwrap();
            assert_eq!(summary.usage.write_count, 1);
        }
        assert_eq!(a.stats().await.unwrap().conflict_sweeps, 1);
    }

    #[tokio::test]
    async fn test_background_sweep_stops_on_shutdown() {
        let config = SyncServerConfig {
            conflict_sweep_interval: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let server = Arc::new(SyncServer::new(Arc::new(MemoryStore::new()), config));
        let handles = server.clone().start_background_tasks();

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        handles.wait().await;
        assert!(server.stats().await.unwrap().conflict_sweeps >= 1);
    }

    #[tokio::test]
    async fn test_sled_backed_server() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let server = SyncServer::with_store(Arc::new(SledStore::open(config).unwrap()));

        let t0 = server.create_repo("r", GitProvenance::default()).await.unwrap().timestamp;
        let t1 = server.apply_change_set("r", &set(&[("/a/b", Some("x"))]), t0).await.unwrap();
        let diff = server.diff_since("r", t0, DiffOptions::default()).await.unwrap();
        assert_eq!(diff.paths.get("/a/b"), Some(&t1));
        assert_eq!(server.stats().await.unwrap().repos, 1);
    }
}

//! Storage module: the abstract document store the sync engine runs against.
//!
//! Every key of the form `{repoId}:{path}` maps to one logical document, but
//! replication may leave several live sibling revisions under a key. Backends
//! expose those siblings explicitly instead of hiding them:
//! - `fetch` reports not-found / found / conflicted per key
//! - `bulk` reports success or conflict per document
//! - partition views answer version aggregates and conflict listings

mod memory_store;
mod revision;
mod sled_store;

pub use memory_store::MemoryStore;
pub use revision::{Revision, RevisionTree};
pub use sled_store::SledStore;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::sync::document::Document;
use crate::sync::Version;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Per-key outcome of a bulk fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    NotFound,
    Found(Revision),
    /// Two or more live siblings, winner first
    Conflicted(Vec<Revision>),
}

impl FetchResult {
    pub fn is_conflicted(&self) -> bool {
        matches!(self, FetchResult::Conflicted(_))
    }
}

/// One document write in a bulk request
#[derive(Debug, Clone)]
pub struct DocWrite {
    pub key: String,
    /// Live leaf being replaced; `None` creates the document
    pub expected_rev: Option<String>,
    pub doc: Document,
}

impl DocWrite {
    pub fn new(key: impl Into<String>, expected_rev: Option<String>, doc: Document) -> Self {
        Self {
            key: key.into(),
            expected_rev,
            doc,
        }
    }

    /// Retire a live leaf
    pub fn tombstone(key: impl Into<String>, rev: impl Into<String>) -> Self {
        Self::new(key, Some(rev.into()), Document::Tombstone)
    }
}

/// Successful per-document write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub key: String,
    pub rev: String,
    /// The key still holds other live siblings after this write
    pub conflicted: bool,
}

/// Per-document write failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("document update conflict")]
    Conflict,

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// One entry per submitted write, in submission order
pub type BulkWriteResult = Vec<Result<WriteOutcome, WriteError>>;

/// Sum/max/count over current file versions in a partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionAggregate {
    pub max: Version,
    pub sum: u64,
    pub count: u64,
}

impl VersionAggregate {
    fn add(&mut self, version: Version) {
        self.max = self.max.max(version);
        self.sum += version;
        self.count += 1;
    }

    /// Aggregate a run of indexed versions
    pub fn of(versions: impl IntoIterator<Item = Version>) -> Self {
        let mut agg = VersionAggregate::default();
        for version in versions {
            agg.add(version);
        }
        agg
    }
}

/// Abstract, partitioned, multi-revision document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Identifier of this replica, for logs
    fn replica_id(&self) -> &str;

    /// Winning live revision of a key
    async fn get(&self, key: &str) -> StorageResult<Option<Revision>>;

    /// Whether a key holds a live document
    async fn head(&self, key: &str) -> StorageResult<bool>;

    /// Bulk get, one result per key in order
    async fn fetch(&self, keys: &[String]) -> StorageResult<Vec<FetchResult>>;

    /// Per-document atomic bulk upsert
    async fn bulk(&self, writes: Vec<DocWrite>) -> StorageResult<BulkWriteResult>;

    /// `sum`/`max`/`count` of current file versions `<= upper` (all when `None`).
    /// Answered from the partition's version index, not by loading documents.
    async fn version_aggregate(
        &self,
        repo_id: &str,
        upper: Option<Version>,
    ) -> StorageResult<VersionAggregate>;

    /// Live file winners whose current version is `> after`
    async fn files_since(&self, repo_id: &str, after: Version) -> StorageResult<Vec<(String, Revision)>>;

    /// Keys in the partition currently holding two or more live siblings
    async fn conflicted_keys(&self, repo_id: &str) -> StorageResult<Vec<String>>;

    /// Repos with a live root document
    async fn repo_ids(&self) -> StorageResult<Vec<String>>;

    /// Full revision trees of a partition, for replication
    async fn export_partition(&self, repo_id: &str) -> StorageResult<Vec<(String, RevisionTree)>>;

    /// Merge replicated leaves into a key; returns whether anything changed
    async fn import_tree(&self, key: &str, tree: &RevisionTree) -> StorageResult<bool>;
}

/// Push one repo partition from `source` into `target`, the way the
/// database's own replication would. Returns the number of keys changed.
pub async fn replicate(
    source: &dyn DocumentStore,
    target: &dyn DocumentStore,
    repo_id: &str,
) -> StorageResult<usize> {
    let mut changed = 0;
    for (key, tree) in source.export_partition(repo_id).await? {
        if target.import_tree(&key, &tree).await? {
            changed += 1;
        }
    }
    tracing::debug!(
        repo_id,
        source = source.replica_id(),
        target = target.replica_id(),
        changed,
        "replicated partition"
    );
    Ok(changed)
}

/// Which backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 1GB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: "./data/vaultsync.sled".to_string(),
            cache_size: 1024 * 1024 * 1024, // 1GB
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

/// Open the configured backend
pub fn open_store(config: &StorageConfig) -> StorageResult<Arc<dyn DocumentStore>> {
    match config.backend {
        StorageBackend::Sled => Ok(Arc::new(SledStore::open(config.clone())?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

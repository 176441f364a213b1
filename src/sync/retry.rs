//! Bounded retry around optimistic-concurrency conflicts.
//!
//! Each attempt must re-read everything it depends on: the conflict means a
//! concurrent writer changed the state the previous attempt was built from.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, warn};

use super::{SyncError, SyncResult};
use crate::storage::{BulkWriteResult, DocWrite, WriteError, WriteOutcome};

/// Default bound on attempts per operation
pub const DEFAULT_MAX_ATTEMPTS: usize = 100;

/// Run `op` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` conflicts have been seen.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: usize, mut op: F) -> SyncResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Err(SyncError::Conflict(key)) => {
                debug!(attempt, key = %key, "write conflict, retrying");
            }
            other => return other,
        }
    }
    warn!(attempts = max_attempts, "giving up after repeated write conflicts");
    Err(SyncError::RetriesExhausted {
        attempts: max_attempts,
    })
}

/// Revisions written by earlier attempts of one operation.
///
/// A bulk write is atomic per document only, so an attempt that hits a
/// conflict may still have committed some of its documents. The next attempt
/// finds them at the recorded revision and treats them as already applied.
#[derive(Debug, Default)]
pub struct Committed(Mutex<HashMap<String, String>>);

impl Committed {
    pub fn record(&self, results: &BulkWriteResult) {
        let mut revs = self.0.lock();
        for outcome in results.iter().flatten() {
            revs.insert(outcome.key.clone(), outcome.rev.clone());
        }
    }

    /// Whether `rev` is the revision this operation left at `key`
    pub fn contains(&self, key: &str, rev: &str) -> bool {
        self.0.lock().get(key).map_or(false, |committed| committed == rev)
    }
}

/// Turn a bulk result into outcomes, or the first failure as a `SyncError`.
/// Conflicts take priority so the whole batch is retried.
pub fn check_bulk(writes: &[DocWrite], results: BulkWriteResult) -> SyncResult<Vec<WriteOutcome>> {
    if results.len() != writes.len() {
        return Err(SyncError::Structural(format!(
            "bulk write returned {} results for {} documents",
            results.len(),
            writes.len()
        )));
    }

    if let Some((write, _)) = writes
        .iter()
        .zip(&results)
        .find(|(_, result)| matches!(result, Err(WriteError::Conflict)))
    {
        return Err(SyncError::Conflict(write.key.clone()));
    }

    writes
        .iter()
        .zip(results)
        .map(|(write, result)| {
            result.map_err(|err| SyncError::Structural(format!("{}: {}", write.key, err)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::document::Document;
    use crate::sync::ClientError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_on_conflict(10, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(SyncError::Conflict("r:/f".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_bound() {
        let result: SyncResult<()> =
            retry_on_conflict(5, |_| async { Err(SyncError::Conflict("r:/f".into())) }).await;
        assert!(matches!(result, Err(SyncError::RetriesExhausted { attempts: 5 })));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: SyncResult<()> = retry_on_conflict(5, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::unprocessable("already deleted").into()) }
        })
        .await;

        assert!(result.unwrap_err().client().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_committed_tracks_latest_rev() {
        let committed = Committed::default();
        let outcome = |rev: &str| WriteOutcome {
            key: "r:/a".into(),
            rev: rev.into(),
            conflicted: false,
        };
        committed.record(&vec![Ok(outcome("1-a")), Err(WriteError::Conflict)]);
        assert!(committed.contains("r:/a", "1-a"));
        assert!(!committed.contains("r:/b", "1-a"));

        committed.record(&vec![Ok(outcome("2-b"))]);
        assert!(!committed.contains("r:/a", "1-a"));
        assert!(committed.contains("r:/a", "2-b"));
    }

    #[test]
    fn test_check_bulk_prefers_conflict() {
        let writes = vec![
            DocWrite::new("r:/a", None, Document::Tombstone),
            DocWrite::new("r:/b", None, Document::Tombstone),
        ];
        let results = vec![
            Err(WriteError::Rejected("bad".into())),
            Err(WriteError::Conflict),
        ];
        match check_bulk(&writes, results) {
            Err(SyncError::Conflict(key)) => assert_eq!(key, "r:/b"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}

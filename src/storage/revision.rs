//! Revision trees: the leaf revisions held under one key.
//!
//! Revision ids are `{generation}-{hash}` where the hash covers the parent id
//! and the serialized body, so two replicas applying the same write to the
//! same parent derive the same id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use super::WriteError;
use crate::sync::document::Document;
use crate::sync::Version;

/// Maximum number of ancestor ids retained per revision
pub const REV_HISTORY_LIMIT: usize = 100;

/// One revision of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub rev: String,
    /// Ancestor revision ids, nearest first
    pub ancestors: Vec<String>,
    pub doc: Document,
}

impl Revision {
    /// Derive a child revision of `parent` (or a first revision) carrying `doc`
    pub fn child(parent: Option<&Revision>, doc: Document) -> Result<Revision, WriteError> {
        let body = bincode::serialize(&doc).map_err(|e| WriteError::Rejected(e.to_string()))?;

        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.rev.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(&body);
        let hash = hex::encode(hasher.finalize());

        let generation = parent.map_or(0, |p| p.generation()) + 1;
        let ancestors = match parent {
            Some(parent) => std::iter::once(parent.rev.clone())
                .chain(parent.ancestors.iter().cloned())
                .take(REV_HISTORY_LIMIT)
                .collect(),
            None => Vec::new(),
        };

        Ok(Revision {
            rev: format!("{}-{}", generation, &hash[..32]),
            ancestors,
            doc,
        })
    }

    pub fn generation(&self) -> u64 {
        self.rev
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.doc.is_tombstone()
    }

    /// Store winner order: higher generation, then larger id
    pub fn winner_order(&self, other: &Revision) -> Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.rev.cmp(&other.rev))
    }
}

/// Leaf revisions of one key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionTree {
    leaves: Vec<Revision>,
}

impl RevisionTree {
    pub fn leaves(&self) -> &[Revision] {
        &self.leaves
    }

    /// Non-tombstone leaves
    pub fn live(&self) -> impl Iterator<Item = &Revision> {
        self.leaves.iter().filter(|leaf| !leaf.is_deleted())
    }

    pub fn winner(&self) -> Option<&Revision> {
        self.live().max_by(|a, b| a.winner_order(b))
    }

    pub fn is_conflicted(&self) -> bool {
        self.live().nth(1).is_some()
    }

    /// Live leaves, winner first
    pub fn siblings(&self) -> Vec<Revision> {
        let mut live: Vec<Revision> = self.live().cloned().collect();
        live.sort_by(|a, b| b.winner_order(a));
        live
    }

    /// Current version of the winner, if it is a file
    pub fn file_version(&self) -> Option<Version> {
        match self.winner().map(|rev| &rev.doc) {
            Some(Document::File(file)) => Some(file.version()),
            _ => None,
        }
    }

    /// Replace the live leaf `expected_rev` (or create the document) with a
    /// child carrying `doc`.
    pub fn apply(&mut self, expected_rev: Option<&str>, doc: Document) -> Result<Revision, WriteError> {
        let parent_idx = match expected_rev {
            None => {
                if self.live().next().is_some() || doc.is_tombstone() {
                    return Err(WriteError::Conflict);
                }
                // Re-creation extends the newest deleted branch
                self.leaves
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.winner_order(b.1))
                    .map(|(idx, _)| idx)
            }
            Some(rev) => {
                let idx = self
                    .leaves
                    .iter()
                    .position(|leaf| leaf.rev == rev && !leaf.is_deleted())
                    .ok_or(WriteError::Conflict)?;
                Some(idx)
            }
        };

        let child = Revision::child(parent_idx.map(|idx| &self.leaves[idx]), doc)?;
        if let Some(idx) = parent_idx {
            self.leaves.remove(idx);
        }
        if !self.leaves.iter().any(|leaf| leaf.rev == child.rev) {
            self.leaves.push(child.clone());
        }
        Ok(child)
    }

    /// Merge leaves replicated from another copy of this key. A local leaf
    /// that is an ancestor of an incoming leaf is superseded; unrelated
    /// leaves become siblings.
    pub fn merge_from(&mut self, incoming: &RevisionTree) -> bool {
        let mut changed = false;
        for leaf in &incoming.leaves {
            let known = self.leaves.iter().any(|local| {
                local.rev == leaf.rev || local.ancestors.iter().any(|a| *a == leaf.rev)
            });
            if known {
                continue;
            }
            self.leaves
                .retain(|local| !leaf.ancestors.iter().any(|a| *a == local.rev));
            self.leaves.push(leaf.clone());
            changed = true;
        }
        changed
    }
}

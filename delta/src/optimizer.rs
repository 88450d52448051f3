//! Aggregated access ranks, used to order the content of future deltas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{trace::TraceGroup, Collection, Digest};

/// What is known about when a piece of content tends to be accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    /// Earliest rank ever observed.
    pub best: u32,
    /// Sum of all observed ranks.
    pub total: u64,
    pub observations: u32,
}

impl Rank {
    pub fn mean(&self) -> u64 {
        self.total / u64::from(self.observations.max(1))
    }
}

/// Per-collection priority table, keyed by content digest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTable {
    ranks: BTreeMap<Digest, Rank>,
}

impl PriorityTable {
    /// Ranks the content touched by a trace in the order it was first
    /// requested. Paths unknown to the collection or without content are
    /// skipped.
    pub fn from_trace(collection: &Collection, group: &TraceGroup) -> Self {
        let mut ranks = BTreeMap::new();

        for path in group.access_order() {
            let Some(digest) = collection
                .get(path)
                .filter(|v| v.entry.has_content())
                .and_then(|v| v.entry.digest)
            else {
                continue;
            };

            let next = ranks.len() as u32;
            ranks.entry(digest).or_insert(Rank {
                best: next,
                total: u64::from(next),
                observations: 1,
            });
        }

        debug!(trace.paths = group.entries.len(), trace.ranked = ranks.len(), "ranked trace");

        Self { ranks }
    }

    /// Folds another table in. Existing digests keep their data, refined by
    /// the new observations.
    pub fn absorb(&mut self, other: PriorityTable) {
        for (digest, rank) in other.ranks {
            self.ranks
                .entry(digest)
                .and_modify(|r| {
                    r.best = r.best.min(rank.best);
                    r.total += rank.total;
                    r.observations += rank.observations;
                })
                .or_insert(rank);
        }
    }

    pub fn rank(&self, digest: &Digest) -> Option<&Rank> {
        self.ranks.get(digest)
    }

    /// Sort key for a digest; unranked content sorts last.
    pub fn sort_key(&self, digest: &Digest) -> (u32, u64) {
        self.ranks
            .get(digest)
            .map(|r| (r.best, r.mean()))
            .unwrap_or((u32::MAX, u64::MAX))
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, crate::Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(buf: &[u8]) -> Result<Self, crate::Error> {
        Ok(serde_json::from_slice(buf)?)
    }
}

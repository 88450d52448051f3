//! File access traces recorded by clients while a delta is being mounted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ImageRef};

/// One file open: when it was asked for, and when its bytes were available.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub path: String,
    pub requested_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
}

/// The accesses of one mount, keyed by the image stack it represented.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceGroup {
    pub images: Vec<ImageRef>,
    pub entries: Vec<TraceEntry>,
}

impl TraceGroup {
    pub fn signature(&self) -> String {
        ImageRef::signature(&self.images)
    }

    /// Paths in the order they were first requested.
    pub fn access_order(&self) -> Vec<&str> {
        let mut sorted: Vec<&TraceEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.requested_at);

        let mut seen = HashSet::new();
        sorted
            .into_iter()
            .filter(|e| seen.insert(e.path.as_str()))
            .map(|e| e.path.as_str())
            .collect()
    }
}

/// A batch of traces as shipped to the proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCollection {
    pub groups: Vec<TraceGroup>,
}

impl TraceCollection {
    /// Appends another batch. Every group stays its own run, even when it
    /// covers the same image stack as one already present, so each run is
    /// ranked on its own.
    pub fn merge(&mut self, other: TraceCollection) {
        self.groups.extend(other.groups);
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(buf: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(buf).map_err(|e| Error::InvalidRequest(e.to_string()))
    }
}

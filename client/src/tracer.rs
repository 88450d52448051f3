//! Records which files a mount opened, and when their bytes were there.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use layerlift_delta::{
    trace::{TraceCollection, TraceEntry, TraceGroup},
    Error, ImageRef,
};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

pub struct TraceRecorder {
    images: Vec<ImageRef>,
    entries: Mutex<Vec<TraceEntry>>,
}

impl TraceRecorder {
    pub fn new(images: Vec<ImageRef>) -> Self {
        Self {
            images,
            entries: Mutex::new(vec![]),
        }
    }

    pub fn record(&self, path: &str, requested_at: DateTime<Utc>, ready_at: DateTime<Utc>) {
        self.entries.lock().push(TraceEntry {
            path: path.to_string(),
            requested_at,
            ready_at,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> TraceGroup {
        TraceGroup {
            images: self.images.clone(),
            entries: self.entries.lock().clone(),
        }
    }

    /// Writes everything recorded so far into `dir` and starts over. Returns
    /// the written file, if there was anything to write.
    #[instrument(skip(self), err)]
    pub async fn flush(&self, dir: &Path) -> Result<Option<PathBuf>, Error> {
        let entries = std::mem::take(&mut *self.entries.lock());
        if entries.is_empty() {
            return Ok(None);
        }

        let traces = TraceCollection {
            groups: vec![TraceGroup {
                images: self.images.clone(),
                entries,
            }],
        };

        let name = format!(
            "{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.9f"),
            ImageRef::signature(&self.images).replace(['/', ':', ','], "_")
        );
        let path = dir.join(name);
        tokio::fs::write(&path, traces.to_json()?).await?;

        debug!(path=?path, "flushed trace");
        Ok(Some(path))
    }
}

/// Reads every trace file below `dir`, one group per recorded run. Unreadable files are
/// skipped. Returns the merged traces and the files they came from.
#[instrument(err)]
pub async fn collect_traces(dir: &Path) -> Result<(TraceCollection, Vec<PathBuf>), Error> {
    let mut merged = TraceCollection::default();
    let mut files = vec![];

    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let buf = tokio::fs::read(&path).await?;
        match TraceCollection::from_json(&buf) {
            Ok(traces) => {
                merged.merge(traces);
                files.push(path);
            }
            Err(e) => warn!(path=?path, err=%e, "skipping unreadable trace"),
        }
    }

    files.sort();
    Ok((merged, files))
}

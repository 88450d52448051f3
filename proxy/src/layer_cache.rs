use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use bytes::Bytes;
use layerlift_delta::{Digest, Error};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::upstream::LayerSource;

type Cell = Arc<OnceCell<Bytes>>;

/// Whole layer blobs held in memory, shared across concurrent responses.
///
/// Every digest being fetched maps to a cell that is filled exactly once: the
/// first caller fetches, everybody else waits on the same cell. Cells stay
/// pinned in the in-flight map until their fetch settles, and only finished
/// windows are subject to LRU eviction. A failed fetch leaves nothing behind,
/// so the next caller retries.
pub struct LayerCache {
    source: Arc<dyn LayerSource>,
    state: Mutex<CacheState>,
}

struct CacheState {
    windows: LruCache<Digest, Bytes>,
    in_flight: HashMap<Digest, Cell>,
}

impl LayerCache {
    pub fn new(source: Arc<dyn LayerSource>, capacity: NonZeroUsize) -> Self {
        Self {
            source,
            state: Mutex::new(CacheState {
                windows: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
        }
    }

    #[instrument(skip(self), fields(layer.digest = %digest), err)]
    pub async fn window(&self, repository: &str, digest: &Digest) -> Result<Bytes, Error> {
        let cell = {
            let mut state = self.state.lock();
            if let Some(window) = state.windows.get(digest) {
                return Ok(window.clone());
            }
            state
                .in_flight
                .entry(*digest)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                debug!("fetching layer");
                self.source.fetch_blob(repository, digest).await
            })
            .await
            .cloned();

        let mut state = self.state.lock();
        if state
            .in_flight
            .get(digest)
            .is_some_and(|c| Arc::ptr_eq(c, &cell))
        {
            state.in_flight.remove(digest);
        }
        if let Ok(window) = &result {
            state.windows.put(*digest, window.clone());
        }

        result
    }
}

use std::{
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use layerlift_delta::{Digest, Error, ImageRef};
use parking_lot::RwLock;
use tracing::instrument;

use super::{LayerDescriptor, LayerSource};

/// Images and blobs held in process memory. Counts whole-blob fetches, so
/// callers can observe deduplication.
#[derive(Clone, Default)]
pub struct MemoryLayerSource {
    images: Arc<RwLock<HashMap<ImageRef, Vec<LayerDescriptor>>>>,
    blobs: Arc<RwLock<HashMap<Digest, Bytes>>>,
    blob_fetches: Arc<AtomicUsize>,
    fail_blobs: Arc<AtomicBool>,
}

impl MemoryLayerSource {
    /// Registers an image made of the given layer blobs, bottom first.
    pub fn add_image(&self, image: ImageRef, layers: Vec<Bytes>) -> Vec<LayerDescriptor> {
        let mut descriptors = Vec::with_capacity(layers.len());
        let mut blobs = self.blobs.write();
        for blob in layers {
            let descriptor = LayerDescriptor {
                digest: Digest::of(&blob),
                size: blob.len() as u64,
            };
            blobs.insert(descriptor.digest, blob);
            descriptors.push(descriptor);
        }
        self.images.write().insert(image, descriptors.clone());
        descriptors
    }

    /// How many whole blobs have been served.
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    /// Makes every subsequent whole-blob fetch fail.
    pub fn fail_blob_fetches(&self) {
        self.fail_blobs.store(true, Ordering::SeqCst);
    }

    fn blob(&self, digest: &Digest) -> Result<Bytes, Error> {
        self.blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("blob {} not found", digest)))
    }
}

#[async_trait]
impl LayerSource for MemoryLayerSource {
    #[instrument(skip(self), fields(image = %image), err)]
    async fn manifest(&self, image: &ImageRef) -> Result<Vec<LayerDescriptor>, Error> {
        self.images
            .read()
            .get(image)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("manifest for {} not found", image)))
    }

    async fn fetch_range(
        &self,
        _repository: &str,
        digest: &Digest,
        range: Range<u64>,
    ) -> Result<Bytes, Error> {
        let blob = self.blob(digest)?;
        if range.start > range.end || range.end > blob.len() as u64 {
            return Err(Error::InvalidRequest(format!(
                "range {:?} outside of blob {}",
                range, digest
            )));
        }
        Ok(blob.slice(range.start as usize..range.end as usize))
    }

    async fn fetch_blob(&self, _repository: &str, digest: &Digest) -> Result<Bytes, Error> {
        if self.fail_blobs.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("fetching {} failed", digest)));
        }
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.blob(digest)
    }
}

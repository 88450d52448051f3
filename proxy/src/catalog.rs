use std::sync::Arc;

use futures::future::try_join_all;
use layerlift_delta::{
    toc::{decode_index, parse_footer, Toc, FOOTER_SIZE},
    Collection, Error, ImageRef, Layer,
};
use tracing::{debug, info, instrument};

use crate::{
    metadata::MetadataStore,
    upstream::{LayerDescriptor, LayerSource},
};

/// Turns image references into collections, fetching and persisting
/// manifests and TOCs as needed.
pub struct Catalog {
    source: Arc<dyn LayerSource>,
    store: Arc<dyn MetadataStore>,
}

impl Catalog {
    pub fn new(source: Arc<dyn LayerSource>, store: Arc<dyn MetadataStore>) -> Self {
        Self { source, store }
    }

    pub fn source(&self) -> &Arc<dyn LayerSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Builds the collection of a single image and caches it.
    #[instrument(skip(self), fields(image = %image), err)]
    pub async fn prepare(&self, image: &ImageRef) -> Result<Collection, Error> {
        let collection = self.build(std::slice::from_ref(image)).await?;
        self.store.put_collection(&collection).await?;

        info!(
            collection.entries = collection.len(),
            collection.contents = collection.contents().len(),
            "prepared collection"
        );
        Ok(collection)
    }

    /// Returns the collection of an image stack, from cache if possible, with
    /// the current priority table attached.
    #[instrument(skip_all, fields(images = %ImageRef::signature(images)), err)]
    pub async fn load(&self, images: &[ImageRef]) -> Result<Collection, Error> {
        if images.is_empty() {
            return Ok(Collection::empty());
        }

        let signature = ImageRef::signature(images);
        let mut collection = match self.store.get_collection(&signature).await? {
            Some(collection) => {
                debug!("collection cache hit");
                collection
            }
            None => {
                let collection = self.build(images).await?;
                self.store.put_collection(&collection).await?;
                collection
            }
        };

        collection.set_priorities(self.store.get_priorities(&signature).await?);
        Ok(collection)
    }

    async fn build(&self, images: &[ImageRef]) -> Result<Collection, Error> {
        let mut layers = vec![];

        for image in images {
            let manifest = self.manifest(image).await?;
            let tocs = try_join_all(manifest.iter().map(|layer| self.toc(image.name(), layer))).await?;

            for (descriptor, toc) in manifest.into_iter().zip(tocs) {
                let serial = self.store.layer_serial(&descriptor.digest).await?;
                layers.push((
                    Layer {
                        digest: descriptor.digest,
                        size: descriptor.size,
                        serial,
                        repository: image.name().to_string(),
                    },
                    toc,
                ));
            }
        }

        Collection::build(images.to_vec(), layers)
    }

    async fn manifest(&self, image: &ImageRef) -> Result<Vec<LayerDescriptor>, Error> {
        if let Some(layers) = self.store.get_manifest(image).await? {
            return Ok(layers);
        }

        let layers = self.source.manifest(image).await?;
        self.store.put_manifest(image, &layers).await?;
        Ok(layers)
    }

    /// Reads a layer's TOC with two range requests: the footer, then the
    /// TOC region it points to.
    #[instrument(skip(self, layer), fields(layer.digest = %layer.digest), err)]
    async fn toc(&self, repository: &str, layer: &LayerDescriptor) -> Result<Toc, Error> {
        if let Some(toc) = self.store.get_toc(&layer.digest).await? {
            return Ok(toc);
        }

        let tail_start = layer.size.saturating_sub(FOOTER_SIZE as u64);
        let tail = self
            .source
            .fetch_range(repository, &layer.digest, tail_start..layer.size)
            .await?;
        let (toc_offset, footer_size) = parse_footer(&tail)
            .map_err(|e| Error::metadata(layer.digest.to_string(), e.to_string()))?;

        let toc_end = layer.size.saturating_sub(footer_size as u64);
        if toc_offset >= toc_end {
            return Err(Error::metadata(
                layer.digest.to_string(),
                format!("TOC offset {} past end of blob", toc_offset),
            ));
        }

        let region = self
            .source
            .fetch_range(repository, &layer.digest, toc_offset..toc_end)
            .await?;
        let toc = Toc::from_raw(decode_index(&region).await?, toc_offset)?;

        self.store.put_toc(&layer.digest, &toc).await?;
        Ok(toc)
    }
}

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use layerlift_delta::{
    optimizer::PriorityTable, toc::Toc, Collection, Digest, Error, ImageRef,
};
use parking_lot::RwLock;
use tracing::instrument;

use super::MetadataStore;
use crate::upstream::LayerDescriptor;

#[derive(Default)]
struct State {
    manifests: HashMap<ImageRef, Vec<LayerDescriptor>>,
    tocs: HashMap<Digest, Toc>,
    serials: HashMap<Digest, u64>,
    collections: HashMap<String, Collection>,
    priorities: HashMap<String, PriorityTable>,
}

#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_manifest(&self, image: &ImageRef) -> Result<Option<Vec<LayerDescriptor>>, Error> {
        Ok(self.state.read().manifests.get(image).cloned())
    }

    async fn put_manifest(&self, image: &ImageRef, layers: &[LayerDescriptor]) -> Result<(), Error> {
        self.state
            .write()
            .manifests
            .insert(image.clone(), layers.to_vec());
        Ok(())
    }

    async fn get_toc(&self, layer: &Digest) -> Result<Option<Toc>, Error> {
        Ok(self.state.read().tocs.get(layer).cloned())
    }

    async fn put_toc(&self, layer: &Digest, toc: &Toc) -> Result<(), Error> {
        self.state.write().tocs.insert(*layer, toc.clone());
        Ok(())
    }

    #[instrument(skip(self), fields(layer.digest = %layer))]
    async fn layer_serial(&self, layer: &Digest) -> Result<u64, Error> {
        let mut state = self.state.write();
        let next = state.serials.len() as u64 + 1;
        Ok(*state.serials.entry(*layer).or_insert(next))
    }

    async fn get_collection(&self, signature: &str) -> Result<Option<Collection>, Error> {
        Ok(self.state.read().collections.get(signature).cloned())
    }

    async fn put_collection(&self, collection: &Collection) -> Result<(), Error> {
        self.state
            .write()
            .collections
            .insert(collection.signature(), collection.clone());
        Ok(())
    }

    async fn get_priorities(&self, signature: &str) -> Result<PriorityTable, Error> {
        Ok(self
            .state
            .read()
            .priorities
            .get(signature)
            .cloned()
            .unwrap_or_default())
    }

    async fn merge_priorities(&self, signature: &str, update: PriorityTable) -> Result<(), Error> {
        self.state
            .write()
            .priorities
            .entry(signature.to_string())
            .or_default()
            .absorb(update);
        Ok(())
    }
}

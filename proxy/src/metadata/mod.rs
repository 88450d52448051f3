//! Persistent state of the proxy: manifests, TOCs, layer serial ids, the
//! collection cache and the optimizer's priority tables.

use async_trait::async_trait;
use layerlift_delta::{
    optimizer::PriorityTable, toc::Toc, Collection, Digest, Error, ImageRef,
};

use crate::upstream::LayerDescriptor;

mod from_addr;
mod memory;
mod redb;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryMetadataStore;
pub use self::redb::RedbMetadataStore;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_manifest(&self, image: &ImageRef) -> Result<Option<Vec<LayerDescriptor>>, Error>;

    async fn put_manifest(&self, image: &ImageRef, layers: &[LayerDescriptor]) -> Result<(), Error>;

    async fn get_toc(&self, layer: &Digest) -> Result<Option<Toc>, Error>;

    async fn put_toc(&self, layer: &Digest, toc: &Toc) -> Result<(), Error>;

    /// Returns the serial id of a layer, assigning the next free one (starting
    /// at 1) on first use.
    async fn layer_serial(&self, layer: &Digest) -> Result<u64, Error>;

    /// Looks up a cached collection by its stack signature.
    async fn get_collection(&self, signature: &str) -> Result<Option<Collection>, Error>;

    async fn put_collection(&self, collection: &Collection) -> Result<(), Error>;

    /// The priority table of a collection; empty if nothing was reported yet.
    async fn get_priorities(&self, signature: &str) -> Result<PriorityTable, Error>;

    /// Folds `update` into the stored table, in one transaction.
    async fn merge_priorities(&self, signature: &str, update: PriorityTable) -> Result<(), Error>;
}

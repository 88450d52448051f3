use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use layerlift_delta::{Digest, Error, ImageRef};
use serde::{Deserialize, Serialize};

mod from_addr;
mod memory;
mod registry;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryLayerSource;
pub use self::registry::RegistryLayerSource;

/// A layer as listed in an image manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub digest: Digest,
    pub size: u64,
}

/// Upstream storage holding image manifests and layer blobs.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// The layers of an image, bottom first.
    async fn manifest(&self, image: &ImageRef) -> Result<Vec<LayerDescriptor>, Error>;

    /// A byte range of a layer blob.
    async fn fetch_range(
        &self,
        repository: &str,
        digest: &Digest,
        range: Range<u64>,
    ) -> Result<Bytes, Error>;

    /// An entire layer blob, verified against its digest.
    async fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Bytes, Error>;
}

/// Checks a fetched blob against the digest it was requested by.
pub(crate) fn verify_blob(digest: &Digest, blob: &Bytes) -> Result<(), Error> {
    let actual = Digest::of(blob);
    if &actual != digest {
        return Err(Error::Transport(format!(
            "layer {} arrived with digest {}",
            digest, actual
        )));
    }
    Ok(())
}

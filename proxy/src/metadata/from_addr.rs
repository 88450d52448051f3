use std::sync::Arc;

use layerlift_delta::Error;
use url::Url;

use super::{MemoryMetadataStore, MetadataStore, RedbMetadataStore};

/// Constructs a [MetadataStore] from an URI.
///
/// - `memory://` ([MemoryMetadataStore])
/// - `redb:///path/to/db` ([RedbMetadataStore]); `redb://` without a path
///   keeps the database in memory.
pub async fn from_addr(uri: &str) -> Result<Arc<dyn MetadataStore>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    Ok(match url.scheme() {
        "memory" => {
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Arc::<MemoryMetadataStore>::default()
        }
        "redb" => {
            if url.has_host() {
                return Err(Error::StorageError("no host allowed".to_string()));
            }
            if url.path().is_empty() {
                Arc::new(RedbMetadataStore::new_temporary()?)
            } else {
                Arc::new(RedbMetadataStore::new(url.path().into()).await?)
            }
        }
        _ => return Err(Error::StorageError(format!("unknown scheme: {}", url.scheme()))),
    })
}

use std::sync::Arc;

use layerlift_delta::Error;
use url::Url;

use super::{LayerSource, MemoryLayerSource, RegistryLayerSource};

/// Constructs a [LayerSource] from an URI.
///
/// - `memory://` ([MemoryLayerSource]), empty until images are added
/// - `http://host[:port]`, `https://host[:port]` ([RegistryLayerSource])
pub fn from_addr(uri: &str) -> Result<Arc<dyn LayerSource>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    Ok(match url.scheme() {
        "memory" => {
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest("invalid url".to_string()));
            }
            Arc::<MemoryLayerSource>::default()
        }
        "http" | "https" => {
            if !url.has_host() {
                return Err(Error::InvalidRequest("registry url needs a host".to_string()));
            }
            Arc::new(RegistryLayerSource::new(url))
        }
        _ => return Err(Error::InvalidRequest(format!("unknown scheme: {}", url.scheme()))),
    })
}

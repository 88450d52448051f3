use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use layerlift_delta::{Digest, Error, ImageRef};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{instrument, warn};
use url::Url;

use super::{verify_blob, LayerDescriptor, LayerSource};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    layers: Vec<LayerDescriptor>,
}

/// Talks the OCI distribution API to a single registry.
#[derive(Clone)]
pub struct RegistryLayerSource {
    base_url: Url,
    http_client: reqwest::Client,
}

impl RegistryLayerSource {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidRequest(format!("unable to construct url: {}", e)))
    }

    async fn get(&self, url: Url, range: Option<&Range<u64>>) -> Result<(StatusCode, Bytes), Error> {
        let mut request = self.http_client.get(url.clone());
        if let Some(range) = range {
            request = request.header(
                header::RANGE,
                format!("bytes={}-{}", range.start, range.end.saturating_sub(1)),
            );
        }

        let resp = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(err=%e, url=%url, "unable to fetch from registry");
                Error::Transport(e.to_string())
            })?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl LayerSource for RegistryLayerSource {
    #[instrument(skip(self), fields(image = %image), err)]
    async fn manifest(&self, image: &ImageRef) -> Result<Vec<LayerDescriptor>, Error> {
        let url = self.url(&format!("v2/{}/manifests/{}", image.name(), image.tag()))?;

        let resp = self
            .http_client
            .get(url)
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let manifest: Manifest = serde_json::from_slice(&body)
            .map_err(|e| Error::metadata(image.to_string(), format!("manifest: {}", e)))?;
        if manifest.layers.is_empty() {
            return Err(Error::metadata(image.to_string(), "manifest lists no layers"));
        }

        Ok(manifest.layers)
    }

    #[instrument(skip(self), fields(layer.digest = %digest), err)]
    async fn fetch_range(
        &self,
        repository: &str,
        digest: &Digest,
        range: Range<u64>,
    ) -> Result<Bytes, Error> {
        let url = self.url(&format!("v2/{}/blobs/{}", repository, digest))?;
        let (status, body) = self.get(url, Some(&range)).await?;

        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }

        // The registry ignored the range and sent the whole blob.
        body.get(range.start as usize..range.end as usize)
            .map(|_| body.slice(range.start as usize..range.end as usize))
            .ok_or_else(|| {
                Error::Transport(format!("range {:?} outside of blob {}", range, digest))
            })
    }

    #[instrument(skip(self), fields(layer.digest = %digest), err)]
    async fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Bytes, Error> {
        let url = self.url(&format!("v2/{}/blobs/{}", repository, digest))?;
        let (_, body) = self.get(url, None).await?;
        verify_blob(digest, &body)?;
        Ok(body)
    }
}

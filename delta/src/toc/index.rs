//! The `stargz.index.json` document as written by stargz/eStargz tooling,
//! and its gzip+tar envelope.

use std::{collections::BTreeMap, path::Path};

use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::Error;

/// Name of the tar entry holding the index.
pub const TOC_TAR_NAME: &str = "stargz.index.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawToc {
    pub version: i32,
    pub entries: Vec<RawEntry>,
}

#[serde_as]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "modtime", default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(rename = "linkName", default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(rename = "userName", default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(rename = "groupName", default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    #[serde(rename = "devMajor", default)]
    pub dev_major: u32,
    #[serde(rename = "devMinor", default)]
    pub dev_minor: u32,
    #[serde_as(as = "BTreeMap<_, Base64>")]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(rename = "chunkOffset", default)]
    pub chunk_offset: u64,
    #[serde(rename = "chunkSize", default)]
    pub chunk_size: u64,
    #[serde(rename = "chunkDigest", default, skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,
    #[serde(rename = "NumLink", default)]
    pub num_link: u32,
}

/// Decodes the TOC region of a layer blob (everything between the TOC offset
/// and the footer).
pub async fn decode_index(region: &[u8]) -> Result<RawToc, Error> {
    let mut archive = tokio_tar::Archive::new(GzipDecoder::new(region));
    let mut entries = archive
        .entries()
        .map_err(|e| Error::metadata(TOC_TAR_NAME, e.to_string()))?;

    while let Some(entry) = entries.next().await {
        let mut entry = entry.map_err(|e| Error::metadata(TOC_TAR_NAME, e.to_string()))?;
        let is_index = entry
            .path()
            .map(|p| p.as_ref() == Path::new(TOC_TAR_NAME))
            .unwrap_or(false);
        if !is_index {
            continue;
        }

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::metadata(TOC_TAR_NAME, e.to_string()))?;

        return serde_json::from_slice(&buf)
            .map_err(|e| Error::metadata(TOC_TAR_NAME, e.to_string()));
    }

    Err(Error::metadata(TOC_TAR_NAME, "missing from TOC region"))
}

/// Produces a TOC region: a gzip member holding a tar archive with the index.
pub async fn encode_index(toc: &RawToc) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(toc)?;

    let mut header = tokio_tar::Header::new_gnu();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tokio_tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, TOC_TAR_NAME, json.as_slice())
        .await?;
    let tar = builder.into_inner().await?;

    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(&tar).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

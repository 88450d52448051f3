//! Delta bundles: what has to cross the wire to turn one image stack into
//! another, and how every destination path gets its bytes.

use std::collections::HashMap;

use async_compression::{
    tokio::{bufread::GzipDecoder, write::GzipEncoder},
    Level,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::{
    collection::{Collection, Layer},
    toc::{FileChunk, TocEntry},
    Digest, Error, ImageRef,
};

/// A piece of content scheduled for transmission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub digest: Digest,
    /// Destination layer the bytes are copied from.
    pub stack: u32,
    pub source_offset: u64,
    pub compressed_size: u64,
    /// Uncompressed size.
    pub size: u64,
    /// Position of the compressed bytes within the body.
    pub payload_offset: u64,
    /// Chunk offsets are absolute within the layer blob.
    pub chunks: Vec<FileChunk>,
}

/// Where a destination path gets its bytes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resolution {
    /// Already held by the client, in the layer with this serial id.
    Local { serial: u64 },
    /// Provided by the destination layer at this stack index without a
    /// dedicated transfer: either nothing needs transferring at all, or the
    /// same content is streamed once for that layer.
    Sibling { stack: u32 },
    /// Streamed as the output queue entry at this position.
    Payload { order: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedFile {
    /// Entry metadata, without chunk locations.
    pub entry: TocEntry,
    /// Destination layer the entry comes from.
    pub stack: u32,
    pub resolution: Resolution,
}

/// Content the client holds under an older layer, which the destination
/// layer at `stack` owns as well. It has to be placed under that layer's
/// serial before the destination can serve as a base of its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldContent {
    pub digest: Digest,
    /// Serial the bytes are held under now.
    pub serial: u64,
    pub stack: u32,
}

/// The diff of two collections, serialized as the header of a delta stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaBundle {
    pub source_images: Vec<ImageRef>,
    pub destination_images: Vec<ImageRef>,
    pub source: Vec<Layer>,
    pub destination: Vec<Layer>,
    /// Indexed by destination stack: whether the layer's blob must be fetched.
    pub required_layers: Vec<bool>,
    pub output_queue: Vec<ContentRecord>,
    /// Every destination path, sorted.
    pub requested_files: Vec<RequestedFile>,
    /// Sum of the compressed sizes in the output queue.
    pub body_length: u64,
    /// Everything resolved `Local`, by content.
    pub held: Vec<HeldContent>,
}

impl Collection {
    /// Computes what it takes to get from `base` to this collection.
    #[instrument(skip_all, fields(delta.from = %base.signature(), delta.to = %self.signature()), err)]
    pub fn diff(&self, base: &Collection) -> Result<DeltaBundle, Error> {
        let priorities = self.priorities();

        let mut order: Vec<_> = self.contents().iter().collect();
        order.sort_by_key(|c| (priorities.sort_key(&c.digest), c.discovery));

        let mut local: HashMap<Digest, u64> = HashMap::new();
        let mut held = vec![];
        let mut payload: HashMap<Digest, u32> = HashMap::new();
        let mut output_queue = vec![];
        let mut required_layers = vec![false; self.layers().len()];
        let mut body_length = 0u64;

        for content in order {
            if let Some(existing) = base.content(&content.digest) {
                let layer = base.layers().get(existing.stack as usize).ok_or_else(|| {
                    Error::metadata(content.digest.to_string(), "base layer out of range")
                })?;
                local.insert(content.digest, layer.serial);
                held.push(HeldContent {
                    digest: content.digest,
                    serial: layer.serial,
                    stack: content.stack,
                });
                continue;
            }

            let flag = required_layers
                .get_mut(content.stack as usize)
                .ok_or_else(|| {
                    Error::metadata(content.digest.to_string(), "owning layer out of range")
                })?;
            *flag = true;

            payload.insert(content.digest, output_queue.len() as u32);
            output_queue.push(ContentRecord {
                digest: content.digest,
                stack: content.stack,
                source_offset: content.source_offset,
                compressed_size: content.compressed_size,
                size: content.size,
                payload_offset: body_length,
                chunks: content.chunks.clone(),
            });
            body_length += content.compressed_size;
        }

        let mut requested_files = Vec::with_capacity(self.len());
        for (path, visible) in self.entries() {
            let resolution = if visible.entry.has_content() {
                let digest = visible
                    .entry
                    .digest
                    .ok_or_else(|| Error::metadata(path, "regular file without digest"))?;

                if let Some(serial) = local.get(&digest) {
                    Resolution::Local { serial: *serial }
                } else if let Some(order) = payload.get(&digest) {
                    let record = &output_queue[*order as usize];
                    let own_range = visible.entry.compressed_range().map(|(o, _)| o);
                    if record.stack == visible.content_stack
                        && own_range == Some(record.source_offset)
                    {
                        Resolution::Payload { order: *order }
                    } else {
                        Resolution::Sibling {
                            stack: record.stack,
                        }
                    }
                } else {
                    return Err(Error::metadata(
                        path,
                        format!("content {} neither local nor transferable", digest),
                    ));
                }
            } else {
                Resolution::Sibling {
                    stack: visible.stack,
                }
            };

            let mut entry = visible.entry.clone();
            entry.chunks.clear();
            requested_files.push(RequestedFile {
                entry,
                stack: visible.stack,
                resolution,
            });
        }

        debug!(
            delta.queue = output_queue.len(),
            delta.local = local.len(),
            delta.body_length = body_length,
            "computed delta"
        );

        Ok(DeltaBundle {
            source_images: base.images().to_vec(),
            destination_images: self.images().to_vec(),
            source: base.layers().to_vec(),
            destination: self.layers().to_vec(),
            required_layers,
            output_queue,
            requested_files,
            body_length,
            held,
        })
    }
}

impl DeltaBundle {
    /// Stack indices of the destination layers that must be fetched.
    pub fn required_stacks(&self) -> impl Iterator<Item = u32> + '_ {
        self.required_layers
            .iter()
            .enumerate()
            .filter(|(_, required)| **required)
            .map(|(stack, _)| stack as u32)
    }

    /// The queued content occupying exactly this range, if any.
    pub fn content_at(&self, stack: u32, offset: u64) -> Option<(u32, &ContentRecord)> {
        self.output_queue
            .iter()
            .enumerate()
            .find(|(_, r)| r.stack == stack && r.source_offset == offset)
            .map(|(order, r)| (order as u32, r))
    }

    /// Index from (stack, offset) to output queue position.
    pub fn range_index(&self) -> HashMap<(u32, u64), u32> {
        self.output_queue
            .iter()
            .enumerate()
            .map(|(order, r)| ((r.stack, r.source_offset), order as u32))
            .collect()
    }

    /// Serializes the bundle as the gzip-compressed header document.
    pub async fn encode_header(&self) -> Result<Bytes, Error> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzipEncoder::with_quality(Vec::new(), Level::Best);
        encoder.write_all(&json).await?;
        encoder.shutdown().await?;
        Ok(encoder.into_inner().into())
    }

    pub async fn decode_header(buf: &[u8]) -> Result<Self, Error> {
        let mut json = Vec::new();
        GzipDecoder::new(buf)
            .read_to_end(&mut json)
            .await
            .map_err(|e| Error::Protocol(format!("header: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| Error::Protocol(format!("header: {}", e)))
    }
}

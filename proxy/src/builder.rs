//! Streams a delta bundle: the compressed header, then the body in output
//! queue order, pre-empted by whatever the client asks for.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    sync::Arc,
};

use bytes::Bytes;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt, Sink, SinkExt,
};
use layerlift_delta::{
    wire::{BodyFrame, FileRequest},
    ContentRecord, DeltaBundle, Error,
};
use tracing::{debug, instrument, warn};

use crate::{file_requests::FileRequestQueue, layer_cache::LayerCache};

type Window = Shared<BoxFuture<'static, Result<Bytes, Arc<Error>>>>;

/// A header ready to be sent, with the layer fetches it kicked off.
pub struct PreparedBundle {
    pub header: Bytes,
    pub header_size: u64,
    /// Header size plus body length.
    pub content_length: u64,
    windows: HashMap<u32, Window>,
}

impl PreparedBundle {
    async fn window(&self, stack: u32) -> Result<Bytes, Error> {
        let window = self
            .windows
            .get(&stack)
            .ok_or_else(|| Error::Transport(format!("layer at stack {} was never fetched", stack)))?
            .clone();
        window
            .await
            .map_err(|e| Error::Transport(format!("layer at stack {}: {}", stack, e)))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BodyStats {
    pub entries: usize,
    /// Entries sent ahead of their turn because the client asked for them.
    pub urgent: usize,
    pub bytes: u64,
}

pub struct BundleBuilder {
    cache: Arc<LayerCache>,
}

impl BundleBuilder {
    pub fn new(cache: Arc<LayerCache>) -> Self {
        Self { cache }
    }

    /// Serializes the header and starts fetching every required layer in the
    /// background. Layers already in (or on their way into) the cache are
    /// shared, not fetched again.
    #[instrument(skip_all, fields(delta.to = %layerlift_delta::ImageRef::signature(&bundle.destination_images)), err)]
    pub async fn write_header(&self, bundle: &DeltaBundle) -> Result<PreparedBundle, Error> {
        let mut windows = HashMap::new();

        for stack in bundle.required_stacks() {
            let layer = bundle
                .destination
                .get(stack as usize)
                .ok_or_else(|| {
                    Error::metadata(format!("stack {}", stack), "required layer out of range")
                })?
                .clone();
            let cache = self.cache.clone();

            let fetch = tokio::spawn(async move {
                cache.window(&layer.repository, &layer.digest).await
            });
            let window: Window = async move {
                match fetch.await {
                    Ok(result) => result.map_err(Arc::new),
                    Err(e) => Err(Arc::new(Error::from(e))),
                }
            }
            .boxed()
            .shared();
            windows.insert(stack, window);
        }

        let header = bundle.encode_header().await?;
        let header_size = header.len() as u64;

        Ok(PreparedBundle {
            header,
            header_size,
            content_length: header_size + bundle.body_length,
            windows,
        })
    }

    /// Sends the header followed by the body.
    pub async fn write<S>(
        &self,
        bundle: &DeltaBundle,
        prepared: &PreparedBundle,
        requests: &FileRequestQueue,
        sink: &mut S,
    ) -> Result<BodyStats, Error>
    where
        S: Sink<Bytes> + Unpin,
        S::Error: Display,
    {
        sink.send(prepared.header.clone())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.write_body(bundle, prepared, requests, sink).await
    }

    /// Walks the output queue. Before every scheduled entry, pending file
    /// requests are served. No range is sent twice.
    #[instrument(skip_all, fields(delta.queue = bundle.output_queue.len()), err)]
    pub async fn write_body<S>(
        &self,
        bundle: &DeltaBundle,
        prepared: &PreparedBundle,
        requests: &FileRequestQueue,
        sink: &mut S,
    ) -> Result<BodyStats, Error>
    where
        S: Sink<Bytes> + Unpin,
        S::Error: Display,
    {
        let index = bundle.range_index();
        let mut sent: HashSet<(u32, u64)> = HashSet::new();
        let mut stats = BodyStats::default();

        for record in bundle.output_queue.iter() {
            while let Some(request) = requests.pop() {
                match lookup(bundle, &index, &request) {
                    Some(urgent) => {
                        if send_entry(prepared, urgent, &mut sent, &mut stats, sink).await? {
                            stats.urgent += 1;
                        }
                    }
                    None => debug!(?request, "dropping file request for unknown range"),
                }
            }

            send_entry(prepared, record, &mut sent, &mut stats, sink).await?;
        }

        flush(sink).await?;

        debug!(
            body.entries = stats.entries,
            body.urgent = stats.urgent,
            body.bytes = stats.bytes,
            "body complete"
        );
        Ok(stats)
    }
}

/// Maps a request to the queued content it names. The length has to match
/// too; anything else is ignored.
fn lookup<'a>(
    bundle: &'a DeltaBundle,
    index: &HashMap<(u32, u64), u32>,
    request: &FileRequest,
) -> Option<&'a ContentRecord> {
    let stack = request.stack()?;
    let order = index.get(&(stack, request.offset))?;
    let record = bundle.output_queue.get(*order as usize)?;
    (record.compressed_size == u64::from(request.length)).then_some(record)
}

async fn send_entry<S>(
    prepared: &PreparedBundle,
    record: &ContentRecord,
    sent: &mut HashSet<(u32, u64)>,
    stats: &mut BodyStats,
    sink: &mut S,
) -> Result<bool, Error>
where
    S: Sink<Bytes> + Unpin,
    S::Error: Display,
{
    if !sent.insert((record.stack, record.source_offset)) {
        return Ok(false);
    }

    let descriptor = FileRequest::for_content(record).ok_or_else(|| {
        Error::metadata(record.digest.to_string(), "content too large for one frame")
    })?;

    let window = prepared.window(record.stack).await.map_err(|e| {
        warn!(err=%e, layer.stack = record.stack, "layer unavailable");
        e
    })?;

    let start = record.source_offset as usize;
    let end = start + record.compressed_size as usize;
    if end > window.len() {
        return Err(Error::metadata(
            record.digest.to_string(),
            format!("range {}..{} outside of layer of {} bytes", start, end, window.len()),
        ));
    }

    let frame = BodyFrame {
        descriptor,
        payload: window.slice(start..end),
    };
    sink.send(frame.encode())
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    stats.entries += 1;
    stats.bytes += record.compressed_size;
    Ok(true)
}

async fn flush<S>(sink: &mut S) -> Result<(), Error>
where
    S: Sink<Bytes> + Unpin,
    S::Error: Display,
{
    sink.flush()
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

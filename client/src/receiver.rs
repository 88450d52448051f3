//! Consumes the body of a delta stream: inflates each entry, stores it, and
//! releases whoever waits for it.

use std::{collections::HashMap, sync::Arc};

use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use layerlift_delta::{wire::BodyFrame, ContentRecord, DeltaBundle, Error, Layer};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::{local_store::LocalStore, signal::SignalTable};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub entries: usize,
    pub bytes: u64,
}

pub struct Receiver {
    store: LocalStore,
    destination: Vec<Layer>,
    queue: Vec<ContentRecord>,
    index: HashMap<(u32, u64), u32>,
    body_length: u64,
    signals: Arc<SignalTable>,
}

impl Receiver {
    pub fn new(bundle: &DeltaBundle, store: LocalStore, signals: Arc<SignalTable>) -> Self {
        Self {
            store,
            destination: bundle.destination.clone(),
            queue: bundle.output_queue.clone(),
            index: bundle.range_index(),
            body_length: bundle.body_length,
            signals,
        }
    }

    /// Reads frames until the stream ends. Whatever has not arrived by then
    /// is aborted, so no caller waits forever; an early end or a broken frame
    /// fails the whole transfer.
    #[instrument(skip_all, fields(delta.queue = self.queue.len(), indicatif.pb_show = 1), err)]
    pub async fn receive<S>(&self, frames: S) -> Result<ReceiveStats, Error>
    where
        S: Stream<Item = Result<Bytes, Error>> + Unpin,
    {
        let span = Span::current();
        span.pb_set_style(&layerlift_tracing::PB_TRANSFER_STYLE);
        span.pb_set_message("Receiving delta");
        span.pb_set_length(self.body_length);

        let result = self.consume(frames).await;

        let aborted = self.signals.abort_pending();
        match result {
            Ok(_) if aborted > 0 => Err(Error::Transport(format!(
                "stream ended with {} contents missing",
                aborted
            ))),
            Err(e) => {
                warn!(err=%e, aborted, "transfer failed");
                Err(e)
            }
            ok => ok,
        }
    }

    async fn consume<S>(&self, mut frames: S) -> Result<ReceiveStats, Error>
    where
        S: Stream<Item = Result<Bytes, Error>> + Unpin,
    {
        let mut stats = ReceiveStats::default();

        while let Some(frame) = frames.next().await {
            let frame = BodyFrame::decode(frame?)?;
            let descriptor = frame.descriptor;

            let order = descriptor
                .stack()
                .and_then(|stack| self.index.get(&(stack, descriptor.offset)))
                .copied()
                .ok_or_else(|| Error::Protocol(format!("unexpected range {:?}", descriptor)))?;
            let record = &self.queue[order as usize];
            if u64::from(descriptor.length) != record.compressed_size {
                return Err(Error::Protocol(format!(
                    "range {:?} does not match content {}",
                    descriptor, record.digest
                )));
            }

            let serial = self
                .destination
                .get(record.stack as usize)
                .map(|l| l.serial)
                .ok_or_else(|| Error::metadata(record.digest.to_string(), "unknown layer"))?;

            let data = inflate(record, &frame.payload).await?;
            self.store
                .write_content(serial, &record.digest, &data)
                .await?;

            if !self.signals.fire(order) {
                debug!(content.digest = %record.digest, "content arrived twice");
            }

            stats.entries += 1;
            stats.bytes += record.compressed_size;
            Span::current().pb_inc(record.compressed_size);
        }

        debug!(entries = stats.entries, bytes = stats.bytes, "body complete");
        Ok(stats)
    }
}

/// Decompresses the chunks of one content from its compressed range.
pub async fn inflate(record: &ContentRecord, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if record.chunks.is_empty() {
        return Err(Error::Protocol(format!("content {} has no chunks", record.digest)));
    }

    let mut data = Vec::with_capacity(record.size as usize);
    for chunk in record.chunks.iter() {
        if chunk.chunk_offset != data.len() as u64 {
            return Err(Error::Protocol(format!(
                "content {}: chunk at {} out of order",
                record.digest, chunk.chunk_offset
            )));
        }

        let start = chunk.offset.checked_sub(record.source_offset);
        let member = start
            .and_then(|s| payload.get(s as usize..(s + chunk.compressed_size) as usize))
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "content {}: chunk at {} outside of payload",
                    record.digest, chunk.offset
                ))
            })?;

        let mut decoder = GzipDecoder::new(member);
        decoder.multiple_members(true);

        let before = data.len();
        decoder
            .take(chunk.chunk_size)
            .read_to_end(&mut data)
            .await
            .map_err(|e| Error::Protocol(format!("content {}: {}", record.digest, e)))?;
        if (data.len() - before) as u64 != chunk.chunk_size {
            return Err(Error::Protocol(format!(
                "content {}: chunk at {} is short",
                record.digest, chunk.offset
            )));
        }
    }

    Ok(data)
}

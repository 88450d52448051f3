use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use layerlift_delta::{
    wire::{FileRequest, HEADER_SIZE_HEADER, PAYLOAD_SIZE_HEADER, PROTOCOL_VERSION, VERSION_HEADER},
    DeltaBundle, Error, ImageRef,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    builder::{BundleBuilder, PreparedBundle},
    errors::AppError,
    file_requests::FileRequestQueue,
    AppState,
};

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 120;

/// Serves the delta between two image stacks over a websocket. Everything
/// that can fail before the first byte (metadata, diff, header) is reported
/// as a plain HTTP error.
#[instrument(skip(state, ws))]
pub async fn get(
    Path((from, to)): Path<(String, String)>,
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    let ws = ws.ok_or_else(|| Error::InvalidRequest("expected a websocket upgrade".into()))?;

    let from = ImageRef::parse_list(&from)?;
    let to = ImageRef::parse_list(&to)?;
    if to.is_empty() {
        return Err(Error::InvalidRequest("no destination image given".into()).into());
    }

    let base = state.catalog.load(&from).await?;
    let destination = state.catalog.load(&to).await?;
    let bundle = destination.diff(&base)?;
    let prepared = state.builder.write_header(&bundle).await?;

    info!(
        delta.header_size = prepared.header_size,
        delta.content_length = prepared.content_length,
        delta.queue = bundle.output_queue.len(),
        "serving delta"
    );

    let headers = [
        (HEADER_SIZE_HEADER, prepared.header_size.to_string()),
        (PAYLOAD_SIZE_HEADER, prepared.content_length.to_string()),
        (VERSION_HEADER, PROTOCOL_VERSION.to_string()),
    ];
    let builder = state.builder.clone();

    Ok((
        headers,
        ws.on_upgrade(move |socket| serve(socket, builder, bundle, prepared)),
    )
        .into_response())
}

async fn serve(
    socket: WebSocket,
    builder: Arc<BundleBuilder>,
    bundle: DeltaBundle,
    prepared: PreparedBundle,
) {
    let (sink, mut stream) = socket.split();
    let requests = Arc::new(FileRequestQueue::default());

    // Inbound: file requests only. Anything malformed is dropped.
    let reader = tokio::spawn({
        let requests = requests.clone();
        async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(buf)) => match FileRequest::decode(&buf) {
                        Some(request) => requests.push(request),
                        None => debug!(len = buf.len(), "dropping malformed file request"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    });

    let mut sink = sink.with(|frame: Bytes| {
        future::ready(Ok::<_, axum::Error>(Message::Binary(frame.to_vec())))
    });

    let close = match builder
        .write(&bundle, &prepared, &requests, &mut sink)
        .await
    {
        Ok(_) => CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        },
        Err(e) => {
            warn!(err=%e, "aborting delta");
            let mut reason = e.to_string();
            if reason.len() > MAX_CLOSE_REASON {
                let mut cut = MAX_CLOSE_REASON;
                while !reason.is_char_boundary(cut) {
                    cut -= 1;
                }
                reason.truncate(cut);
            }
            CloseFrame {
                code: close_code::ERROR,
                reason: reason.into(),
            }
        }
    };

    if let Err(e) = sink.get_mut().send(Message::Close(Some(close))).await {
        debug!(err=%e, "unable to close channel");
    }
    reader.abort();
}

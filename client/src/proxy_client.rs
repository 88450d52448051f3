//! Talks to a layerlift proxy: plain HTTP for prepare and report, a
//! websocket for deltas.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use layerlift_delta::{
    trace::TraceCollection,
    wire::{FileRequest, HEADER_SIZE_HEADER, PAYLOAD_SIZE_HEADER, PROTOCOL_VERSION, VERSION_HEADER},
    DeltaBundle, Error, ImageRef,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{
    self, handshake::client::Response, protocol::frame::coding::CloseCode,
    protocol::WebSocketConfig, Message,
};
use tracing::{debug, instrument, warn};
use url::Url;

/// An open delta: its header, the body still arriving, and the way to ask
/// for content out of order.
pub struct DeltaStream {
    pub bundle: DeltaBundle,
    pub header_size: u64,
    /// Header size plus body length, as announced.
    pub payload_size: u64,
    pub frames: ReceiverStream<Result<Bytes, Error>>,
    pub requests: mpsc::UnboundedSender<FileRequest>,
}

#[derive(Clone)]
pub struct ProxyClient {
    base: Url,
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(base: Url) -> Result<Self, Error> {
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidRequest(format!(
                    "unsupported proxy scheme {}",
                    other
                )))
            }
        }
        if base.cannot_be_a_base() {
            return Err(Error::InvalidRequest(format!("invalid proxy url {}", base)));
        }

        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    /// Appends path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidRequest(format!("invalid proxy url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    #[instrument(skip(self), fields(image = %image), err)]
    pub async fn prepare(&self, image: &ImageRef) -> Result<String, Error> {
        let url = self.endpoint(&["prepare", &image.to_string()])?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        text_or_error(resp).await
    }

    #[instrument(skip_all, fields(report.groups = traces.groups.len()), err)]
    pub async fn report(&self, traces: &TraceCollection) -> Result<String, Error> {
        let url = self.endpoint(&["report"])?;
        let resp = self
            .http
            .post(url)
            .body(traces.to_json()?)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        text_or_error(resp).await
    }

    /// Opens the delta from one image stack to another and reads its header.
    #[instrument(skip_all, fields(delta.from = %ImageRef::signature(from), delta.to = %ImageRef::signature(to)), err)]
    pub async fn fetch(&self, from: &[ImageRef], to: &[ImageRef]) -> Result<DeltaStream, Error> {
        let mut url = self.endpoint(&[
            "from",
            &ImageRef::signature(from),
            "to",
            &ImageRef::signature(to),
        ])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| Error::InvalidRequest(format!("cannot use {} for a websocket", url)))?;

        let mut config = WebSocketConfig::default();
        config.max_message_size = None;
        config.max_frame_size = None;

        let (ws, response) =
            tokio_tungstenite::connect_async_with_config(url.as_str(), Some(config), false)
                .await
                .map_err(|e| match e {
                    tungstenite::Error::Http(resp) => Error::Transport(format!(
                        "proxy answered {}: {}",
                        resp.status(),
                        resp.body()
                            .as_deref()
                            .map(String::from_utf8_lossy)
                            .unwrap_or_default()
                            .trim()
                    )),
                    e => Error::Transport(e.to_string()),
                })?;

        let version = header_str(&response, VERSION_HEADER)?;
        if version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "proxy speaks {}, expected {}",
                version, PROTOCOL_VERSION
            )));
        }
        let header_size: u64 = parse_header(&response, HEADER_SIZE_HEADER)?;
        let payload_size: u64 = parse_header(&response, PAYLOAD_SIZE_HEADER)?;

        let (mut sink, mut stream) = ws.split();

        let mut header = Vec::with_capacity(header_size as usize);
        while (header.len() as u64) < header_size {
            match stream.next().await {
                Some(Ok(Message::Binary(buf))) => header.extend_from_slice(&buf),
                Some(Ok(Message::Close(frame))) => {
                    return Err(Error::Transport(format!(
                        "closed before header was complete: {}",
                        frame.map(|f| f.reason.to_string()).unwrap_or_default()
                    )))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                None => {
                    return Err(Error::Transport(
                        "closed before header was complete".into(),
                    ))
                }
            }
        }
        if header.len() as u64 != header_size {
            return Err(Error::Protocol(format!(
                "header of {} bytes announced, got {}",
                header_size,
                header.len()
            )));
        }
        let bundle = DeltaBundle::decode_header(&header).await?;

        let (requests, mut outbound) = mpsc::unbounded_channel::<FileRequest>();
        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                if let Err(e) = sink.send(Message::Binary(request.encode().to_vec())).await {
                    debug!(err=%e, "unable to send file request");
                    break;
                }
            }
        });

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let item = match msg {
                    Ok(Message::Binary(buf)) => Ok(Bytes::from(buf)),
                    Ok(Message::Close(Some(frame))) if frame.code != CloseCode::Normal => {
                        warn!(code = ?frame.code, reason = %frame.reason, "proxy aborted the delta");
                        Err(Error::Transport(format!("proxy aborted: {}", frame.reason)))
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(Error::Transport(e.to_string())),
                };

                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(DeltaStream {
            bundle,
            header_size,
            payload_size,
            frames: ReceiverStream::new(rx),
            requests,
        })
    }
}

fn header_str<'a>(response: &'a Response, name: &str) -> Result<&'a str, Error> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Protocol(format!("missing response header {}", name)))
}

fn parse_header(response: &Response, name: &str) -> Result<u64, Error> {
    header_str(response, name)?
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid response header {}", name)))
}

async fn text_or_error(resp: reqwest::Response) -> Result<String, Error> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(Error::Transport(format!("proxy answered {}: {}", status, text.trim())));
    }
    Ok(text)
}

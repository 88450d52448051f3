//! One pull: the delta stream feeding a mounted [ImageFs].

use std::{future::Future, path::Path, sync::Arc};

use bytes::Bytes;
use futures::Stream;
use layerlift_delta::{wire::FileRequest, DeltaBundle, Error, ImageRef};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, instrument, warn};

use crate::{
    fs::ImageFs,
    local_store::LocalStore,
    proxy_client::ProxyClient,
    receiver::{ReceiveStats, Receiver},
    signal::SignalTable,
    tracer::TraceRecorder,
};

/// A mount the host should perform for the active snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    pub kind: String,
    pub source: String,
    pub options: Vec<String>,
}

pub struct Session {
    destination_images: Vec<ImageRef>,
    fs: Arc<ImageFs>,
    tracer: Arc<TraceRecorder>,
    signals: Arc<SignalTable>,
    receiver: Option<JoinHandle<Result<ReceiveStats, Error>>>,
}

impl Session {
    /// Opens the delta and starts receiving it in the background. The
    /// returned session's filesystem is usable right away.
    #[instrument(skip_all, err)]
    pub async fn start(
        client: &ProxyClient,
        store: LocalStore,
        from: &[ImageRef],
        to: &[ImageRef],
    ) -> Result<Self, Error> {
        let delta = client.fetch(from, to).await?;
        info!(
            delta.header_size = delta.header_size,
            delta.payload_size = delta.payload_size,
            delta.files = delta.bundle.requested_files.len(),
            delta.queue = delta.bundle.output_queue.len(),
            "header received"
        );
        Self::new(delta.bundle, delta.frames, delta.requests, store)
    }

    pub fn new<S>(
        bundle: DeltaBundle,
        frames: S,
        requests: mpsc::UnboundedSender<FileRequest>,
        store: LocalStore,
    ) -> Result<Self, Error>
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + Unpin + 'static,
    {
        let signals = Arc::new(SignalTable::new(bundle.output_queue.len()));
        let tracer = Arc::new(TraceRecorder::new(bundle.destination_images.clone()));
        let fs = Arc::new(ImageFs::new(
            &bundle,
            store.clone(),
            signals.clone(),
            requests,
            tracer.clone(),
        )?);

        let destination_images = bundle.destination_images.clone();
        let receiver = Receiver::new(&bundle, store.clone(), signals.clone());
        let task = tokio::spawn(async move {
            let stats = receiver.receive(frames).await?;
            record_complete(&store, &bundle).await?;
            Ok(stats)
        });

        Ok(Self {
            destination_images,
            fs,
            tracer,
            signals,
            receiver: Some(task),
        })
    }

    pub fn fs(&self) -> &Arc<ImageFs> {
        &self.fs
    }

    pub fn tracer(&self) -> &Arc<TraceRecorder> {
        &self.tracer
    }

    pub fn destination_images(&self) -> &[ImageRef] {
        &self.destination_images
    }

    /// Contents still in flight.
    pub fn pending(&self) -> usize {
        self.signals.pending()
    }

    /// Waits until the body has been received completely.
    pub async fn wait(&mut self) -> Result<ReceiveStats, Error> {
        let task = self
            .receiver
            .take()
            .ok_or_else(|| Error::InvalidRequest("session already awaited".into()))?;
        task.await?
    }

    /// Like [Session::wait], but gives up as soon as `stop` completes. The
    /// transfer is then torn down and every blocked reader released, so the
    /// caller can unmount right away. Returns `None` when stopped.
    pub async fn wait_until<F>(&mut self, stop: F) -> Result<Option<ReceiveStats>, Error>
    where
        F: Future<Output = ()>,
    {
        let mut task = self
            .receiver
            .take()
            .ok_or_else(|| Error::InvalidRequest("session already awaited".into()))?;

        tokio::select! {
            joined = &mut task => Ok(Some(joined??)),
            _ = stop => {
                task.abort();
                let aborted = self.signals.abort_pending();
                warn!(aborted, "transfer interrupted");
                Ok(None)
            }
        }
    }

    /// The mounts making up the active snapshot: an overlay whose only lower
    /// layer is the lazily populated tree at `lower`.
    pub fn mounts(&self, lower: &Path, upper: &Path, work: &Path) -> Vec<Mount> {
        vec![Mount {
            kind: "overlay".to_string(),
            source: "overlay".to_string(),
            options: vec![
                format!("lowerdir={}", lower.display()),
                format!("upperdir={}", upper.display()),
                format!("workdir={}", work.display()),
            ],
        }]
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
            let aborted = self.signals.abort_pending();
            if aborted > 0 {
                warn!(aborted, "session dropped while receiving");
            }
        }
    }
}

/// Remembers the destination as held locally, so it can serve as a base.
/// Content that was already held elsewhere is first placed under the
/// destination layers owning it, where a later delta will look for it.
async fn record_complete(store: &LocalStore, bundle: &DeltaBundle) -> Result<(), Error> {
    for held in bundle.held.iter() {
        let layer = bundle.destination.get(held.stack as usize).ok_or_else(|| {
            Error::metadata(held.digest.to_string(), "held content in unknown layer")
        })?;
        store
            .adopt_content(held.serial, layer.serial, &held.digest)
            .await?;
    }

    store.record_layers(&bundle.destination).await?;
    let serials: Vec<u64> = bundle.destination.iter().map(|l| l.serial).collect();
    for image in bundle.destination_images.iter() {
        store.record_image(image, &serials).await?;
    }
    Ok(())
}

use std::{num::NonZeroUsize, sync::Arc};

use bytes::Bytes;
use futures::{channel::mpsc as futures_mpsc, StreamExt};
use layerlift_delta::{
    fixtures::{LayerBlobBuilder, BINARY_CONTENTS, CONFIG_CONTENTS, LIBRARY_CONTENTS, README_CONTENTS},
    wire::{BodyFrame, FileRequest},
    DeltaBundle, Digest, Error, ImageRef, Resolution,
};
use layerlift_proxy::{
    file_requests::FileRequestQueue, metadata::MemoryMetadataStore, upstream::MemoryLayerSource,
    AppState,
};
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    fs::ImageFs,
    local_store::LocalStore,
    receiver::Receiver,
    signal::SignalTable,
    tracer::TraceRecorder,
    Session,
};

const DUPLICATE_CONTENTS: &[u8] = b"same bytes, two names\n";

struct Proxy {
    state: AppState,
    base: ImageRef,
    destination: ImageRef,
}

/// `app:1` is one layer; `app:2` adds a second one on top.
#[fixture]
async fn proxy() -> Proxy {
    let lower = LayerBlobBuilder::new()
        .dir("etc")
        .file("etc/motd", CONFIG_CONTENTS.clone())
        .dir("bin")
        .executable("bin/tool", BINARY_CONTENTS.clone())
        .symlink("bin/sh", "tool")
        .file("etc/empty", "")
        .build()
        .await
        .unwrap();
    let upper = LayerBlobBuilder::new()
        .dir("usr")
        .dir("usr/lib")
        .chunked_file("usr/lib/libx.so", LIBRARY_CONTENTS.clone(), 8)
        .dir("usr/share")
        .file("usr/share/README", README_CONTENTS.clone())
        .dir("opt")
        .file("opt/a", DUPLICATE_CONTENTS)
        .file("opt/b", DUPLICATE_CONTENTS)
        .build()
        .await
        .unwrap();

    let source = MemoryLayerSource::default();
    let base: ImageRef = "app:1".parse().unwrap();
    let destination: ImageRef = "app:2".parse().unwrap();
    source.add_image(base.clone(), vec![lower.clone()]);
    source.add_image(destination.clone(), vec![lower, upper]);

    Proxy {
        state: AppState::new(
            Arc::new(source),
            Arc::new(MemoryMetadataStore::default()),
            NonZeroUsize::new(4).unwrap(),
        ),
        base,
        destination,
    }
}

async fn delta(state: &AppState, from: &[ImageRef], to: &[ImageRef]) -> DeltaBundle {
    let base = state.catalog().load(from).await.unwrap();
    let destination = state.catalog().load(to).await.unwrap();
    destination.diff(&base).unwrap()
}

/// The body the proxy would stream, honoring the given requests.
async fn body(state: &AppState, bundle: &DeltaBundle, requests: &[FileRequest]) -> Vec<Bytes> {
    let prepared = state.builder().write_header(bundle).await.unwrap();
    let queue = FileRequestQueue::default();
    for r in requests {
        queue.push(*r);
    }

    let (mut tx, rx) = futures_mpsc::unbounded();
    state
        .builder()
        .write_body(bundle, &prepared, &queue, &mut tx)
        .await
        .unwrap();
    drop(tx);
    rx.collect().await
}

fn frames(body: Vec<Bytes>) -> impl futures::Stream<Item = Result<Bytes, Error>> + Unpin {
    futures::stream::iter(body.into_iter().map(Ok::<Bytes, Error>))
}

struct Mounted {
    fs: Arc<ImageFs>,
    signals: Arc<SignalTable>,
    tracer: Arc<TraceRecorder>,
    requests: mpsc::UnboundedReceiver<FileRequest>,
}

fn mount(bundle: &DeltaBundle, store: &LocalStore) -> Mounted {
    let signals = Arc::new(SignalTable::new(bundle.output_queue.len()));
    let tracer = Arc::new(TraceRecorder::new(bundle.destination_images.clone()));
    let (tx, requests) = mpsc::unbounded_channel();
    let fs = ImageFs::new(bundle, store.clone(), signals.clone(), tx, tracer.clone()).unwrap();

    Mounted {
        fs: Arc::new(fs),
        signals,
        tracer,
        requests,
    }
}

fn ino(fs: &ImageFs, path: &str) -> u64 {
    fs.tree()
        .get_by_path(path)
        .unwrap_or_else(|| panic!("{} must exist", path))
        .ino
}

async fn read_all(fs: &ImageFs, path: &str) -> Vec<u8> {
    let fh = fs.open(ino(fs, path)).await.expect("open must succeed");
    let buf = fs.read(fh, 0, 1 << 20).await.unwrap();
    fs.release(fh);
    buf
}

/// Runs a whole pull through a session, recording its images as held.
async fn pull(state: &AppState, store: &LocalStore, from: &[ImageRef], to: &[ImageRef]) -> DeltaBundle {
    let bundle = delta(state, from, to).await;
    let body = body(state, &bundle, &[]).await;

    let (tx, _requests) = mpsc::unbounded_channel();
    let mut session = Session::new(bundle.clone(), frames(body), tx, store.clone()).unwrap();
    session.wait().await.expect("pull must complete");
    bundle
}

fn resolution_of(bundle: &DeltaBundle, path: &str) -> Resolution {
    bundle
        .requested_files
        .iter()
        .find(|f| f.entry.path == path)
        .map(|f| f.resolution)
        .unwrap_or_else(|| panic!("{} must be requested", path))
}

async fn open_store() -> (TempDir, LocalStore) {
    let tmpdir = TempDir::new().unwrap();
    let store = LocalStore::open(tmpdir.path().join("root")).await.unwrap();
    (tmpdir, store)
}

#[rstest]
#[tokio::test]
async fn open_blocks_until_content_arrives(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;
    let mut m = mount(&bundle, &store);

    let open = tokio::spawn({
        let fs = m.fs.clone();
        let ino = ino(&fs, "/usr/share/README");
        async move { fs.open(ino).await }
    });

    // the open asks for its content before suspending
    let request = m.requests.recv().await.unwrap();
    let (_, record) = bundle
        .content_at(request.stack().unwrap(), request.offset)
        .unwrap();
    assert_eq!(Digest::of(&README_CONTENTS), record.digest);
    assert!(!open.is_finished());

    let body = body(&p.state, &bundle, &[request]).await;
    assert_eq!(request, BodyFrame::decode(body[0].clone()).unwrap().descriptor);

    let (tx, rx) = mpsc::channel(body.len());
    let receiver = Receiver::new(&bundle, store.clone(), m.signals.clone());
    let receiving = tokio::spawn(async move { receiver.receive(ReceiverStream::new(rx)).await });

    tx.send(Ok(body[0].clone())).await.unwrap();
    let fh = open.await.unwrap().expect("open must succeed");
    assert_eq!(README_CONTENTS.to_vec(), m.fs.read(fh, 0, 4096).await.unwrap());
    assert_eq!(b"world".to_vec(), m.fs.read(fh, 6, 5).await.unwrap());

    for frame in body.iter().skip(1) {
        tx.send(Ok(frame.clone())).await.unwrap();
    }
    drop(tx);

    let stats = receiving.await.unwrap().expect("body must be received");
    assert_eq!(bundle.output_queue.len(), stats.entries);
    assert_eq!(bundle.body_length, stats.bytes);
    assert!(m.requests.try_recv().is_err(), "exactly one urgent request");

    let trace = m.tracer.snapshot();
    assert_eq!(1, trace.entries.len());
    assert_eq!("/usr/share/README", trace.entries[0].path);
    assert!(trace.entries[0].requested_at < trace.entries[0].ready_at);
}

#[rstest]
#[tokio::test]
async fn received_files_match_their_layers(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;
    let mut m = mount(&bundle, &store);

    let receiver = Receiver::new(&bundle, store.clone(), m.signals.clone());
    receiver
        .receive(frames(body(&p.state, &bundle, &[]).await))
        .await
        .unwrap();

    assert_eq!(BINARY_CONTENTS.to_vec(), read_all(&m.fs, "/bin/tool").await);
    assert_eq!(LIBRARY_CONTENTS.to_vec(), read_all(&m.fs, "/usr/lib/libx.so").await);
    assert_eq!(Vec::<u8>::new(), read_all(&m.fs, "/etc/empty").await);
    assert!(m.requests.try_recv().is_err(), "nothing was waiting");

    m.fs.fsync(ino(&m.fs, "/bin/tool")).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn local_content_never_blocks(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;

    // materialise the base first
    let first = delta(&p.state, &[], &[p.base.clone()]).await;
    Receiver::new(&first, store.clone(), Arc::new(SignalTable::new(first.output_queue.len())))
        .receive(frames(body(&p.state, &first, &[]).await))
        .await
        .unwrap();

    let bundle = delta(&p.state, &[p.base.clone()], &[p.destination.clone()]).await;
    let mut m = mount(&bundle, &store);

    let motd = m.fs.tree().get_by_path("/etc/motd").unwrap();
    assert!(matches!(motd.file.resolution, Resolution::Local { .. }));

    // nothing of the body has arrived, yet local files open right away
    assert_eq!(CONFIG_CONTENTS.to_vec(), read_all(&m.fs, "/etc/motd").await);
    assert_eq!(BINARY_CONTENTS.to_vec(), read_all(&m.fs, "/bin/tool").await);
    assert!(m.requests.try_recv().is_err());
    assert_eq!(bundle.output_queue.len(), m.signals.pending());
}

#[rstest]
#[tokio::test]
async fn duplicate_waits_for_the_streamed_copy(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;
    let mut m = mount(&bundle, &store);

    let a = m.fs.tree().get_by_path("/opt/a").unwrap();
    let b = m.fs.tree().get_by_path("/opt/b").unwrap();
    let (payload, sibling) = match (a.file.resolution, b.file.resolution) {
        (Resolution::Payload { .. }, Resolution::Sibling { .. }) => ("/opt/a", "/opt/b"),
        (Resolution::Sibling { .. }, Resolution::Payload { .. }) => ("/opt/b", "/opt/a"),
        other => panic!("unexpected resolutions {:?}", other),
    };

    let open = tokio::spawn({
        let fs = m.fs.clone();
        let ino = ino(&fs, sibling);
        async move { fs.open(ino).await }
    });
    let request = m.requests.recv().await.unwrap();
    let (_, record) = bundle
        .content_at(request.stack().unwrap(), request.offset)
        .unwrap();
    assert_eq!(Digest::of(DUPLICATE_CONTENTS), record.digest);

    Receiver::new(&bundle, store.clone(), m.signals.clone())
        .receive(frames(body(&p.state, &bundle, &[request]).await))
        .await
        .unwrap();

    let fh = open.await.unwrap().unwrap();
    assert_eq!(DUPLICATE_CONTENTS.to_vec(), m.fs.read(fh, 0, 1024).await.unwrap());
    assert_eq!(DUPLICATE_CONTENTS.to_vec(), read_all(&m.fs, payload).await);
}

#[rstest]
#[tokio::test]
async fn early_end_aborts_waiters(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;
    let mut m = mount(&bundle, &store);

    let open = tokio::spawn({
        let fs = m.fs.clone();
        let ino = ino(&fs, "/usr/share/README");
        async move { fs.open(ino).await }
    });
    m.requests.recv().await.unwrap();

    // only the first scheduled entry makes it
    let body = body(&p.state, &bundle, &[]).await;
    let err = Receiver::new(&bundle, store.clone(), m.signals.clone())
        .receive(frames(body[..1].to_vec()))
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::Transport(_)));

    assert_eq!(
        Some(libc::ECONNABORTED),
        open.await.unwrap().unwrap_err().raw_os_error()
    );
    assert_eq!(0, m.signals.pending());
}

#[rstest]
#[tokio::test]
async fn corrupted_content_is_refused(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;
    let m = mount(&bundle, &store);

    let mut body = body(&p.state, &bundle, &[]).await;
    let frame = BodyFrame::decode(body[0].clone()).unwrap();
    let mut payload = frame.payload.to_vec();
    // past the member header, into the deflate data
    payload[12] ^= 0xff;
    body[0] = BodyFrame {
        descriptor: frame.descriptor,
        payload: payload.into(),
    }
    .encode();

    let err = Receiver::new(&bundle, store.clone(), m.signals.clone())
        .receive(frames(body))
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(0, m.signals.pending());

    let record = &bundle.output_queue[0];
    let serial = bundle.destination[record.stack as usize].serial;
    assert!(!store.has_content(serial, &record.digest).await);
}

#[rstest]
#[tokio::test]
async fn session_records_received_images(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;
    let body = body(&p.state, &bundle, &[]).await;

    let (tx, _requests) = mpsc::unbounded_channel();
    let mut session = Session::new(bundle, frames(body), tx, store.clone()).unwrap();
    let stats = session.wait().await.unwrap();
    assert!(stats.entries > 0);
    assert_eq!(0, session.pending());
    assert!(session.wait().await.is_err(), "only once");

    assert_eq!(vec![p.destination.clone()], store.images().await.unwrap());
    assert_eq!(
        Some(vec![1, 2]),
        store.image_serials(&p.destination).await.unwrap()
    );

    let lower = tmpdir.path().join("mnt");
    let mounts = session.mounts(&lower, &tmpdir.path().join("upper"), &tmpdir.path().join("work"));
    assert_eq!(1, mounts.len());
    assert_eq!("overlay", mounts[0].kind);
    assert_eq!(format!("lowerdir={}", lower.display()), mounts[0].options[0]);
}

#[tokio::test]
async fn held_content_carries_over_to_later_pulls() {
    let l1 = LayerBlobBuilder::new()
        .dir("opt")
        .file("opt/a", DUPLICATE_CONTENTS)
        .build()
        .await
        .unwrap();
    let l3 = LayerBlobBuilder::new()
        .dir("opt")
        .file("opt/b", DUPLICATE_CONTENTS)
        .build()
        .await
        .unwrap();
    let l4 = LayerBlobBuilder::new()
        .dir("srv")
        .file("srv/c", README_CONTENTS.clone())
        .build()
        .await
        .unwrap();

    let source = MemoryLayerSource::default();
    let a: ImageRef = "a:1".parse().unwrap();
    let b: ImageRef = "b:1".parse().unwrap();
    let c: ImageRef = "c:1".parse().unwrap();
    source.add_image(a.clone(), vec![l1]);
    source.add_image(b.clone(), vec![l3.clone()]);
    source.add_image(c.clone(), vec![l3, l4]);
    let state = AppState::new(
        Arc::new(source),
        Arc::new(MemoryMetadataStore::default()),
        NonZeroUsize::new(4).unwrap(),
    );
    let (_tmpdir, store) = open_store().await;

    let first = pull(&state, &store, &[], &[a.clone()]).await;
    let second = pull(&state, &store, &[a], &[b.clone()]).await;
    assert_eq!(
        Resolution::Local {
            serial: first.destination[0].serial
        },
        resolution_of(&second, "/opt/b")
    );
    assert!(second.output_queue.is_empty());

    // b is now a base of its own, its content placed under its own layer
    let third = delta(&state, &[b], &[c]).await;
    assert_eq!(
        Resolution::Local {
            serial: second.destination[0].serial
        },
        resolution_of(&third, "/opt/b")
    );

    let m = mount(&third, &store);
    assert_eq!(DUPLICATE_CONTENTS.to_vec(), read_all(&m.fs, "/opt/b").await);
}

#[rstest]
#[tokio::test]
async fn interrupted_session_releases_readers(#[future] proxy: Proxy) {
    let p = proxy.await;
    let (_tmpdir, store) = open_store().await;
    let bundle = delta(&p.state, &[], &[p.destination.clone()]).await;

    // a body that never ends
    let (_frames_tx, frames_rx) = mpsc::channel::<Result<Bytes, Error>>(1);
    let (tx, mut requests) = mpsc::unbounded_channel();
    let mut session =
        Session::new(bundle, ReceiverStream::new(frames_rx), tx, store.clone()).unwrap();

    let open = tokio::spawn({
        let fs = session.fs().clone();
        let ino = ino(&fs, "/usr/share/README");
        async move { fs.open(ino).await }
    });
    requests.recv().await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    stop_tx.send(()).unwrap();
    let received = session
        .wait_until(async {
            stop_rx.await.ok();
        })
        .await
        .unwrap();
    assert_eq!(None, received);

    assert_eq!(
        Some(libc::ECONNABORTED),
        open.await.unwrap().unwrap_err().raw_os_error()
    );
    assert_eq!(0, session.pending());
    assert!(store.images().await.unwrap().is_empty());
}

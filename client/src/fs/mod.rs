mod file_attr;
mod tree;

#[cfg(feature = "fuse")]
pub mod fuse;


use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use layerlift_delta::{
    toc::EntryKind, wire::FileRequest, ContentRecord, DeltaBundle, Digest, Error, Layer,
    Resolution,
};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
};
use tracing::{debug, instrument, warn};

pub use self::file_attr::FileAttr;
pub use self::tree::{Node, Tree, ROOT_INO};
use self::file_attr::{gen_file_attr, type_bits};
use crate::{
    local_store::LocalStore,
    signal::{Readiness, ReadySignal, SignalTable},
    tracer::TraceRecorder,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    /// Offset to continue listing from.
    pub offset: u64,
    pub type_: u32,
    pub name: String,
}

/// Where the bytes of a node come from.
enum Backing<'a> {
    /// On disk already.
    Present(PathBuf),
    /// Will be on disk once the queue entry arrives.
    Arriving {
        path: PathBuf,
        record: &'a ContentRecord,
        signal: &'a ReadySignal,
    },
}

/// A read-only view of a delta's destination namespace. The whole tree is
/// known from the header; file contents appear as the stream delivers them.
/// Opening a file whose bytes are still in flight suspends the caller until
/// they arrive, asking the proxy to send them first.
pub struct ImageFs {
    tree: Tree,
    store: LocalStore,
    destination: Vec<Layer>,
    queue: Vec<ContentRecord>,
    /// Queue position of every streamed digest.
    by_digest: HashMap<Digest, u32>,
    signals: Arc<SignalTable>,
    requests: mpsc::UnboundedSender<FileRequest>,
    tracer: Arc<TraceRecorder>,

    /// This holds all open file handles
    file_handles: RwLock<HashMap<u64, Arc<tokio::sync::Mutex<tokio::fs::File>>>>,
    next_file_handle: AtomicU64,

    #[cfg(feature = "fuse")]
    tokio_handle: tokio::runtime::Handle,
}

impl ImageFs {
    pub fn new(
        bundle: &DeltaBundle,
        store: LocalStore,
        signals: Arc<SignalTable>,
        requests: mpsc::UnboundedSender<FileRequest>,
        tracer: Arc<TraceRecorder>,
    ) -> Result<Self, Error> {
        if signals.len() != bundle.output_queue.len() {
            return Err(Error::Protocol(format!(
                "{} signals for {} queued contents",
                signals.len(),
                bundle.output_queue.len()
            )));
        }

        Ok(Self {
            tree: Tree::build(&bundle.requested_files)?,
            store,
            destination: bundle.destination.clone(),
            queue: bundle.output_queue.clone(),
            by_digest: bundle
                .output_queue
                .iter()
                .enumerate()
                .map(|(order, r)| (r.digest, order as u32))
                .collect(),
            signals,
            requests,
            tracer,
            file_handles: RwLock::new(Default::default()),
            next_file_handle: AtomicU64::new(1),
            #[cfg(feature = "fuse")]
            tokio_handle: tokio::runtime::Handle::current(),
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    fn node(&self, ino: u64) -> io::Result<&Node> {
        self.tree
            .get(ino)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn serial(&self, stack: u32) -> io::Result<u64> {
        self.destination
            .get(stack as usize)
            .map(|l| l.serial)
            .ok_or_else(|| no_such_content(format!("destination stack {}", stack)))
    }

    /// Classifies a node into its content source.
    fn backing(&self, node: &Node) -> io::Result<Backing<'_>> {
        let entry = node.entry();
        match entry.kind {
            EntryKind::Dir => return Err(io::Error::from_raw_os_error(libc::EISDIR)),
            EntryKind::Reg | EntryKind::Hardlink => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }

        if !entry.has_content() {
            return Ok(Backing::Present(self.store.empty_path()));
        }
        let digest = entry
            .digest
            .ok_or_else(|| no_such_content(node.path().to_string()))?;

        let order = match node.file.resolution {
            Resolution::Local { serial } => {
                return Ok(Backing::Present(self.store.content_path(serial, &digest)));
            }
            Resolution::Payload { order } => order,
            // Same bytes as a streamed entry, materialised for that entry's layer.
            Resolution::Sibling { .. } => *self
                .by_digest
                .get(&digest)
                .ok_or_else(|| no_such_content(node.path().to_string()))?,
        };

        let record = self
            .queue
            .get(order as usize)
            .ok_or_else(|| no_such_content(format!("queue position {}", order)))?;
        let signal = self
            .signals
            .get(order)
            .ok_or_else(|| no_such_content(format!("queue position {}", order)))?;

        Ok(Backing::Arriving {
            path: self.store.content_path(self.serial(record.stack)?, &digest),
            record,
            signal,
        })
    }

    /// Returns the local path holding a node's bytes, waiting for them if
    /// they are still in flight.
    async fn resolve(&self, node: &Node) -> io::Result<PathBuf> {
        match self.backing(node)? {
            Backing::Present(path) => {
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    warn!(path=?path, "local content missing");
                    return Err(no_such_content(node.path().to_string()));
                }
                Ok(path)
            }
            Backing::Arriving {
                path,
                record,
                signal,
            } => {
                if signal.state() == Readiness::Pending && signal.mark_requested() {
                    if let Some(request) = FileRequest::for_content(record) {
                        debug!(content.digest = %record.digest, "requesting urgently");
                        if self.requests.send(request).is_err() {
                            debug!("request channel closed");
                        }
                    }
                }

                signal.wait().await.map_err(|e| {
                    warn!(err=%e, path = node.path(), "content never arrived");
                    io::Error::from_raw_os_error(libc::ECONNABORTED)
                })?;
                Ok(path)
            }
        }
    }

    #[instrument(skip(self), err)]
    pub fn lookup(&self, parent: u64, name: &str) -> io::Result<FileAttr> {
        let parent = self.node(parent)?;
        if !parent.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }

        self.tree
            .child(parent, name)
            .map(gen_file_attr)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    pub fn getattr(&self, ino: u64) -> io::Result<FileAttr> {
        self.node(ino).map(gen_file_attr)
    }

    pub fn getxattr(&self, ino: u64, name: &str) -> io::Result<Vec<u8>> {
        self.node(ino)?
            .entry()
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))
    }

    pub fn listxattr(&self, ino: u64) -> io::Result<Vec<String>> {
        Ok(self.node(ino)?.entry().xattrs.keys().cloned().collect())
    }

    /// Lists a directory starting at `offset`.
    pub fn readdir(&self, ino: u64, offset: u64) -> io::Result<Vec<DirEntry>> {
        let node = self.node(ino)?;
        if !node.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }

        Ok(node
            .children
            .iter()
            .skip(offset as usize)
            .enumerate()
            .filter_map(|(i, ino)| self.tree.get(*ino).map(|child| (i, child)))
            .map(|(i, child)| DirEntry {
                ino: child.ino,
                offset: offset + i as u64 + 1,
                type_: type_bits(child.entry().kind),
                name: child.name().to_string(),
            })
            .collect())
    }

    pub fn readlink(&self, ino: u64) -> io::Result<Vec<u8>> {
        let entry = self.node(ino)?.entry();
        match entry.kind {
            EntryKind::Symlink => Ok(entry.link_target.as_bytes().to_vec()),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    /// Opens a file, waiting for its bytes if needed, and records the access.
    #[instrument(skip(self), err)]
    pub async fn open(&self, ino: u64) -> io::Result<u64> {
        let node = self.node(ino)?;

        let requested_at = Utc::now();
        let path = self.resolve(node).await?;
        let ready_at = Utc::now();
        self.tracer.record(node.path(), requested_at, ready_at);

        let file = tokio::fs::File::open(&path).await?;

        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        debug!("add file handle {}", fh);
        self.file_handles
            .write()
            .insert(fh, Arc::new(tokio::sync::Mutex::new(file)));

        Ok(fh)
    }

    /// Reads up to `size` bytes at `offset`; shorter only at EOF.
    pub async fn read(&self, handle: u64, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let file = match self.file_handles.read().get(&handle) {
            Some(file) => file.clone(),
            None => {
                warn!("file handle {} unknown", handle);
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
        };

        let mut file = file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buf: Vec<u8> = Vec::with_capacity(size as usize);
        (&mut *file).take(size as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub fn release(&self, handle: u64) {
        if self.file_handles.write().remove(&handle).is_none() {
            debug!("file_handle {} not found", handle);
        }
    }

    /// Waits like open does, then flushes the materialised bytes.
    #[instrument(skip(self), err)]
    pub async fn fsync(&self, ino: u64) -> io::Result<()> {
        let node = self.node(ino)?;
        let path = self.resolve(node).await?;

        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                if let Err(e) = file.sync_all().await {
                    debug!(err=%e, "best-effort sync failed");
                }
            }
            Err(e) => debug!(err=%e, "best-effort sync failed"),
        }
        Ok(())
    }
}

fn no_such_content(what: String) -> io::Error {
    warn!(err = %Error::Resolution(what), "unresolvable node");
    io::Error::from_raw_os_error(libc::ENOENT)
}

use std::{ffi::CStr, io, path::Path, sync::Arc, time::Duration};

use fuse_backend_rs::{
    abi::fuse_abi::stat64,
    api::filesystem::{
        Context, DirEntry, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply,
        OpenOptions, ZeroCopyWriter,
    },
    transport::FuseSession,
};
use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{debug, error, instrument};

use super::ImageFs;

/// The namespace never changes while mounted.
const TTL: Duration = Duration::MAX;

fn name_str(name: &CStr) -> io::Result<&str> {
    name.to_str()
        .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))
}

impl FileSystem for ImageFs {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let attr: fuse_backend_rs::abi::fuse_abi::Attr = ImageFs::getattr(self, inode)?.into();
        Ok((attr.into(), TTL))
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let attr = ImageFs::lookup(self, parent, name_str(name)?)?;
        let fuse_attr: fuse_backend_rs::abi::fuse_abi::Attr = attr.into();

        Ok(Entry {
            inode: attr.ino,
            attr: fuse_attr.into(),
            attr_timeout: TTL,
            entry_timeout: TTL,
            ..Default::default()
        })
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.name = ?name))]
    fn getxattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        name: &CStr,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        let name = name
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::ENODATA))?;
        let value = ImageFs::getxattr(self, inode, name)?;

        if size == 0 {
            return Ok(GetxattrReply::Count(value.len() as u32));
        }
        if value.len() > size as usize {
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }
        Ok(GetxattrReply::Value(value))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn listxattr(&self, _ctx: &Context, inode: Self::Inode, size: u32) -> io::Result<ListxattrReply> {
        // NUL-separated names
        let mut names = vec![];
        for name in ImageFs::listxattr(self, inode)? {
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        if size == 0 {
            return Ok(ListxattrReply::Count(names.len() as u32));
        }
        if names.len() > size as usize {
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }
        Ok(ListxattrReply::Names(names))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        for entry in ImageFs::readdir(self, inode, offset)? {
            let written = add_entry(DirEntry {
                ino: entry.ino,
                offset: entry.offset,
                type_: entry.type_,
                name: entry.name.as_bytes(),
            })?;
            // If the buffer is full, add_entry will return `Ok(0)`.
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        ImageFs::readlink(self, inode)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions, Option<u32>)> {
        // Blocks this server thread until the content is there; other
        // threads keep serving.
        let fh = self.tokio_handle.block_on(ImageFs::open(self, inode))?;
        Ok((Some(fh), OpenOptions::KEEP_CACHE, None))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        ImageFs::release(self, handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let buf = self
            .tokio_handle
            .block_on(ImageFs::read(self, handle, offset, size))?;
        w.write(&buf)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn fsync(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _datasync: bool,
        _handle: Self::Handle,
    ) -> io::Result<()> {
        self.tokio_handle.block_on(ImageFs::fsync(self, inode))
    }
}

struct FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    server: Arc<fuse_backend_rs::api::server::Server<Arc<FS>>>,
    channel: fuse_backend_rs::transport::FuseChannel,
}

#[cfg(target_os = "macos")]
const BADFD: libc::c_int = libc::EBADF;
#[cfg(target_os = "linux")]
const BADFD: libc::c_int = libc::EBADFD;

impl<FS> FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    fn start(&mut self) -> io::Result<()> {
        while let Some((reader, writer)) = self
            .channel
            .get_request()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?
        {
            if let Err(e) = self
                .server
                .handle_message(reader, writer.into(), None, None)
            {
                match e {
                    // This indicates the session has been shut down.
                    fuse_backend_rs::Error::EncodeMessage(e) if e.raw_os_error() == Some(BADFD) => {
                        break;
                    }
                    error => {
                        error!(?error, "failed to handle fuse request");
                        continue;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Serves an [ImageFs] at a mountpoint from a pool of threads. Each blocked
/// open occupies one thread, so the pool bounds how many opens may wait for
/// content at once.
#[derive(Clone)]
pub struct FuseDaemon {
    session: Arc<Mutex<FuseSession>>,
    threads: Arc<ThreadPool>,
}

impl FuseDaemon {
    #[instrument(skip(fs, mountpoint), fields(mountpoint=?mountpoint), err)]
    pub fn new<P>(
        fs: Arc<ImageFs>,
        mountpoint: P,
        num_threads: usize,
        allow_other: bool,
    ) -> Result<Self, io::Error>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        let server = Arc::new(fuse_backend_rs::api::server::Server::new(fs));

        let mut session = FuseSession::new(mountpoint.as_ref(), "layerlift", "", true)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        session
            .mount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let threads = threadpool::Builder::new()
            .num_threads(num_threads)
            .thread_name("fuse_server".to_string())
            .build();

        for _ in 0..num_threads {
            let mut server = FuseServer {
                server: server.clone(),
                channel: session
                    .new_channel()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
            };

            threads.execute(move || {
                let _ = server.start();
            });
        }

        debug!(num_threads, "mounted");
        Ok(FuseDaemon {
            session: Arc::new(Mutex::new(session)),
            threads: Arc::new(threads),
        })
    }

    /// Waits for all threads to finish.
    #[instrument(skip_all)]
    pub fn wait(&self) {
        self.threads.join()
    }

    /// Send the unmount command, and waits for all threads to finish.
    #[instrument(skip_all, err)]
    pub fn unmount(&self) -> Result<(), io::Error> {
        self.session
            .lock()
            .umount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        self.wait();
        Ok(())
    }
}

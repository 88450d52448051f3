#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use layerlift_delta::toc::EntryKind;

use super::tree::Node;

const BLOCK_SIZE: u32 = 512;

/// What getattr and lookup report for a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub mtime: u64,
    pub mtimensec: u32,
}

pub fn type_bits(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Dir => libc::S_IFDIR as u32,
        EntryKind::Reg | EntryKind::Hardlink => libc::S_IFREG as u32,
        EntryKind::Symlink => libc::S_IFLNK as u32,
        EntryKind::Char => libc::S_IFCHR as u32,
        EntryKind::Block => libc::S_IFBLK as u32,
        EntryKind::Fifo => libc::S_IFIFO as u32,
    }
}

pub fn gen_file_attr(node: &Node) -> FileAttr {
    let entry = node.entry();
    let size = match entry.kind {
        EntryKind::Reg | EntryKind::Hardlink => entry.size,
        EntryKind::Symlink => entry.link_target.len() as u64,
        _ => 0,
    };
    let (mtime, mtimensec) = entry
        .mod_time
        .map(|t| (t.timestamp().max(0) as u64, t.timestamp_subsec_nanos()))
        .unwrap_or_default();

    FileAttr {
        ino: node.ino,
        size,
        blocks: size.div_ceil(BLOCK_SIZE as u64),
        mode: type_bits(entry.kind) | (entry.mode & 0o7777),
        nlink: match entry.kind {
            EntryKind::Dir => 2,
            _ => entry.num_link.max(1),
        },
        uid: entry.uid,
        gid: entry.gid,
        rdev: ((entry.dev_major & 0xfff) << 8) | (entry.dev_minor & 0xff),
        mtime,
        mtimensec,
    }
}

#[cfg(feature = "fuse")]
impl From<FileAttr> for fuse_backend_rs::abi::fuse_abi::Attr {
    fn from(value: FileAttr) -> Self {
        fuse_backend_rs::abi::fuse_abi::Attr {
            ino: value.ino,
            size: value.size,
            blksize: BLOCK_SIZE,
            blocks: value.blocks,
            mode: value.mode,
            atime: value.mtime,
            mtime: value.mtime,
            ctime: value.mtime,
            atimensec: value.mtimensec,
            mtimensec: value.mtimensec,
            ctimensec: value.mtimensec,
            nlink: value.nlink,
            uid: value.uid,
            gid: value.gid,
            rdev: value.rdev,
            flags: 0,
            #[cfg(target_os = "macos")]
            crtime: 0,
            #[cfg(target_os = "macos")]
            crtimensec: 0,
            #[cfg(target_os = "macos")]
            padding: 0,
        }
    }
}

//! Per-layer tables of contents.
//!
//! A layer blob carries, next to its compressed files, an index of every
//! entry with its metadata and the compressed location of its bytes. This is
//! all that is needed to compute a delta without reading file content.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use tracing::instrument;

use crate::{Digest, Error};

mod footer;
mod index;

pub use footer::{encode_footer, parse_footer, FOOTER_SIZE, LEGACY_FOOTER_SIZE};
pub use index::{decode_index, encode_index, RawEntry, RawToc, TOC_TAR_NAME};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    Reg,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
}

/// Maps a contiguous range of a file's bytes to the gzip member holding them
/// inside a layer blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Offset of the gzip member in the blob.
    pub offset: u64,
    /// Offset of this chunk within the uncompressed file.
    pub chunk_offset: u64,
    pub chunk_size: u64,
    pub compressed_size: u64,
}

/// One file, directory, link or device of a layer.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Absolute path, `/` for the root.
    pub path: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    /// Symlink target as written, or the absolute path a hardlink points to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_target: String,
    #[serde_as(as = "BTreeMap<_, Base64>")]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub dev_major: u32,
    #[serde(default)]
    pub dev_minor: u32,
    #[serde(default)]
    pub num_link: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<FileChunk>,
}

/// A whiteout marker found in a layer.
#[derive(Debug, PartialEq, Eq)]
pub enum Whiteout {
    /// Removes the path and its subtree from lower layers.
    Remove(String),
    /// Hides all lower-layer children of the directory.
    Opaque(String),
}

impl TocEntry {
    /// A directory synthesized for a path that only appears as an ancestor.
    pub fn implicit_dir(path: impl Into<String>) -> Self {
        TocEntry {
            path: path.into(),
            kind: EntryKind::Dir,
            size: 0,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mod_time: None,
            link_target: String::new(),
            xattrs: BTreeMap::new(),
            dev_major: 0,
            dev_minor: 0,
            num_link: 0,
            digest: None,
            chunks: vec![],
        }
    }

    pub fn name(&self) -> &str {
        file_name(&self.path)
    }

    /// Whether this entry is a whiteout marker rather than a real file.
    pub fn whiteout(&self) -> Option<Whiteout> {
        let name = self.name();
        let parent = parent_path(&self.path)?;
        if name == OPAQUE_WHITEOUT {
            Some(Whiteout::Opaque(parent.to_string()))
        } else {
            name.strip_prefix(WHITEOUT_PREFIX)
                .map(|target| Whiteout::Remove(join_path(parent, target)))
        }
    }

    /// Whether the entry's bytes need to be carried by a layer window.
    pub fn has_content(&self) -> bool {
        self.kind == EntryKind::Reg && self.size > 0
    }

    /// Range of the layer blob holding all of this entry's chunks.
    pub fn compressed_range(&self) -> Option<(u64, u64)> {
        let first = self.chunks.first()?;
        let last = self.chunks.last()?;
        Some((first.offset, last.offset + last.compressed_size - first.offset))
    }
}

/// The normalized table of contents of one layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    pub entries: Vec<TocEntry>,
    /// Where the TOC region begins; no content lives past this point.
    pub toc_offset: u64,
}

impl Toc {
    /// Normalizes a raw index: absolute paths, chunk entries folded into
    /// their file, and compressed sizes filled in from the layout.
    #[instrument(skip_all, fields(toc.offset = toc_offset, toc.entries = raw.entries.len()), err)]
    pub fn from_raw(raw: RawToc, toc_offset: u64) -> Result<Self, Error> {
        let mut entries: Vec<TocEntry> = Vec::with_capacity(raw.entries.len());

        for e in raw.entries {
            let path = normalize_path(&e.name)?;

            let kind = match e.entry_type.as_str() {
                "chunk" => {
                    let file = entries
                        .last_mut()
                        .filter(|f| f.kind == EntryKind::Reg && f.path == path)
                        .ok_or_else(|| Error::metadata(&path, "chunk without preceding file"))?;
                    file.chunks.push(FileChunk {
                        offset: e.offset,
                        chunk_offset: e.chunk_offset,
                        chunk_size: e.chunk_size,
                        compressed_size: 0,
                    });
                    continue;
                }
                "dir" => EntryKind::Dir,
                "reg" => EntryKind::Reg,
                "symlink" => EntryKind::Symlink,
                "hardlink" => EntryKind::Hardlink,
                "char" => EntryKind::Char,
                "block" => EntryKind::Block,
                "fifo" => EntryKind::Fifo,
                other => {
                    return Err(Error::metadata(
                        &path,
                        format!("unknown entry type {:?}", other),
                    ))
                }
            };

            let digest = if e.digest.is_empty() {
                None
            } else {
                Some(
                    e.digest
                        .parse::<Digest>()
                        .map_err(|err| Error::metadata(&path, err.to_string()))?,
                )
            };

            let link_target = match kind {
                EntryKind::Hardlink => normalize_path(&e.link_name)?,
                _ => e.link_name,
            };

            let mut chunks = vec![];
            if kind == EntryKind::Reg && e.size > 0 {
                chunks.push(FileChunk {
                    offset: e.offset,
                    chunk_offset: 0,
                    chunk_size: if e.chunk_size > 0 { e.chunk_size } else { e.size },
                    compressed_size: 0,
                });
            }

            entries.push(TocEntry {
                path,
                kind,
                size: e.size,
                mode: e.mode,
                uid: e.uid,
                gid: e.gid,
                mod_time: e.mod_time,
                link_target,
                xattrs: e.xattrs,
                dev_major: e.dev_major,
                dev_minor: e.dev_minor,
                num_link: e.num_link,
                digest,
                chunks,
            });
        }

        // Every gzip member ends where the next one (or the TOC) begins.
        let mut boundaries: Vec<u64> = entries
            .iter()
            .flat_map(|e| e.chunks.iter().map(|c| c.offset))
            .collect();
        boundaries.push(toc_offset);
        boundaries.sort_unstable();
        boundaries.dedup();

        for e in entries.iter_mut() {
            for c in e.chunks.iter_mut() {
                if c.offset == 0 || c.offset >= toc_offset {
                    return Err(Error::metadata(
                        &e.path,
                        format!("chunk offset {} outside of content region", c.offset),
                    ));
                }
                let next = boundaries.partition_point(|b| *b <= c.offset);
                // toc_offset is always a boundary above c.offset.
                c.compressed_size = boundaries[next] - c.offset;
            }
        }

        Ok(Toc {
            entries,
            toc_offset,
        })
    }

    /// Parses a TOC from an entire layer blob.
    pub async fn from_blob(blob: &[u8]) -> Result<Self, Error> {
        let (toc_offset, footer_size) = parse_footer(blob)?;
        let end = blob.len().saturating_sub(footer_size);
        let region = blob
            .get(toc_offset as usize..end)
            .ok_or_else(|| Error::metadata("footer", "TOC offset past end of blob"))?;

        Toc::from_raw(decode_index(region).await?, toc_offset)
    }
}

/// Turns a TOC name (`./usr/bin/`, `usr/bin`, ...) into an absolute path.
pub fn normalize_path(name: &str) -> Result<String, Error> {
    let mut out = String::new();
    for component in name.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(Error::metadata(name, "path escapes the layer root")),
            c => {
                out.push('/');
                out.push_str(c);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Parent of an absolute path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether `path` is `ancestor` itself or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

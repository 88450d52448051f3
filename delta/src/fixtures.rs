//! Builders for eStargz-shaped layer blobs and some well-known contents.

use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use lazy_static::lazy_static;
use tokio::io::AsyncWriteExt;

use crate::{
    toc::{encode_footer, encode_index, RawEntry, RawToc},
    Digest, Error, Layer,
};

lazy_static! {
    pub static ref BINARY_CONTENTS: Bytes = Bytes::from(
        (0..8192u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect::<Vec<_>>()
    );
    pub static ref CONFIG_CONTENTS: Bytes = Bytes::from_static(b"listen 0.0.0.0:6379\nsave 60 1\n");
    pub static ref LIBRARY_CONTENTS: Bytes = Bytes::from_static(b"\x7fELF not really a library\n");
    pub static ref README_CONTENTS: Bytes = Bytes::from_static(b"hello world\n");
    pub static ref BINARY_DIGEST: Digest = Digest::of(&BINARY_CONTENTS);
    pub static ref CONFIG_DIGEST: Digest = Digest::of(&CONFIG_CONTENTS);
    pub static ref LIBRARY_DIGEST: Digest = Digest::of(&LIBRARY_CONTENTS);
}

enum FixtureEntry {
    Dir(String),
    File {
        name: String,
        contents: Bytes,
        mode: u32,
        chunk_size: Option<usize>,
    },
    Symlink(String, String),
    Hardlink(String, String),
    Marker(String),
}

/// Assembles a layer blob the way eStargz writers lay it out: one gzip
/// member per file chunk, then the gzip'd TOC, then the footer.
#[derive(Default)]
pub struct LayerBlobBuilder {
    entries: Vec<FixtureEntry>,
}

impl LayerBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names are relative to the layer root, e.g. `usr/bin`.
    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push(FixtureEntry::Dir(name.to_string()));
        self
    }

    pub fn file(mut self, name: &str, contents: impl Into<Bytes>) -> Self {
        self.entries.push(FixtureEntry::File {
            name: name.to_string(),
            contents: contents.into(),
            mode: 0o644,
            chunk_size: None,
        });
        self
    }

    pub fn executable(mut self, name: &str, contents: impl Into<Bytes>) -> Self {
        self.entries.push(FixtureEntry::File {
            name: name.to_string(),
            contents: contents.into(),
            mode: 0o755,
            chunk_size: None,
        });
        self
    }

    /// A file split into gzip members of `chunk_size` uncompressed bytes.
    pub fn chunked_file(mut self, name: &str, contents: impl Into<Bytes>, chunk_size: usize) -> Self {
        self.entries.push(FixtureEntry::File {
            name: name.to_string(),
            contents: contents.into(),
            mode: 0o644,
            chunk_size: Some(chunk_size.max(1)),
        });
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.entries
            .push(FixtureEntry::Symlink(name.to_string(), target.to_string()));
        self
    }

    pub fn hardlink(mut self, name: &str, target: &str) -> Self {
        self.entries
            .push(FixtureEntry::Hardlink(name.to_string(), target.to_string()));
        self
    }

    /// Deletes `name` (and its subtree) from the layers below.
    pub fn whiteout(mut self, name: &str) -> Self {
        let (dir, base) = match name.rsplit_once('/') {
            Some((dir, base)) => (format!("{}/", dir), base),
            None => (String::new(), name),
        };
        self.entries
            .push(FixtureEntry::Marker(format!("{}.wh.{}", dir, base)));
        self
    }

    /// Hides everything the layers below put into `dir`.
    pub fn opaque(mut self, dir: &str) -> Self {
        self.entries
            .push(FixtureEntry::Marker(format!("{}/.wh..wh..opq", dir)));
        self
    }

    pub async fn build(self) -> Result<Bytes, Error> {
        // Stands in for the leading tar header member; keeps content offsets
        // away from zero.
        let mut blob = gzip(&[0u8; 512]).await?;
        let mut raw = vec![];

        for e in self.entries {
            match e {
                FixtureEntry::Dir(name) => raw.push(RawEntry {
                    name: format!("{}/", name),
                    entry_type: "dir".into(),
                    mode: 0o755,
                    ..Default::default()
                }),
                FixtureEntry::File {
                    name,
                    contents,
                    mode,
                    chunk_size,
                } => {
                    let mut file = RawEntry {
                        name: name.clone(),
                        entry_type: "reg".into(),
                        size: contents.len() as u64,
                        mode,
                        num_link: 1,
                        ..Default::default()
                    };
                    if contents.is_empty() {
                        raw.push(file);
                        continue;
                    }
                    file.digest = Digest::of(&contents).to_string();

                    let chunk_size = chunk_size.unwrap_or(contents.len());
                    for (i, chunk) in contents.chunks(chunk_size).enumerate() {
                        let offset = blob.len() as u64;
                        blob.extend_from_slice(&gzip(chunk).await?);
                        let chunk_offset = (i * chunk_size) as u64;
                        if i == 0 {
                            file.offset = offset;
                            if chunk_size < contents.len() {
                                file.chunk_size = chunk.len() as u64;
                            }
                            raw.push(file.clone());
                        } else {
                            raw.push(RawEntry {
                                name: name.clone(),
                                entry_type: "chunk".into(),
                                offset,
                                chunk_offset,
                                chunk_size: chunk.len() as u64,
                                ..Default::default()
                            });
                        }
                    }
                }
                FixtureEntry::Symlink(name, target) => raw.push(RawEntry {
                    name,
                    entry_type: "symlink".into(),
                    link_name: target,
                    mode: 0o777,
                    ..Default::default()
                }),
                FixtureEntry::Hardlink(name, target) => raw.push(RawEntry {
                    name,
                    entry_type: "hardlink".into(),
                    link_name: target,
                    ..Default::default()
                }),
                FixtureEntry::Marker(name) => raw.push(RawEntry {
                    name,
                    entry_type: "reg".into(),
                    ..Default::default()
                }),
            }
        }

        let toc_offset = blob.len() as u64;
        blob.extend_from_slice(
            &encode_index(&RawToc {
                version: 1,
                entries: raw,
            })
            .await?,
        );
        blob.extend_from_slice(&encode_footer(toc_offset));

        Ok(blob.into())
    }
}

/// A layer record for a fixture blob.
pub fn layer_for(blob: &[u8], serial: u64, repository: &str) -> Layer {
    Layer {
        digest: Digest::of(blob),
        size: blob.len() as u64,
        serial,
        repository: repository.to_string(),
    }
}

async fn gzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

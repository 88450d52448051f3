//! Framing of the delta channel.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{bundle::ContentRecord, Error};

/// Response header announcing the byte length of the compressed header document.
pub const HEADER_SIZE_HEADER: &str = "layerlift-header-size";
/// Response header announcing header size plus body length.
pub const PAYLOAD_SIZE_HEADER: &str = "layerlift-payload-size";
pub const VERSION_HEADER: &str = "layerlift-version";

pub const PROTOCOL_VERSION: &str = concat!("layerlift/", env!("CARGO_PKG_VERSION"));

pub const FILE_REQUEST_LEN: usize = 16;

/// A demand for one compressed range of a destination layer, sent by the
/// client to move it ahead of the default order. The same layout prefixes
/// every body frame sent by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileRequest {
    /// Stack index of the destination layer.
    pub source: i32,
    pub offset: u64,
    pub length: u32,
}

impl FileRequest {
    pub fn for_content(record: &ContentRecord) -> Option<Self> {
        Some(FileRequest {
            source: i32::try_from(record.stack).ok()?,
            offset: record.source_offset,
            length: u32::try_from(record.compressed_size).ok()?,
        })
    }

    pub fn encode(&self) -> [u8; FILE_REQUEST_LEN] {
        let mut buf = [0u8; FILE_REQUEST_LEN];
        buf[0..4].copy_from_slice(&self.source.to_be_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decodes a request, returning `None` for anything not exactly
    /// [FILE_REQUEST_LEN] bytes long.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; FILE_REQUEST_LEN] = buf.try_into().ok()?;
        Some(FileRequest {
            source: i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offset: u64::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            length: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Stack index, if the request names a valid one.
    pub fn stack(&self) -> Option<u32> {
        u32::try_from(self.source).ok()
    }
}

/// One body entry: the range it carries, and its raw compressed bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyFrame {
    pub descriptor: FileRequest,
    pub payload: Bytes,
}

impl BodyFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_REQUEST_LEN + self.payload.len());
        buf.put_slice(&self.descriptor.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        if buf.len() < FILE_REQUEST_LEN {
            return Err(Error::Protocol(format!(
                "body frame of {} bytes is shorter than its descriptor",
                buf.len()
            )));
        }
        let payload = buf.split_off(FILE_REQUEST_LEN);
        // length checked above
        let descriptor = FileRequest::decode(&buf)
            .ok_or_else(|| Error::Protocol("invalid body frame descriptor".into()))?;

        if payload.len() as u64 != u64::from(descriptor.length) {
            return Err(Error::Protocol(format!(
                "body frame announces {} bytes, carries {}",
                descriptor.length,
                payload.len()
            )));
        }

        Ok(BodyFrame {
            descriptor,
            payload,
        })
    }
}

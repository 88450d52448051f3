//! The footer closing every layer blob, pointing at the TOC region.
//!
//! Two layouts exist: the eStargz footer, whose payload lives in a gzip
//! FEXTRA subfield tagged `SG`, and the older stargz footer, which places the
//! payload directly into the extra field. Both are empty gzip members, so
//! gzip readers skip them.

use crate::Error;

pub const FOOTER_SIZE: usize = 51;
pub const LEGACY_FOOTER_SIZE: usize = 47;

const MAGIC: &[u8; 6] = b"STARGZ";

/// gzip header with FEXTRA set, no mtime, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff];

/// A final, empty stored deflate block followed by CRC32 and ISIZE of zero.
const EMPTY_DEFLATE_TRAILER: [u8; 13] = [0x01, 0x00, 0x00, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0];

/// Produces the eStargz footer for a TOC at the given offset.
pub fn encode_footer(toc_offset: u64) -> [u8; FOOTER_SIZE] {
    let mut buf = [0u8; FOOTER_SIZE];
    buf[..10].copy_from_slice(&GZIP_HEADER);
    buf[10..12].copy_from_slice(&26u16.to_le_bytes());
    buf[12..14].copy_from_slice(b"SG");
    buf[14..16].copy_from_slice(&22u16.to_le_bytes());
    buf[16..32].copy_from_slice(format!("{:016x}", toc_offset).as_bytes());
    buf[32..38].copy_from_slice(MAGIC);
    buf[38..].copy_from_slice(&EMPTY_DEFLATE_TRAILER);
    buf
}

/// Parses the TOC offset out of the tail of a layer blob.
/// Returns the offset and the size of the footer that was found.
pub fn parse_footer(tail: &[u8]) -> Result<(u64, usize), Error> {
    if tail.len() >= FOOTER_SIZE {
        let f = &tail[tail.len() - FOOTER_SIZE..];
        if is_gzip_with_extra(f)
            && le16(&f[10..12]) == 26
            && &f[12..14] == b"SG"
            && le16(&f[14..16]) == 22
            && &f[32..38] == MAGIC
        {
            return Ok((parse_offset(&f[16..32])?, FOOTER_SIZE));
        }
    }

    if tail.len() >= LEGACY_FOOTER_SIZE {
        let f = &tail[tail.len() - LEGACY_FOOTER_SIZE..];
        if is_gzip_with_extra(f) && le16(&f[10..12]) == 22 && &f[28..34] == MAGIC {
            return Ok((parse_offset(&f[12..28])?, LEGACY_FOOTER_SIZE));
        }
    }

    Err(Error::metadata("footer", "no stargz footer found"))
}

fn is_gzip_with_extra(f: &[u8]) -> bool {
    f[0] == 0x1f && f[1] == 0x8b && f[3] & 0x04 != 0
}

fn le16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn parse_offset(hex: &[u8]) -> Result<u64, Error> {
    std::str::from_utf8(hex)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::metadata("footer", "invalid TOC offset"))
}

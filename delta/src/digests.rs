use std::{fmt, path::PathBuf, str::FromStr};

use data_encoding::HEXLOWER;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// A sha256 digest, as used by OCI to address layer blobs and by TOCs to
/// address uncompressed file content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("invalid digest encoding: {0:?}")]
    InvalidEncoding(String),
}

impl From<Error> for crate::Error {
    fn from(value: Error) -> Self {
        crate::Error::InvalidRequest(value.to_string())
    }
}

pub const DIGEST_LEN: usize = 32;
const PREFIX: &str = "sha256:";

impl Digest {
    /// Hashes the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lowercase hex, without the algorithm prefix.
    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// The relative path content with this digest is stored at, fanned out
    /// over three directory levels.
    pub fn content_path(&self) -> PathBuf {
        let hex = self.hex();
        [&hex[0..1], &hex[1..3], &hex[3..5], &hex[5..]]
            .iter()
            .collect()
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self(value)
    }
}

impl From<Sha256> for Digest {
    fn from(value: Sha256) -> Self {
        Self(value.finalize().into())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| Error::UnsupportedAlgorithm(s.to_string()))?;

        let decoded = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|_| Error::InvalidEncoding(s.to_string()))?;

        let buf: [u8; DIGEST_LEN] = decoded
            .try_into()
            .map_err(|_| Error::InvalidEncoding(s.to_string()))?;

        Ok(Self(buf))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, self.hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

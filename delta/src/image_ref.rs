use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Placeholder used on the wire for an empty image list.
pub const EMPTY_LIST: &str = "_";

/// A `name:tag` reference to one image. The name may include a registry host
/// (with port), so the tag is split off at the last `:` after the last `/`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef {
    name: String,
    tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let tag = tag.into();
        if name.is_empty() || tag.is_empty() || tag.contains(['/', ',', ':']) || name.contains(',')
        {
            return Err(Error::InvalidRequest(format!(
                "invalid image reference {}:{}",
                name, tag
            )));
        }
        Ok(Self { name, tag })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Parses a comma-separated list of references. `_` and the empty string
    /// denote the empty list.
    pub fn parse_list(s: &str) -> Result<Vec<ImageRef>, Error> {
        if s.is_empty() || s == EMPTY_LIST {
            return Ok(vec![]);
        }
        s.split(',').map(str::parse).collect()
    }

    /// The canonical form of a list, used both on the wire and as the
    /// identity of the Collection built from it.
    pub fn signature(images: &[ImageRef]) -> String {
        if images.is_empty() {
            return EMPTY_LIST.to_string();
        }
        images
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[slash..].rfind(':') {
            Some(i) => ImageRef::new(&s[..slash + i], &s[slash + i + 1..]),
            None => Err(Error::InvalidRequest(format!(
                "image reference {:?} lacks a tag",
                s
            ))),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageRef({})", self)
    }
}

impl Serialize for ImageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

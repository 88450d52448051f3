mod digests;
mod errors;
mod image_ref;

pub mod bundle;
pub mod collection;
pub mod fixtures;
pub mod optimizer;
pub mod toc;
pub mod trace;
pub mod wire;

pub use bundle::{ContentRecord, DeltaBundle, HeldContent, RequestedFile, Resolution};
pub use collection::{Collection, Content, Layer, VisibleEntry};
pub use digests::{Digest, DIGEST_LEN};
pub use errors::Error;
pub use image_ref::{ImageRef, EMPTY_LIST};

#[cfg(test)]
mod tests;

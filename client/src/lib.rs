pub mod fs;
pub mod local_store;
pub mod proxy_client;
pub mod receiver;
pub mod session;
pub mod signal;
pub mod tracer;

pub use fs::ImageFs;
pub use local_store::LocalStore;
pub use proxy_client::{DeltaStream, ProxyClient};
pub use session::{Mount, Session};

#[cfg(test)]
mod tests;

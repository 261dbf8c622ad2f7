//! Building blocks shared by every discovery provider.

pub mod endpoint;
pub mod error;
pub mod store;

pub use endpoint::Endpoint;
pub use error::{DiscoveryError, DiscoveryResult};
pub use store::{Snapshot, UpstreamStore};

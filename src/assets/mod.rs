//! Remote assets: identity, registry, transport and the verified cache

pub mod descriptor;
pub mod registry;
pub mod store;
pub mod transport;

pub use descriptor::{AssetDescriptor, AssetState, Checksum, DigestAlgorithm};
pub use registry::AssetRegistry;
pub use store::{AssetStore, FetchPolicy};
pub use transport::{HttpTransport, Transport, TransportError};

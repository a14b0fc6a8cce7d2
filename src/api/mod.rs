//! This mod is meant to hold most of the code for the library's client-facing API.
mod config;
mod wiring;

pub use config::DemandProfileType;
pub use config::NodeOptions;
pub use config::RecordStoreKind;
pub use config::SslMode;
pub use wiring::try_create_loopback_node;
pub use wiring::try_create_node;
pub use wiring::HostEntry;
pub use wiring::NodeConfig;
pub use wiring::NodeCreationError;
pub use wiring::NodeHandles;

mod active;
mod actor;
mod api;
mod coordinator;
mod demand;
mod grpc {
    include!("../generated/regroup.rs");
}
mod messages;
mod messenger;
mod node;
mod reconfigurator;
mod server;
mod store;
mod tasks;
mod wire;

pub use active::AppRequestError;
pub use active::ArActorClient;
pub use active::EpochStatus;
pub use api::try_create_loopback_node;
pub use api::try_create_node;
pub use api::DemandProfileType;
pub use api::HostEntry;
pub use api::NodeConfig;
pub use api::NodeCreationError;
pub use api::NodeHandles;
pub use api::NodeOptions;
pub use api::RecordStoreKind;
pub use api::SslMode;
pub use coordinator::ExecutedNotice;
pub use coordinator::GroupRequest;
pub use coordinator::LocalCoordinator;
pub use coordinator::ReplicaCoordinator;
pub use coordinator::SharedGroups;
pub use demand::DemandPolicy;
pub use demand::DemandProfile;
pub use demand::NullDemandPolicy;
pub use demand::RequestCountPolicy;
pub use messages::Envelope;
pub use messages::ReconfigMessage;
pub use messenger::LoopbackNetwork;
pub use messenger::Messenger;
pub use node::Epoch;
pub use node::NodeId;
pub use node::ServiceName;
pub use reconfigurator::ActivesView;
pub use reconfigurator::ControlError;
pub use reconfigurator::RcActorClient;
pub use store::ControlStore;
pub use store::MemoryControlStore;

// Convention: no `pub mod` anywhere; the root exports individual types so
// internal module layout can change without touching the public surface.

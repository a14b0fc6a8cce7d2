mod active;
mod actor;
mod epochs;

pub use active::ActiveReplica;
pub use active::ActiveReplicaConfig;
pub use active::AppRequestError;
pub use actor::ActiveReplicaActor;
pub use actor::ArActorClient;
pub use actor::Event as ArEvent;
pub use epochs::EpochInstance;
pub use epochs::EpochStatus;
pub use epochs::EpochTable;
pub use epochs::NameRecord;

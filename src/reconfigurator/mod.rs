mod actor;
mod reconfigurator;
mod record;

pub use actor::Event as RcEvent;
pub use actor::RcActorClient;
pub use actor::ReconfiguratorActor;
pub use reconfigurator::ActivesView;
pub use reconfigurator::ControlError;
pub use reconfigurator::Reconfigurator;
pub use reconfigurator::ReconfiguratorConfig;
pub use record::RecordState;
pub use record::ReconfigurationRecord;
pub use record::WaitKind;

use crate::active::NameRecord;
use crate::node::ServiceName;
use crate::reconfigurator::ReconfigurationRecord;

/// ControlStore is the persistence seam for the two control-plane
/// collections: `replica-controller-records` (reconfiguration records, RC
/// side) and `name-records` (epoch instances and retained checkpoints, AR
/// side). Both are keyed by the primary name with a unique index.
///
/// Writes must be durable before they return: the protocol's crash-recovery
/// story is "replay the stored records and re-emit their desired messages",
/// which only works if nothing acknowledged was lost.
pub trait ControlStore: Send + Sync + 'static {
    fn read_rc_record(&self, name: &ServiceName) -> Option<ReconfigurationRecord>;
    fn write_rc_record(&self, record: ReconfigurationRecord) -> Result<(), StoreError>;
    fn remove_rc_record(&self, name: &ServiceName) -> Result<(), StoreError>;
    fn rc_record_names(&self) -> Vec<ServiceName>;

    fn read_name_record(&self, name: &ServiceName) -> Option<NameRecord>;
    fn write_name_record(&self, record: NameRecord) -> Result<(), StoreError>;
    fn remove_name_record(&self, name: &ServiceName) -> Result<(), StoreError>;
    fn name_record_names(&self) -> Vec<ServiceName>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store I/O failure: {0}")]
    Io(String),
}

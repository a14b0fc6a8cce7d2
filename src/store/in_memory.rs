use crate::active::NameRecord;
use crate::node::ServiceName;
use crate::reconfigurator::ReconfigurationRecord;
use crate::store::{ControlStore, StoreError};
use std::collections::HashMap;
use std::sync::Mutex;

/// MemoryControlStore keeps both collections in RAM. "Durable" is
/// theoretically modeled here: the interface contract is what matters, and a
/// disk-backed adapter slots in behind the same trait.
#[derive(Default)]
pub struct MemoryControlStore {
    rc_records: Mutex<HashMap<ServiceName, ReconfigurationRecord>>,
    name_records: Mutex<HashMap<ServiceName, NameRecord>>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlStore for MemoryControlStore {
    fn read_rc_record(&self, name: &ServiceName) -> Option<ReconfigurationRecord> {
        self.rc_records
            .lock()
            .expect("rc-records mutex poison")
            .get(name)
            .cloned()
    }

    fn write_rc_record(&self, record: ReconfigurationRecord) -> Result<(), StoreError> {
        self.rc_records
            .lock()
            .expect("rc-records mutex poison")
            .insert(record.name.clone(), record);
        Ok(())
    }

    fn remove_rc_record(&self, name: &ServiceName) -> Result<(), StoreError> {
        self.rc_records.lock().expect("rc-records mutex poison").remove(name);
        Ok(())
    }

    fn rc_record_names(&self) -> Vec<ServiceName> {
        self.rc_records
            .lock()
            .expect("rc-records mutex poison")
            .keys()
            .cloned()
            .collect()
    }

    fn read_name_record(&self, name: &ServiceName) -> Option<NameRecord> {
        self.name_records
            .lock()
            .expect("name-records mutex poison")
            .get(name)
            .cloned()
    }

    fn write_name_record(&self, record: NameRecord) -> Result<(), StoreError> {
        self.name_records
            .lock()
            .expect("name-records mutex poison")
            .insert(record.name.clone(), record);
        Ok(())
    }

    fn remove_name_record(&self, name: &ServiceName) -> Result<(), StoreError> {
        self.name_records.lock().expect("name-records mutex poison").remove(name);
        Ok(())
    }

    fn name_record_names(&self) -> Vec<ServiceName> {
        self.name_records
            .lock()
            .expect("name-records mutex poison")
            .keys()
            .cloned()
            .collect()
    }
}

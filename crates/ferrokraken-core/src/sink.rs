use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::descriptor::ResourceDescriptor;
use crate::normalize::{NaturalKey, RawRecord};
use crate::StoreError;

/// Runs a synchronous store call on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(operation: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| StoreError::new(format!("store task failed: {join_error}")))?
}

/// Destination for normalized records.
pub trait RecordSink: Send + Sync {
    /// Merge by natural key; a later record with the same key replaces the earlier one.
    fn append(&self, descriptor: &ResourceDescriptor, records: &[RawRecord]) -> Result<usize, StoreError>;

    /// Discard everything previously stored for the resource, then store `records`.
    fn replace(&self, descriptor: &ResourceDescriptor, records: &[RawRecord])
        -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryTable {
    keyed: BTreeMap<NaturalKey, RawRecord>,
    snapshot: Vec<RawRecord>,
}

/// In-memory sink used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows for a resource: keyed rows in key order, then snapshot rows.
    pub fn records(&self, resource: &str) -> Vec<RawRecord> {
        let tables = self.tables.lock().expect("memory sink should not be poisoned");
        tables
            .get(resource)
            .map(|table| {
                table
                    .keyed
                    .values()
                    .chain(table.snapshot.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, resource: &str) -> usize {
        let tables = self.tables.lock().expect("memory sink should not be poisoned");
        tables
            .get(resource)
            .map_or(0, |table| table.keyed.len() + table.snapshot.len())
    }

    pub fn is_empty(&self, resource: &str) -> bool {
        self.len(resource) == 0
    }
}

impl RecordSink for MemorySink {
    fn append(&self, descriptor: &ResourceDescriptor, records: &[RawRecord]) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().expect("memory sink should not be poisoned");
        let table = tables.entry(descriptor.name.to_owned()).or_default();
        for record in records {
            table.keyed.insert(record.natural_key.clone(), record.clone());
        }
        Ok(records.len())
    }

    fn replace(
        &self,
        descriptor: &ResourceDescriptor,
        records: &[RawRecord],
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().expect("memory sink should not be poisoned");
        let table = tables.entry(descriptor.name.to_owned()).or_default();
        table.keyed.clear();
        table.snapshot = records.to_vec();
        Ok(records.len())
    }
}

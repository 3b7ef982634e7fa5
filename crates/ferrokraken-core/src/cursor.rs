use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::domain::Timestamp;
use crate::StoreError;

/// Persisted per-resource sync position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub last_timestamp: Option<Timestamp>,
    pub continuation_token: Option<String>,
    pub fallback_page_count: u32,
}

impl CursorState {
    /// Shape of every committed cursor: no token, no fallback pages.
    pub const fn committed(last_timestamp: Option<Timestamp>) -> Self {
        Self {
            last_timestamp,
            continuation_token: None,
            fallback_page_count: 0,
        }
    }
}

/// Durable resource name → cursor mapping. `commit` replaces the whole state atomically.
pub trait CursorStore: Send + Sync {
    fn load(&self, resource: &str) -> Result<Option<CursorState>, StoreError>;

    fn commit(&self, resource: &str, state: &CursorState) -> Result<(), StoreError>;

    /// Returns whether a cursor existed.
    fn reset(&self, resource: &str) -> Result<bool, StoreError>;

    fn list(&self) -> Result<BTreeMap<String, CursorState>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    states: Mutex<BTreeMap<String, CursorState>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(states: BTreeMap<String, CursorState>) -> Self {
        Self {
            states: Mutex::new(states),
        }
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, resource: &str) -> Result<Option<CursorState>, StoreError> {
        Ok(self
            .states
            .lock()
            .expect("cursor states should not be poisoned")
            .get(resource)
            .cloned())
    }

    fn commit(&self, resource: &str, state: &CursorState) -> Result<(), StoreError> {
        self.states
            .lock()
            .expect("cursor states should not be poisoned")
            .insert(resource.to_owned(), state.clone());
        Ok(())
    }

    fn reset(&self, resource: &str) -> Result<bool, StoreError> {
        Ok(self
            .states
            .lock()
            .expect("cursor states should not be poisoned")
            .remove(resource)
            .is_some())
    }

    fn list(&self) -> Result<BTreeMap<String, CursorState>, StoreError> {
        Ok(self
            .states
            .lock()
            .expect("cursor states should not be poisoned")
            .clone())
    }
}

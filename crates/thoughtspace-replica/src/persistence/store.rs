//! Durable local storage.

use crate::error::PersistenceError;
use crate::name::DocumentName;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};

/// Append-only update log per document.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// Every update stored for the document, oldest first.
    async fn load(&self, name: &DocumentName) -> Result<Vec<Vec<u8>>, PersistenceError>;

    async fn append(&self, name: &DocumentName, update: Vec<u8>) -> Result<(), PersistenceError>;

    /// Remove all data for the document. Fails with `NotFound` if there is
    /// none.
    async fn clear(&self, name: &DocumentName) -> Result<(), PersistenceError>;
}

/// Small string key-value store for replication metadata.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), PersistenceError>;
}

/// In-memory store for testing and simulation.
///
/// Faults can be queued with [`MemoryStore::inject_fault`]; each queued
/// fault fails the next load, append or clear.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    meta: RwLock<HashMap<String, String>>,
    faults: Mutex<VecDeque<PersistenceError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_fault(&self, error: PersistenceError) {
        self.faults.lock().push_back(error);
    }

    pub fn contains(&self, name: &DocumentName) -> bool {
        self.docs.read().contains_key(&name.to_string())
    }

    pub fn update_count(&self, name: &DocumentName) -> usize {
        self.docs
            .read()
            .get(&name.to_string())
            .map_or(0, |updates| updates.len())
    }

    pub fn document_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.docs.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn take_fault(&self) -> Result<(), PersistenceError> {
        match self.faults.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load(&self, name: &DocumentName) -> Result<Vec<Vec<u8>>, PersistenceError> {
        self.take_fault()?;
        Ok(self
            .docs
            .read()
            .get(&name.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, name: &DocumentName, update: Vec<u8>) -> Result<(), PersistenceError> {
        self.take_fault()?;
        self.docs
            .write()
            .entry(name.to_string())
            .or_default()
            .push(update);
        Ok(())
    }

    async fn clear(&self, name: &DocumentName) -> Result<(), PersistenceError> {
        self.take_fault()?;
        match self.docs.write().remove(&name.to_string()) {
            Some(_) => Ok(()),
            None => Err(PersistenceError::NotFound(name.to_string())),
        }
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.meta.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        self.meta.write().insert(key.to_string(), value);
        Ok(())
    }
}

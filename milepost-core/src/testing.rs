//! In-memory backend for tests.
//!
//! Implements the full [`Backend`] capability set against process-local
//! state, so engine behavior can be exercised hermetically: scripted
//! failures, pre-seeded user data, advisory-lock contention, and direct
//! inspection of the raw metadata documents.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{Backend, RawEntry, ScriptBody};
use crate::error::{MilepostError, Result};

#[derive(Default)]
struct State {
    collections: BTreeMap<String, Vec<RawEntry>>,
    schemas: BTreeSet<String>,
    executed: Vec<(String, String)>,
    failing: BTreeSet<String>,
    locks: BTreeSet<i64>,
    closed: bool,
}

/// A [`Backend`] holding everything in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    transactional: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that reports transactional script execution, so migrate
    /// skips recording failed entries.
    pub fn transactional() -> Self {
        Self {
            transactional: true,
            ..Self::default()
        }
    }

    /// Simulate pre-existing user data.
    pub fn seed_schema(&self, name: &str) {
        self.state.lock().unwrap().schemas.insert(name.to_string());
    }

    /// Make the named script fail when executed.
    pub fn fail_script(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    /// Stop failing previously scripted failures.
    pub fn clear_failing(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// Names of every script executed so far, in execution order.
    pub fn executed_scripts(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `(name, source)` of every script executed so far, with placeholders
    /// already substituted.
    pub fn executed_sources(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Raw documents of a collection, in rank order.
    pub fn entries(&self, collection: &str) -> Vec<RawEntry> {
        let state = self.state.lock().unwrap();
        let mut entries = state
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|e| e.install_rank);
        entries
    }

    /// Insert a raw document directly, bypassing the store (legacy layouts,
    /// corrupt history).
    pub fn insert_raw(&self, collection: &str, entry: RawEntry) {
        self.state
            .lock()
            .unwrap()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(entry);
    }

    pub fn schemas(&self) -> Vec<String> {
        self.state.lock().unwrap().schemas.iter().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_script(&self, script: ScriptBody<'_>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(script.name) {
            return Err(MilepostError::Backend(format!(
                "scripted failure for '{}'",
                script.name
            )));
        }
        state
            .executed
            .push((script.name.to_string(), script.source.to_string()));
        Ok(())
    }

    async fn enumerate_schemas(&self) -> Result<Vec<String>> {
        Ok(self.schemas())
    }

    async fn drop_schema(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.schemas.remove(name);
        state.collections.remove(name);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().schemas.is_empty())
    }

    async fn session_user(&self) -> Result<String> {
        Ok("tester".to_string())
    }

    async fn try_lock(&self, key: i64) -> Result<bool> {
        Ok(self.state.lock().unwrap().locks.insert(key))
    }

    async fn unlock(&self, key: i64) -> Result<()> {
        self.state.lock().unwrap().locks.remove(&key);
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .collections
            .contains_key(collection))
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .collections
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn read_entries(&self, collection: &str) -> Result<Vec<RawEntry>> {
        Ok(self.entries(collection))
    }

    async fn insert_entry(&self, collection: &str, entry: RawEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entries = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| MilepostError::Backend(format!("no collection '{}'", collection)))?;
        entries.push(entry);
        Ok(())
    }

    async fn rewrite_entry(
        &self,
        collection: &str,
        install_rank: i64,
        entry: RawEntry,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entries = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| MilepostError::Backend(format!("no collection '{}'", collection)))?;
        let slot = entries
            .iter_mut()
            .find(|e| e.install_rank == install_rank)
            .ok_or_else(|| {
                MilepostError::Backend(format!("no entry with install_rank {}", install_rank))
            })?;
        *slot = entry;
        Ok(())
    }

    async fn delete_failed(&self, collection: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let entries = match state.collections.get_mut(collection) {
            Some(entries) => entries,
            None => return Ok(0),
        };
        let before = entries.len();
        entries.retain(|e| e.success != Some(false));
        Ok((before - entries.len()) as u64)
    }

    async fn update_checksum(
        &self,
        collection: &str,
        version: Option<&str>,
        description: &str,
        checksum: i32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entries = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| MilepostError::Backend(format!("no collection '{}'", collection)))?;
        for entry in entries.iter_mut() {
            let matches = match version {
                Some(v) => entry.version.as_deref() == Some(v),
                None => entry.version.is_none() && entry.description == description,
            };
            if matches {
                entry.checksum = Some(checksum);
            }
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

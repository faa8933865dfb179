//! Async adapter over the synchronous vault core
//!
//! Vault operations do blocking file I/O and CPU-bound crypto, so each call
//! runs on tokio's blocking pool and never stalls the async runtime.

use crate::error::{Error, Result};
use crate::index::{ListFilter, MemoryId, MemoryPatch, MemoryRecord, MemorySummary};
use crate::ingest::NewMemory;
use crate::sweep::SweepReport;
use crate::vault::{MemoryDetail, Vault};
use std::sync::Arc;

/// Cloneable async handle to an open vault
#[derive(Debug, Clone)]
pub struct VaultService {
    vault: Arc<Vault>,
}

impl VaultService {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Vault) -> Result<T> + Send + 'static,
    {
        let vault = self.vault.clone();
        tokio::task::spawn_blocking(move || op(&vault))
            .await
            .map_err(|e| Error::Internal(format!("Vault task failed: {}", e)))?
    }

    pub async fn list_memories(&self, filter: ListFilter) -> Result<Vec<MemorySummary>> {
        self.run(move |vault| Ok(vault.list(filter).iter().collect())).await
    }

    pub async fn get_record(&self, id: MemoryId) -> Result<MemoryRecord> {
        self.run(move |vault| vault.get_record(&id).map(|r| (*r).clone())).await
    }

    pub async fn get_memory_by_id(&self, id: MemoryId) -> Result<MemoryDetail> {
        self.run(move |vault| vault.get_memory_by_id(&id)).await
    }

    pub async fn add_memory(&self, input: NewMemory) -> Result<MemoryRecord> {
        self.run(move |vault| vault.add_memory(input)).await
    }

    pub async fn update_memory(
        &self,
        id: MemoryId,
        patch: MemoryPatch,
        expected_version: u64,
    ) -> Result<MemoryRecord> {
        self.run(move |vault| {
            vault
                .update_memory(&id, patch, expected_version)
                .map(|r| (*r).clone())
        })
        .await
    }

    pub async fn delete_memory(&self, id: MemoryId) -> Result<()> {
        self.run(move |vault| vault.delete_memory(&id)).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.run(|vault| vault.sweep()).await
    }
}

//! Storage of the on-chain channel records.
//!
//! Operations are not validated at this level. All checks happen in the
//! [crate::OnChainProcessor] before anything is written.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabletop_primitives::{BoardState, ChannelId, ChannelMetadata, StateProof};
use tokio::sync::Mutex;

/// The on-chain record of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelData {
    pub id: ChannelId,
    pub meta: ChannelMetadata,
    /// The state the current epoch started from.
    pub reinit_state: BoardState,
    /// The best state proof put on chain so far.
    pub proof: StateProof,
    /// Height of the block an open dispute was filed in.
    pub dispute_height: Option<u64>,
}

#[async_trait::async_trait]
pub trait ChannelStore: Send + Sync {
    /// Prepares the backing storage. Called once before any other operation.
    async fn initialise_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelData>>;

    /// Inserts or replaces the record for `data.id`.
    async fn put(&self, data: ChannelData) -> Result<()>;

    /// Removes a record and returns whether it existed.
    async fn delete(&self, id: &ChannelId) -> Result<bool>;

    async fn exists(&self, id: &ChannelId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Returns the ids of all stored channels in ascending order.
    async fn ids(&self) -> Result<Vec<ChannelId>>;
}

/// A [ChannelStore] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    channels: Mutex<BTreeMap<ChannelId, ChannelData>>,
}

#[async_trait::async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelData>> {
        Ok(self.channels.lock().await.get(id).cloned())
    }

    async fn put(&self, data: ChannelData) -> Result<()> {
        self.channels.lock().await.insert(data.id, data);
        Ok(())
    }

    async fn delete(&self, id: &ChannelId) -> Result<bool> {
        Ok(self.channels.lock().await.remove(id).is_some())
    }

    async fn ids(&self) -> Result<Vec<ChannelId>> {
        Ok(self.channels.lock().await.keys().copied().collect())
    }
}

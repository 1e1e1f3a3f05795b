//! This module contains the on-chain side of game channels: the records the chain keeps for
//! every channel, and the processing of disputes, resolutions and their timeouts.

use crate::{
    manager::ChannelManager,
    proof::verify_state_proof,
    store::{ChannelData, ChannelStore},
};
use std::sync::Arc;
use tabletop_primitives::{
    BoardRules, BoardState, ChannelError, ChannelId, ChannelMetadata, OpenChannel,
    ParsedBoardState, ParticipantIndex, SignatureVerifier, StateProof,
};
use thiserror::Error;
use tracing::{debug, info};

/// The on-chain data of a channel as seen at some block, handed to
/// [ChannelManager::process_on_chain].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainUpdate {
    pub height: u64,
    pub meta: ChannelMetadata,
    pub reinit_state: BoardState,
    pub proof: StateProof,
    pub dispute_height: Option<u64>,
}

/// A channel that was closed because a dispute against `loser` expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    pub id: ChannelId,
    pub loser: Option<ParticipantIndex>,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("channel {0} already exists")]
    AlreadyExists(ChannelId),
    #[error("channel {0} does not exist")]
    NotFound(ChannelId),
    #[error("a finished game cannot be disputed")]
    FinalState,
    #[error("state proof at turn {offered} does not supersede turn {stored}")]
    NotAdvanced { stored: u64, offered: u64 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("channel store failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// The [OnChainProcessor] applies channel moves confirmed on chain to a [ChannelStore].
pub struct OnChainProcessor<R, S> {
    rules: Arc<R>,
    verifier: Arc<dyn SignatureVerifier>,
    store: S,
}

impl<R, S> OnChainProcessor<R, S>
where
    R: BoardRules,
    S: ChannelStore,
{
    pub fn new(rules: Arc<R>, verifier: Arc<dyn SignatureVerifier>, store: S) -> Self {
        Self {
            rules,
            verifier,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates the record of a new channel, starting at `initial_state`.
    pub async fn open_channel(
        &self,
        id: ChannelId,
        meta: ChannelMetadata,
        initial_state: BoardState,
    ) -> Result<(), ProcessorError> {
        if self.store.exists(&id).await.map_err(ProcessorError::Store)? {
            return Err(ProcessorError::AlreadyExists(id));
        }
        self.rules
            .parse_state(&id, &meta, &initial_state)
            .map_err(ChannelError::from)?;

        info!(%id, participants = meta.participants.len(), "opened channel");
        self.store
            .put(ChannelData {
                id,
                meta,
                reinit_state: initial_state.clone(),
                proof: StateProof::from_state(initial_state),
                dispute_height: None,
            })
            .await
            .map_err(ProcessorError::Store)
    }

    /// Files a dispute at `height` with the given proof.
    ///
    /// The proof must be at least as advanced as the one on chain, and strictly more advanced
    /// if a dispute is open already. Disputes on finished games are rejected.
    pub async fn process_dispute(
        &self,
        id: &ChannelId,
        height: u64,
        proof: StateProof,
    ) -> Result<(), ProcessorError> {
        let mut data = self.load(id).await?;
        let offered = self.verify(&data, &proof).await?;
        if offered.is_final() {
            return Err(ProcessorError::FinalState);
        }

        let stored = self.turn_count(&data)?;
        let offered = offered.turn_count();
        if offered < stored || (data.dispute_height.is_some() && offered == stored) {
            return Err(ProcessorError::NotAdvanced { stored, offered });
        }

        info!(%id, height, turn = offered, "dispute filed");
        data.proof = proof;
        data.dispute_height = Some(height);
        self.store.put(data).await.map_err(ProcessorError::Store)
    }

    /// Puts a strictly more advanced proof on chain, which also clears any open dispute.
    pub async fn process_resolution(
        &self,
        id: &ChannelId,
        proof: StateProof,
    ) -> Result<(), ProcessorError> {
        let mut data = self.load(id).await?;
        let offered = self.verify(&data, &proof).await?.turn_count();
        let stored = self.turn_count(&data)?;
        if offered <= stored {
            return Err(ProcessorError::NotAdvanced { stored, offered });
        }

        info!(%id, turn = offered, disputed = data.dispute_height.is_some(), "resolution");
        data.proof = proof;
        data.dispute_height = None;
        self.store.put(data).await.map_err(ProcessorError::Store)
    }

    /// Closes all channels whose dispute has expired at `height`. The participant that
    /// failed to respond loses.
    pub async fn process_timeouts(
        &self,
        height: u64,
        dispute_blocks: u64,
    ) -> Result<Vec<TimedOut>, ProcessorError> {
        let mut closed = Vec::new();
        for id in self.store.ids().await.map_err(ProcessorError::Store)? {
            let Some(data) = self.store.get(&id).await.map_err(ProcessorError::Store)? else {
                continue;
            };
            let Some(dispute_height) = data.dispute_height else {
                continue;
            };
            if height < dispute_height + dispute_blocks {
                continue;
            }

            let loser = self.parse(&data)?.whose_turn();
            info!(%id, height, ?loser, "dispute timed out");
            self.store.delete(&id).await.map_err(ProcessorError::Store)?;
            closed.push(TimedOut { id, loser });
        }
        Ok(closed)
    }

    /// Closes a channel by mutual agreement.
    pub async fn close_channel(&self, id: &ChannelId) -> Result<(), ProcessorError> {
        if !self.store.delete(id).await.map_err(ProcessorError::Store)? {
            return Err(ProcessorError::NotFound(*id));
        }
        info!(%id, "closed channel");
        Ok(())
    }

    /// Returns the on-chain view of a channel at `height`, or [None] if it does not exist.
    pub async fn update_for(
        &self,
        id: &ChannelId,
        height: u64,
    ) -> Result<Option<OnChainUpdate>, ProcessorError> {
        let data = self.store.get(id).await.map_err(ProcessorError::Store)?;
        Ok(data.map(|data| OnChainUpdate {
            height,
            meta: data.meta,
            reinit_state: data.reinit_state,
            proof: data.proof,
            dispute_height: data.dispute_height,
        }))
    }

    /// Feeds the current on-chain state of the manager's channel and the new chain tip into
    /// the manager.
    pub async fn sync_manager<MR, C>(
        &self,
        manager: &ChannelManager<MR, C>,
        height: u64,
    ) -> Result<(), ProcessorError>
    where
        MR: BoardRules,
        C: OpenChannel,
    {
        match self.update_for(manager.id(), height).await? {
            Some(update) => manager.process_on_chain(update).await?,
            None => manager.process_on_chain_non_existent().await,
        }
        manager.process_block(height).await?;
        debug!(id = %manager.id(), height, "synced channel manager");
        Ok(())
    }

    async fn load(&self, id: &ChannelId) -> Result<ChannelData, ProcessorError> {
        self.store
            .get(id)
            .await
            .map_err(ProcessorError::Store)?
            .ok_or(ProcessorError::NotFound(*id))
    }

    async fn verify(
        &self,
        data: &ChannelData,
        proof: &StateProof,
    ) -> Result<Box<dyn ParsedBoardState>, ProcessorError> {
        Ok(verify_state_proof(
            self.verifier.as_ref(),
            self.rules.as_ref(),
            &data.id,
            &data.meta,
            &data.reinit_state,
            proof,
        )
        .await?)
    }

    fn parse(&self, data: &ChannelData) -> Result<Box<dyn ParsedBoardState>, ProcessorError> {
        self.rules
            .parse_state(&data.id, &data.meta, data.proof.latest_state())
            .map_err(|e| ChannelError::from(e).into())
    }

    fn turn_count(&self, data: &ChannelData) -> Result<u64, ProcessorError> {
        Ok(self.parse(data)?.turn_count())
    }
}

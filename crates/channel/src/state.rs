//! This module contains the in-memory representation of one channel as tracked by the
//! [crate::ChannelManager], and the consistent snapshot of it that is handed out to observers.

use serde::Serialize;
use serde_json::Value;
use tabletop_primitives::{
    BoardRules, BoardState, ChannelId, ChannelMetadata, ParticipantIndex, StateProof, TxId,
};
use tracing::error;

/// The [ChannelStatus] enum is used to indicate where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// No dispute is outstanding; the channel progresses off chain.
    Open,
    /// A dispute was filed, by us (possibly still unconfirmed) or by the other side.
    DisputeFiled,
    /// The channel no longer exists on chain. This is terminal.
    Closed,
}

/// An outstanding dispute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispute {
    /// The block the dispute was confirmed in, or [None] while our own dispute transaction
    /// has not been confirmed yet.
    pub height: Option<u64>,
    /// Turn count of the state the dispute was filed for.
    pub turn_count: u64,
    /// The participant that has to respond to the dispute.
    pub whose_turn: Option<ParticipantIndex>,
}

/// The [ChannelState] struct is the aggregate guarded by the channel manager's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelState {
    /// Metadata of the current epoch, [None] until the chain reported the channel.
    pub meta: Option<ChannelMetadata>,
    /// The starting state of the current epoch.
    pub reinit_state: BoardState,
    /// The best state proof known for the current epoch.
    pub proof: StateProof,
    pub dispute: Option<Dispute>,
    pub pending_dispute: Option<TxId>,
    pub pending_resolution: Option<TxId>,
    /// Turn count for which the game's on-chain move was last submitted.
    pub on_chain_move_turn: Option<u64>,
    /// Set while our latest extension of the proof has not reached the other participants.
    pub unbroadcast: bool,
    pub exists_on_chain: bool,
    pub closed: bool,
    pub block_height: u64,
    /// Block height at which the proof last advanced.
    pub last_progress_height: u64,
    /// Bumped on every observable change. Starts at 1 and never goes back.
    pub version: u64,
}

impl ChannelState {
    pub fn new() -> Self {
        Self {
            meta: None,
            reinit_state: BoardState::new(),
            proof: StateProof::from_state(BoardState::new()),
            dispute: None,
            pending_dispute: None,
            pending_resolution: None,
            on_chain_move_turn: None,
            unbroadcast: false,
            exists_on_chain: false,
            closed: false,
            block_height: 0,
            last_progress_height: 0,
            version: 1,
        }
    }

    /// Returns true if `other` differs in anything but the chain height bookkeeping, the
    /// broadcast flag and the version itself. Only such differences warrant a new version.
    pub fn observably_differs(&self, other: &ChannelState) -> bool {
        let mut other = other.clone();
        other.unbroadcast = self.unbroadcast;
        other.block_height = self.block_height;
        other.last_progress_height = self.last_progress_height;
        other.version = self.version;
        *self != other
    }

    pub fn status(&self) -> ChannelStatus {
        if self.closed {
            ChannelStatus::Closed
        } else if self.dispute.is_some() || self.pending_dispute.is_some() {
            ChannelStatus::DisputeFiled
        } else {
            ChannelStatus::Open
        }
    }

    /// Builds the externally visible view of this state.
    pub fn snapshot(
        &self,
        id: &ChannelId,
        player_name: &str,
        rules: &dyn BoardRules,
        dispute_blocks: u64,
    ) -> ChannelSnapshot {
        let current = self.meta.as_ref().and_then(|meta| {
            match rules.parse_state(id, meta, self.proof.latest_state()) {
                Ok(parsed) => Some(CurrentState {
                    proof: self.proof.clone(),
                    board: parsed.to_json(),
                    turn_count: parsed.turn_count(),
                    whose_turn: parsed.whose_turn(),
                    is_final: parsed.is_final(),
                    winner: parsed.winner(),
                }),
                Err(e) => {
                    error!(%id, %e, "current channel state does not parse");
                    None
                }
            }
        });

        let dispute = self.dispute.as_ref().map(|d| DisputeView {
            height: d.height,
            expires: d.height.map(|h| h + dispute_blocks),
            whose_turn: d.whose_turn,
            can_resolve: current
                .as_ref()
                .is_some_and(|c| c.turn_count > d.turn_count),
        });

        ChannelSnapshot {
            id: *id,
            player_name: player_name.to_string(),
            version: self.version,
            status: self.status(),
            exists_on_chain: self.exists_on_chain,
            meta: self.meta.clone(),
            current,
            dispute,
            pending: PendingTxs {
                dispute: self.pending_dispute,
                resolution: self.pending_resolution,
            },
        }
    }
}

/// A consistent view of a channel at one version.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub player_name: String,
    pub version: u64,
    pub status: ChannelStatus,
    pub exists_on_chain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ChannelMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute: Option<DisputeView>,
    pub pending: PendingTxs,
}

/// The latest state of a channel, as interpreted by the game.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentState {
    pub proof: StateProof,
    pub board: Value,
    pub turn_count: u64,
    pub whose_turn: Option<ParticipantIndex>,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<ParticipantIndex>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeView {
    pub height: Option<u64>,
    /// First block at which the dispute can be timed out.
    pub expires: Option<u64>,
    pub whose_turn: Option<ParticipantIndex>,
    /// True if we hold a state that resolves the dispute.
    pub can_resolve: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PendingTxs {
    pub dispute: Option<TxId>,
    pub resolution: Option<TxId>,
}

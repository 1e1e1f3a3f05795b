//! The traits module contains the per-game capability traits and the interfaces of the
//! external collaborators a channel talks to.

use crate::{
    BoardMove, BoardState, ChannelId, ChannelMetadata, MoveError, ParseError, ParticipantIndex,
    StateProof, TxId,
};
use alloy_primitives::{Address, Bytes, B256};
use anyhow::Result;
use serde_json::Value;
use std::any::Any;

/// A [ParsedBoardState] is the structured, read-only view of one [BoardState] as interpreted
/// by a game's [BoardRules]. It is recomputed on demand and never outlives the state it was
/// parsed from.
pub trait ParsedBoardState: Send + Sync {
    /// Returns true if `other` encodes the same game position as this state. Encodings are not
    /// required to be canonical, so this may differ from a plain byte comparison.
    fn equals(&self, other: &BoardState) -> bool;

    /// Returns the participant whose turn it is, or [None] if the game is over.
    fn whose_turn(&self) -> Option<ParticipantIndex>;

    /// Returns the number of turns played so far. This is the measure of how advanced a state
    /// is: any legal move strictly increases it.
    fn turn_count(&self) -> u64;

    /// Returns true if the game has ended.
    fn is_final(&self) -> bool {
        self.whose_turn().is_none()
    }

    /// Returns the winner of a finished game, if the game has one.
    fn winner(&self) -> Option<ParticipantIndex> {
        None
    }

    /// Applies a move on behalf of the participant whose turn it is and returns the
    /// serialized successor state. The receiver itself is never modified.
    fn apply_move(&self, mv: &BoardMove) -> Result<BoardState, MoveError>;

    /// Returns the game-specific JSON view of the state, used in channel snapshots.
    fn to_json(&self) -> Value;

    /// Gives access to the concrete type, so that a game's [OpenChannel] can inspect the
    /// states produced by its own [BoardRules].
    fn as_any(&self) -> &dyn Any;
}

/// The [BoardRules] trait describes how a game interprets raw board states. Implementations
/// must be pure and free of shared mutable state.
pub trait BoardRules: Send + Sync {
    /// Parses a serialized state for the given channel.
    fn parse_state(
        &self,
        channel_id: &ChannelId,
        meta: &ChannelMetadata,
        state: &BoardState,
    ) -> Result<Box<dyn ParsedBoardState>, ParseError>;
}

/// The [OpenChannel] trait is the game-specific policy applied to a channel the local player
/// takes part in. It never mutates channel state; the channel manager calls it and acts on
/// the results.
#[async_trait::async_trait]
pub trait OpenChannel: Send + Sync {
    /// Builds the on-chain move that resolves a dispute with the given proof.
    /// Must be deterministic in its inputs.
    fn resolution_move(&self, channel_id: &ChannelId, proof: &StateProof) -> Value;

    /// Builds the on-chain move that files a dispute with the given proof.
    fn dispute_move(&self, channel_id: &ChannelId, proof: &StateProof) -> Value;

    /// Returns the move to make automatically in the given state, if the game demands one.
    /// The decision may only depend on `state` and explicitly set local inputs.
    fn maybe_auto_move(&self, _state: &dyn ParsedBoardState) -> Option<BoardMove> {
        None
    }

    /// Sends an on-chain move through `sender` if the game requires one in the given state,
    /// returning the id of the submitted transaction.
    async fn maybe_on_chain_move(
        &self,
        _state: &dyn ParsedBoardState,
        _sender: &dyn MoveSender,
    ) -> Result<Option<TxId>> {
        Ok(None)
    }
}

/// A [SignatureVerifier] checks signatures against the chain's address scheme.
#[async_trait::async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Returns the address that produced `signature` over `message`, or [None] if the
    /// signature is invalid. [Err] is reserved for failures of the verifier itself.
    async fn recover_address(&self, message: &B256, signature: &[u8]) -> Result<Option<Address>>;
}

/// A [MessageSigner] signs channel messages with the local participant's key.
#[async_trait::async_trait]
pub trait MessageSigner: Send + Sync {
    /// Returns the address that signatures made by this signer recover to.
    fn address(&self) -> Address;

    /// Signs the given message.
    async fn sign_message(&self, message: &B256) -> Result<Bytes>;
}

/// A [MoveSender] submits moves to the chain. Submission does not wait for confirmation.
#[async_trait::async_trait]
pub trait MoveSender: Send + Sync {
    /// Submits the given move and returns the id of its transaction.
    async fn send_move(&self, mv: Value) -> Result<TxId>;

    /// Returns true if the given transaction is still waiting to be confirmed.
    async fn is_pending(&self, txid: &TxId) -> Result<bool>;
}

/// An [OffChainBroadcast] delivers new state proofs to the other participants of a channel.
#[async_trait::async_trait]
pub trait OffChainBroadcast: Send + Sync {
    async fn send_new_state(&self, reinit: &Bytes, proof: &StateProof) -> Result<()>;
}

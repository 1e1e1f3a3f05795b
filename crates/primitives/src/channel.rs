//! Types describing a game channel, its participants and the signed evidence of its progress.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// The [ChannelId] type is an alias to [B256], used to delineate a channel identifier from a regular hash.
pub type ChannelId = B256;

/// The [TxId] type is an alias to [B256], identifying a transaction submitted to the chain.
pub type TxId = B256;

/// Index of a participant within [ChannelMetadata::participants].
pub type ParticipantIndex = usize;

/// An opaque serialized game position. Its meaning is defined entirely by the
/// [crate::BoardRules] implementation of the game being played.
pub type BoardState = Bytes;

/// An opaque serialized move, interpreted by [crate::ParsedBoardState::apply_move].
pub type BoardMove = Bytes;

/// A single participant of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// The display name of the participant on chain.
    pub name: String,
    /// The address whose signatures count as this participant's.
    pub address: Address,
}

/// The [ChannelMetadata] struct holds the immutable data of one channel epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// The ordered participants of the channel. A [ParticipantIndex] refers into this list.
    pub participants: Vec<Participant>,
    /// The reinitialization id. It changes whenever the channel is reset on chain, which
    /// invalidates all signatures made for an earlier epoch.
    pub reinit: Bytes,
}

impl ChannelMetadata {
    pub fn new(participants: Vec<Participant>, reinit: impl Into<Bytes>) -> Self {
        Self {
            participants,
            reinit: reinit.into(),
        }
    }

    /// Returns the index of the participant with the given name, if any.
    pub fn index_of_name(&self, name: &str) -> Option<ParticipantIndex> {
        self.participants.iter().position(|p| p.name == name)
    }

    /// Returns the index of the participant with the given address, if any.
    pub fn index_of_address(&self, address: &Address) -> Option<ParticipantIndex> {
        self.participants.iter().position(|p| p.address == *address)
    }
}

/// Some data together with the signatures made over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedData {
    pub data: Bytes,
    pub signatures: Vec<Bytes>,
}

impl SignedData {
    /// Wraps data that carries no signatures.
    pub fn unsigned(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            signatures: Vec::new(),
        }
    }
}

/// One link of a [StateProof]: a move and the signed state it leads to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    #[serde(rename = "move")]
    pub mv: BoardMove,
    pub new_state: SignedData,
}

/// The [StateProof] struct is a chain of signed state transitions rooted at an initial state.
/// It is the best evidence of channel progress a party holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateProof {
    pub initial_state: SignedData,
    pub transitions: Vec<StateTransition>,
}

impl StateProof {
    /// A proof consisting of nothing but the given (unsigned) state. This is what the
    /// reinitialization state of a channel looks like before anyone moved.
    pub fn from_state(state: impl Into<BoardState>) -> Self {
        Self {
            initial_state: SignedData::unsigned(state),
            transitions: Vec::new(),
        }
    }

    /// Returns the state that the proof ends in.
    pub fn latest_state(&self) -> &BoardState {
        self.transitions
            .last()
            .map(|t| &t.new_state.data)
            .unwrap_or(&self.initial_state.data)
    }

    /// Returns the number of transitions on top of the initial state.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

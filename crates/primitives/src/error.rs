//! Error types shared by the game rules and the channel manager.

use crate::ParticipantIndex;
use thiserror::Error;

/// Returned by [crate::BoardRules::parse_state] when a serialized state is not valid for the game.
/// This always indicates a logic bug or corrupted data and is never worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed board state: {0}")]
pub struct ParseError(pub String);

/// Returned when a move cannot be applied to a board state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    /// The move bytes are not a valid encoding for the game.
    #[error("malformed move: {0}")]
    Malformed(String),
    /// The move is well-formed but breaks the rules of the game.
    #[error("illegal move: {0}")]
    Illegal(String),
    /// The participant trying to move is not the one whose turn it is.
    #[error("it is not the turn of participant {0}")]
    NotYourTurn(ParticipantIndex),
    /// The game is already over.
    #[error("the game is already finished")]
    Finished,
}

/// The [ChannelError] enum is the failure type of every mutating channel operation. A failed
/// operation never leaves the channel in a modified state.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Move(#[from] MoveError),

    /// A signature could not be verified or did not belong to the expected participant.
    #[error("invalid signature: {0}")]
    Signature(String),

    /// The offered state proof is not more advanced than the one already held.
    #[error("state proof at turn {offered} is not more advanced than turn {current}")]
    StaleProof { current: u64, offered: u64 },

    /// The offered state proof belongs to another epoch of the channel.
    #[error("state proof is for a different reinitialization of the channel")]
    ReinitMismatch,

    /// An outstanding dispute blocks further off-chain progress.
    #[error("off-chain progress is blocked by an outstanding dispute")]
    DisputeWindow,

    #[error("channel is closed")]
    Closed,

    /// The local player does not take part in the channel.
    #[error("{0} is not a participant of the channel")]
    NotParticipant(String),

    /// The channel has not (yet) been reported by the chain.
    #[error("channel is not known on chain")]
    Unknown,

    #[error("automoves did not settle within {0} iterations")]
    AutoMoveLimit(usize),

    /// A collaborator (signature verification, signing, submission, broadcast) failed.
    #[error("external collaborator failed: {0}")]
    External(#[source] anyhow::Error),
}

impl ChannelError {
    /// Returns true for failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::External(_))
    }
}

#![doc = include_str!("../README.md")]

//! Primitives for Tabletop, a library for playing turn-based games in off-chain
//! channels that fall back to the chain for disputes.

mod channel;
pub use channel::{
    BoardMove, BoardState, ChannelId, ChannelMetadata, Participant, ParticipantIndex, SignedData,
    StateProof, StateTransition, TxId,
};

mod error;
pub use error::{ChannelError, MoveError, ParseError};

mod traits;
pub use traits::{
    BoardRules, MessageSigner, MoveSender, OffChainBroadcast, OpenChannel, ParsedBoardState,
    SignatureVerifier,
};

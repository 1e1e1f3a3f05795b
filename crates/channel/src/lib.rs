//! The channel crate contains the off-chain management of game channels: state proof
//! validation, the channel manager and the on-chain dispute processing it pairs with.

extern crate tabletop_primitives;

mod config;
mod manager;
mod onchain;
mod proof;
mod rpc;
mod signatures;
mod state;
mod store;

pub mod mocks;

pub use config::ChannelConfig;
pub use manager::{ChannelManager, Collaborators, WAITFORCHANGE_ALWAYS_BLOCK};
pub use onchain::{OnChainProcessor, OnChainUpdate, ProcessorError, TimedOut};
pub use rpc::{ChannelRpcServer, RpcError};
pub use state::{ChannelSnapshot, ChannelStatus, CurrentState, Dispute, DisputeView, PendingTxs};
pub use store::{ChannelData, ChannelStore, MemoryChannelStore};

pub mod prelude {
    pub use super::{
        config::*,
        manager::*,
        onchain::*,
        proof::*,
        rpc::*,
        signatures::*,
        state::{ChannelSnapshot, ChannelStatus, CurrentState, Dispute, DisputeView, PendingTxs},
        store::*,
    };
}

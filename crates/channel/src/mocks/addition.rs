//! This module contains a trivial game used to exercise the channel framework.
//!
//! The state is a pair of numbers, the "current number" and the turn count, serialized as
//! `"<number>,<turns>"`. It is the turn of participant `number % 2` until the number reaches
//! [FINAL_NUMBER], at which point the game is over. A move is a strictly positive decimal
//! number that gets added to the current number; every move increments the turn count.

use crate::{ChannelRpcServer, RpcError};
use alloy_primitives::Bytes;
use anyhow::Result;
use serde_json::{json, Value};
use std::{
    any::Any,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};
use tabletop_primitives::{
    BoardMove, BoardRules, BoardState, ChannelId, ChannelMetadata, MoveError, MoveSender,
    OpenChannel, ParseError, ParsedBoardState, ParticipantIndex, StateProof, TxId,
};
use tracing::{debug, info};

/// Once the number reaches this value, the game is finished.
pub const FINAL_NUMBER: u64 = 100;

/// Parses a canonical decimal number: digits only, no sign and no leading zeros.
fn parse_canonical(s: &str) -> Option<u64> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    canonical.then(|| s.parse().ok()).flatten()
}

/// The decoded state of the addition game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdditionState {
    pub number: u64,
    pub turns: u64,
}

impl AdditionState {
    pub fn new(number: u64, turns: u64) -> Self {
        Self { number, turns }
    }

    pub fn encode(&self) -> BoardState {
        Bytes::from(self.to_string().into_bytes())
    }
}

impl fmt::Display for AdditionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.number, self.turns)
    }
}

impl FromStr for AdditionState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, turns) = s
            .split_once(',')
            .ok_or_else(|| ParseError(format!("missing separator in {s:?}")))?;
        match (parse_canonical(number), parse_canonical(turns)) {
            (Some(number), Some(turns)) => Ok(Self { number, turns }),
            _ => Err(ParseError(format!("invalid numbers in {s:?}"))),
        }
    }
}

impl TryFrom<&BoardState> for AdditionState {
    type Error = ParseError;

    fn try_from(state: &BoardState) -> Result<Self, Self::Error> {
        std::str::from_utf8(state)
            .map_err(|_| ParseError("state is not valid UTF-8".to_string()))?
            .parse()
    }
}

impl ParsedBoardState for AdditionState {
    fn equals(&self, other: &BoardState) -> bool {
        AdditionState::try_from(other).is_ok_and(|other| other == *self)
    }

    fn whose_turn(&self) -> Option<ParticipantIndex> {
        (self.number < FINAL_NUMBER).then_some((self.number % 2) as ParticipantIndex)
    }

    fn turn_count(&self) -> u64 {
        self.turns
    }

    fn apply_move(&self, mv: &BoardMove) -> Result<BoardState, MoveError> {
        if self.is_final() {
            return Err(MoveError::Finished);
        }

        let amount = std::str::from_utf8(mv)
            .ok()
            .and_then(parse_canonical)
            .ok_or_else(|| MoveError::Malformed(format!("{mv:?} is not a decimal number")))?;
        if amount == 0 {
            return Err(MoveError::Illegal("moves must be strictly positive".to_string()));
        }

        let number = self
            .number
            .checked_add(amount)
            .ok_or_else(|| MoveError::Illegal("number overflows".to_string()))?;
        let turns = self
            .turns
            .checked_add(1)
            .ok_or_else(|| MoveError::Illegal("turn count overflows".to_string()))?;
        Ok(AdditionState::new(number, turns).encode())
    }

    fn to_json(&self) -> Value {
        json!({ "number": self.number, "turns": self.turns })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [BoardRules] of the addition game. Only two-party channels are supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdditionRules;

impl BoardRules for AdditionRules {
    fn parse_state(
        &self,
        _: &ChannelId,
        meta: &ChannelMetadata,
        state: &BoardState,
    ) -> Result<Box<dyn ParsedBoardState>, ParseError> {
        if meta.participants.len() != 2 {
            return Err(ParseError(format!(
                "expected two participants, got {}",
                meta.participants.len()
            )));
        }
        Ok(Box::new(AdditionState::try_from(state)?))
    }
}

/// [OpenChannel] policy of the addition game.
///
/// When the last digit of the number is 6 to 9, an automove of +2 is made. This covers both a
/// single automove (8 -> 10) and a chain of them (6 -> 8 -> 10). Once the game is finished,
/// a final number of exactly [FINAL_NUMBER] is sent on chain.
#[derive(Debug)]
pub struct AdditionChannel {
    automoves_enabled: AtomicBool,
}

impl Default for AdditionChannel {
    fn default() -> Self {
        Self {
            automoves_enabled: AtomicBool::new(true),
        }
    }
}

impl AdditionChannel {
    /// Enables or disables automoves and returns the previous setting. While disabled, no
    /// automove is ever made, which simulates games where automoves depend on local input.
    pub fn set_automoves_enabled(&self, enabled: bool) -> bool {
        self.automoves_enabled.swap(enabled, Ordering::SeqCst)
    }

    pub fn automoves_enabled(&self) -> bool {
        self.automoves_enabled.load(Ordering::SeqCst)
    }

    fn downcast(state: &dyn ParsedBoardState) -> Option<&AdditionState> {
        state.as_any().downcast_ref::<AdditionState>()
    }
}

#[async_trait::async_trait]
impl OpenChannel for AdditionChannel {
    fn resolution_move(&self, channel_id: &ChannelId, proof: &StateProof) -> Value {
        json!({ "r": { "id": channel_id, "proof": proof } })
    }

    fn dispute_move(&self, channel_id: &ChannelId, proof: &StateProof) -> Value {
        json!({ "d": { "id": channel_id, "proof": proof } })
    }

    fn maybe_auto_move(&self, state: &dyn ParsedBoardState) -> Option<BoardMove> {
        if !self.automoves_enabled() || state.is_final() {
            return None;
        }
        let state = Self::downcast(state)?;
        (6..=9)
            .contains(&(state.number % 10))
            .then(|| Bytes::from_static(b"2"))
    }

    async fn maybe_on_chain_move(
        &self,
        state: &dyn ParsedBoardState,
        sender: &dyn MoveSender,
    ) -> Result<Option<TxId>> {
        let Some(state) = Self::downcast(state) else {
            return Ok(None);
        };
        if state.number != FINAL_NUMBER {
            return Ok(None);
        }

        debug!(number = state.number, "sending final number on chain");
        let txid = sender.send_move(Value::from(state.number.to_string())).await?;
        Ok(Some(txid))
    }
}

/// RPC methods of the addition game.
impl<R: BoardRules> ChannelRpcServer<R, AdditionChannel> {
    /// Adds `amount` to the current number.
    pub async fn add(&self, amount: u64) -> Result<(), RpcError> {
        info!(amount, "RPC method called: add");
        if amount == 0 {
            return Err(RpcError::InvalidParams(
                "amount must be strictly positive".to_string(),
            ));
        }
        self.submit(Bytes::from(amount.to_string().into_bytes()))
            .await
    }

    /// Turns automoves on or off, then applies any automoves that are now due. If that fails,
    /// the previous setting is restored.
    pub async fn setautomoves(&self, enabled: bool) -> Result<(), RpcError> {
        info!(enabled, "RPC method called: setautomoves");
        let _guard = self.local_input().lock().await;
        let game = self.manager().game();
        if game.set_automoves_enabled(enabled) == enabled {
            return Err(RpcError::AlreadySet("automoves"));
        }
        if let Err(e) = self.manager().trigger_auto_moves().await {
            game.set_automoves_enabled(!enabled);
            return Err(Self::report(e));
        }
        Ok(())
    }
}

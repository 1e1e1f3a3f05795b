//! This module contains the [ChannelManager], which keeps the authoritative local view of a
//! single game channel and applies every local, off-chain and on-chain update to it.

use crate::{
    config::ChannelConfig,
    onchain::OnChainUpdate,
    proof::{extend_state_proof, verify_state_proof},
    state::{ChannelSnapshot, ChannelState, Dispute},
};
use alloy_primitives::Bytes;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tabletop_primitives::{
    BoardMove, BoardRules, BoardState, ChannelError, ChannelId, ChannelMetadata, MessageSigner,
    MoveError, MoveSender, OffChainBroadcast, OpenChannel, ParsedBoardState, ParticipantIndex,
    SignatureVerifier, StateProof, TxId,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Passing this as the known version to [ChannelManager::wait_for_change] always blocks until
/// the next change. Real versions start at 1.
pub const WAITFORCHANGE_ALWAYS_BLOCK: u64 = 0;

/// The external services a [ChannelManager] talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn SignatureVerifier>,
    pub signer: Arc<dyn MessageSigner>,
    pub sender: Arc<dyn MoveSender>,
    pub broadcast: Arc<dyn OffChainBroadcast>,
}

/// The [ChannelManager] struct serializes all updates to one channel.
///
/// Every mutating operation runs under the channel lock, on a copy of the current state. The
/// copy only replaces the state once all of its effects (signing, automoves, broadcasting and
/// on-chain submissions) succeeded, so a failed operation leaves the channel as it was. On-chain
/// updates are the exception: what the chain reports is always recorded. Each committed change
/// bumps the version and publishes a fresh [ChannelSnapshot].
pub struct ChannelManager<R, C> {
    id: ChannelId,
    player_name: String,
    rules: Arc<R>,
    game: Arc<C>,
    collaborators: Collaborators,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    updates: watch::Sender<Arc<ChannelSnapshot>>,
    stopped: AtomicBool,
}

impl<R, C> ChannelManager<R, C>
where
    R: BoardRules,
    C: OpenChannel,
{
    pub fn new(
        id: ChannelId,
        player_name: impl Into<String>,
        rules: Arc<R>,
        game: Arc<C>,
        collaborators: Collaborators,
        config: ChannelConfig,
    ) -> Self {
        let player_name = player_name.into();
        let state = ChannelState::new();
        let snapshot = state.snapshot(&id, &player_name, rules.as_ref(), config.dispute_blocks);
        let (updates, _) = watch::channel(Arc::new(snapshot));

        Self {
            id,
            player_name,
            rules,
            game,
            collaborators,
            config,
            state: Mutex::new(state),
            updates,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    /// Returns the game policy of this channel.
    pub fn game(&self) -> &Arc<C> {
        &self.game
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Returns the latest published snapshot. This never blocks on a running update.
    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.updates.borrow().clone()
    }

    /// Returns the latest published snapshot as JSON.
    pub fn to_json(&self) -> Value {
        match serde_json::to_value(self.snapshot().as_ref()) {
            Ok(json) => json,
            Err(e) => {
                error!(channel = %self.id, %e, "failed to serialize channel snapshot");
                Value::Null
            }
        }
    }

    /// Applies a move of the local player and broadcasts the extended state proof.
    pub async fn process_local_move(&self, mv: BoardMove) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        let meta = Self::require_meta(&state)?.clone();
        self.own_index(&meta)?;
        self.check_dispute_allows_move(&meta, &state)?;

        let mut next = state.clone();
        next.proof = extend_state_proof(
            self.collaborators.signer.as_ref(),
            self.rules.as_ref(),
            &self.id,
            &meta,
            &next.proof,
            &mv,
        )
        .await?;
        debug!(channel = %self.id, ?mv, "applied local move");

        self.settle(&meta, &mut next, true).await?;
        self.commit(&mut state, next);
        Ok(())
    }

    /// Ingests a state proof received from another participant.
    ///
    /// ### Takes
    /// - `reinit`: The reinitialization id the sender based its proof on.
    /// - `proof`: The sender's state proof.
    ///
    /// ### Returns
    /// - An error if the proof is invalid or not more advanced than the current one. In that
    ///   case the channel is left untouched.
    pub async fn process_off_chain(
        &self,
        reinit: &Bytes,
        proof: StateProof,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        let meta = Self::require_meta(&state)?.clone();
        if *reinit != meta.reinit {
            debug!(channel = %self.id, "ignoring state proof for another reinitialization");
            return Err(ChannelError::ReinitMismatch);
        }

        let current = self.parse(&meta, state.proof.latest_state())?.turn_count();
        let offered = self.parse(&meta, proof.latest_state())?.turn_count();
        if offered <= current {
            debug!(channel = %self.id, current, offered, "ignoring stale state proof");
            return Err(ChannelError::StaleProof { current, offered });
        }

        verify_state_proof(
            self.collaborators.verifier.as_ref(),
            self.rules.as_ref(),
            &self.id,
            &meta,
            &state.reinit_state,
            &proof,
        )
        .await
        .map_err(|e| {
            if matches!(e, ChannelError::Signature(_)) {
                warn!(channel = %self.id, %e, "rejected state proof");
            }
            e
        })?;

        let mut next = state.clone();
        next.proof = proof;
        next.unbroadcast = false;
        self.settle(&meta, &mut next, false).await?;
        self.commit(&mut state, next);
        Ok(())
    }

    /// Applies all automoves the game wants to make in the current state. Without any
    /// automove or other pending action, the channel and its version stay unchanged.
    pub async fn trigger_auto_moves(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.closed || state.meta.is_none() {
            return Ok(());
        }
        let meta = Self::require_meta(&state)?.clone();

        let mut next = state.clone();
        self.settle(&meta, &mut next, false).await?;
        self.commit(&mut state, next);
        Ok(())
    }

    /// Files a dispute with the best state proof we have and returns its transaction id.
    pub async fn file_dispute(&self) -> Result<TxId, ChannelError> {
        let mut state = self.state.lock().await;
        let meta = Self::require_meta(&state)?.clone();
        if state.dispute.is_some() || state.pending_dispute.is_some() {
            return Err(ChannelError::DisputeWindow);
        }

        let mut next = state.clone();
        let txid = self.send_dispute(&meta, &mut next).await?;
        self.commit(&mut state, next);
        Ok(txid)
    }

    /// Updates the channel with its current on-chain data.
    ///
    /// The on-chain data is recorded even if a follow-up action fails. Automoves that could
    /// not be broadcast are kept and sent again with the next update.
    pub async fn process_on_chain(&self, update: OnChainUpdate) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChannelError::Closed);
        }

        let on_chain = self.parse(&update.meta, update.proof.latest_state())?;
        let mut next = state.clone();
        next.exists_on_chain = true;
        next.block_height = next.block_height.max(update.height);

        let reinitialized = next
            .meta
            .as_ref()
            .map_or(true, |meta| meta.reinit != update.meta.reinit);
        if reinitialized {
            info!(channel = %self.id, height = update.height, "channel (re)initialized on chain");
            next.meta = Some(update.meta.clone());
            next.reinit_state = update.reinit_state;
            next.proof = update.proof;
            next.on_chain_move_turn = None;
            next.pending_resolution = None;
            next.unbroadcast = false;
        } else {
            let current = self.parse(&update.meta, next.proof.latest_state())?;
            if on_chain.turn_count() > current.turn_count() {
                debug!(
                    channel = %self.id,
                    turn = on_chain.turn_count(),
                    "on-chain state proof is more advanced"
                );
                next.proof = update.proof;
            }
        }

        match update.dispute_height {
            Some(height) => {
                next.dispute = Some(Dispute {
                    height: Some(height),
                    turn_count: on_chain.turn_count(),
                    whose_turn: on_chain.whose_turn(),
                });
                next.pending_dispute = None;
            }
            None => {
                let still_pending = match &next.pending_dispute {
                    Some(txid) => self.is_pending(txid).await?,
                    None => false,
                };
                if !still_pending {
                    next.dispute = None;
                    next.pending_dispute = None;
                    next.pending_resolution = None;
                }
            }
        }

        let outcome = self.settle_on_chain(&update.meta, &mut next).await;
        self.commit(&mut state, next);
        outcome
    }

    /// Marks the channel as closed once the chain no longer knows about it.
    pub async fn process_on_chain_non_existent(&self) {
        let mut state = self.state.lock().await;
        if state.closed || !state.exists_on_chain {
            return;
        }

        info!(channel = %self.id, "channel closed on chain");
        let mut next = state.clone();
        next.closed = true;
        next.exists_on_chain = false;
        next.dispute = None;
        next.pending_dispute = None;
        next.pending_resolution = None;
        self.commit(&mut state, next);
    }

    /// Records a new chain tip. With automatic disputes enabled, this files a dispute once the
    /// other side has been stalling for long enough.
    pub async fn process_block(&self, height: u64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.block_height = next.block_height.max(height);

        if let Some(limit) = self.config.auto_dispute_blocks {
            if let Some(meta) = self.stalled_meta(&next, limit)? {
                info!(channel = %self.id, height, "counterpart is stalling, filing dispute");
                self.send_dispute(&meta, &mut next).await?;
            }
        }

        self.commit(&mut state, next);
        Ok(())
    }

    /// Blocks until the version differs from `known_version`, or until the configured
    /// timeout elapsed, and returns the snapshot at that point.
    pub async fn wait_for_change(&self, known_version: u64) -> Arc<ChannelSnapshot> {
        self.wait_for_change_timeout(known_version, self.config.wait_for_change_timeout())
            .await
    }

    pub async fn wait_for_change_timeout(
        &self,
        known_version: u64,
        timeout: Duration,
    ) -> Arc<ChannelSnapshot> {
        let mut rx = self.updates.subscribe();
        let target = {
            let current = rx.borrow_and_update();
            if known_version != WAITFORCHANGE_ALWAYS_BLOCK && current.version != known_version {
                return current.clone();
            }
            current.version
        };
        if self.stopped.load(Ordering::SeqCst) {
            return self.snapshot();
        }

        let changed = async {
            rx.wait_for(|s| s.version != target || self.stopped.load(Ordering::SeqCst))
                .await
                .map(|snapshot| snapshot.clone())
        };
        // Bound to a local so that the timeout future is dropped before `rx`.
        let snapshot = match tokio::time::timeout(timeout, changed).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(_)) | Err(_) => self.snapshot(),
        };
        snapshot
    }

    /// Wakes up all waiters. Later calls to [Self::wait_for_change] return immediately.
    pub fn stop_updates(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.updates.send_modify(|_| {});
    }

    fn require_meta(state: &ChannelState) -> Result<&ChannelMetadata, ChannelError> {
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.meta.as_ref().ok_or(ChannelError::Unknown)
    }

    fn parse(
        &self,
        meta: &ChannelMetadata,
        state: &BoardState,
    ) -> Result<Box<dyn ParsedBoardState>, ChannelError> {
        Ok(self.rules.parse_state(&self.id, meta, state)?)
    }

    /// Returns the local participant index, making sure the signer can sign for it.
    fn own_index(&self, meta: &ChannelMetadata) -> Result<ParticipantIndex, ChannelError> {
        let index = meta
            .index_of_name(&self.player_name)
            .ok_or_else(|| ChannelError::NotParticipant(self.player_name.clone()))?;
        if meta.participants[index].address != self.collaborators.signer.address() {
            return Err(ChannelError::Signature(format!(
                "local signer cannot sign for {}",
                self.player_name
            )));
        }
        Ok(index)
    }

    /// Local moves during a dispute are only allowed to answer a dispute filed against us.
    fn check_dispute_allows_move(
        &self,
        meta: &ChannelMetadata,
        state: &ChannelState,
    ) -> Result<(), ChannelError> {
        if state.pending_dispute.is_some() {
            return Err(ChannelError::DisputeWindow);
        }
        let Some(dispute) = &state.dispute else {
            return Ok(());
        };

        let current = self.parse(meta, state.proof.latest_state())?;
        let own = meta.index_of_name(&self.player_name);
        if dispute.whose_turn.is_none()
            || dispute.whose_turn != own
            || current.turn_count() > dispute.turn_count
        {
            return Err(ChannelError::DisputeWindow);
        }
        Ok(())
    }

    /// Runs everything that follows a change of the proof: automoves, broadcasting our own
    /// extensions, the game's on-chain move and resolving disputes.
    async fn settle(
        &self,
        meta: &ChannelMetadata,
        next: &mut ChannelState,
        extended: bool,
    ) -> Result<(), ChannelError> {
        self.extend_and_broadcast(meta, next, extended).await?;
        self.maybe_on_chain_move(meta, next).await?;
        self.try_resolve_dispute(meta, next).await
    }

    /// Like [Self::settle], but a failed broadcast does not stop the on-chain actions. Answering
    /// a dispute only needs the chain, not the other participants.
    async fn settle_on_chain(
        &self,
        meta: &ChannelMetadata,
        next: &mut ChannelState,
    ) -> Result<(), ChannelError> {
        let unsent = match self.extend_and_broadcast(meta, next, false).await {
            Ok(()) => None,
            Err(e) if e.is_transient() => {
                warn!(channel = %self.id, %e, "could not broadcast state, continuing on chain");
                Some(e)
            }
            Err(e) => return Err(e),
        };

        self.maybe_on_chain_move(meta, next).await?;
        self.try_resolve_dispute(meta, next).await?;
        unsent.map_or(Ok(()), Err)
    }

    /// Applies due automoves and sends the proof to the other participants if we extended it.
    /// If sending fails, `next` keeps the extension and stays marked as unbroadcast.
    async fn extend_and_broadcast(
        &self,
        meta: &ChannelMetadata,
        next: &mut ChannelState,
        extended: bool,
    ) -> Result<(), ChannelError> {
        if self.check_dispute_allows_move(meta, next).is_ok()
            && self.apply_auto_moves(meta, &mut next.proof).await? > 0
        {
            next.unbroadcast = true;
        }
        next.unbroadcast |= extended;

        if next.unbroadcast {
            self.collaborators
                .broadcast
                .send_new_state(&meta.reinit, &next.proof)
                .await
                .map_err(ChannelError::External)?;
            next.unbroadcast = false;
        }
        Ok(())
    }

    /// Chains automoves onto `proof` until the game stops asking for them. On error, `proof`
    /// is left as it was.
    ///
    /// ### Returns
    /// - The number of automoves applied, or [ChannelError::AutoMoveLimit] if the game keeps
    ///   asking for more than the configured maximum.
    async fn apply_auto_moves(
        &self,
        meta: &ChannelMetadata,
        proof: &mut StateProof,
    ) -> Result<usize, ChannelError> {
        let Some(own) = meta.index_of_name(&self.player_name) else {
            return Ok(0);
        };

        let mut extended = proof.clone();
        let mut applied = 0;
        loop {
            let mv = {
                let current = self.parse(meta, extended.latest_state())?;
                if current.whose_turn() != Some(own) {
                    break;
                }
                match self.game.maybe_auto_move(current.as_ref()) {
                    Some(mv) => mv,
                    None => break,
                }
            };

            if applied >= self.config.max_auto_moves {
                warn!(channel = %self.id, applied, "automoves do not settle");
                return Err(ChannelError::AutoMoveLimit(self.config.max_auto_moves));
            }

            extended = extend_state_proof(
                self.collaborators.signer.as_ref(),
                self.rules.as_ref(),
                &self.id,
                meta,
                &extended,
                &mv,
            )
            .await?;
            debug!(channel = %self.id, ?mv, "applied automove");
            applied += 1;
        }
        *proof = extended;
        Ok(applied)
    }

    /// Asks the game for an on-chain move, at most once per turn.
    async fn maybe_on_chain_move(
        &self,
        meta: &ChannelMetadata,
        next: &mut ChannelState,
    ) -> Result<(), ChannelError> {
        let current = self.parse(meta, next.proof.latest_state())?;
        let turn = current.turn_count();
        if next.on_chain_move_turn == Some(turn) {
            return Ok(());
        }

        let sent = self
            .game
            .maybe_on_chain_move(current.as_ref(), self.collaborators.sender.as_ref())
            .await
            .map_err(ChannelError::External)?;
        if let Some(txid) = sent {
            info!(channel = %self.id, %txid, turn, "sent on-chain move");
            next.on_chain_move_turn = Some(turn);
        }
        Ok(())
    }

    /// Sends a resolution if a confirmed dispute is outstanding and our proof supersedes it.
    async fn try_resolve_dispute(
        &self,
        meta: &ChannelMetadata,
        next: &mut ChannelState,
    ) -> Result<(), ChannelError> {
        let Some(dispute) = &next.dispute else {
            return Ok(());
        };
        if dispute.height.is_none() {
            return Ok(());
        }
        let current = self.parse(meta, next.proof.latest_state())?;
        if current.turn_count() <= dispute.turn_count {
            return Ok(());
        }
        if let Some(txid) = &next.pending_resolution {
            if self.is_pending(txid).await? {
                debug!(channel = %self.id, %txid, "resolution is already pending");
                return Ok(());
            }
        }

        let mv = self.game.resolution_move(&self.id, &next.proof);
        let txid = self
            .collaborators
            .sender
            .send_move(mv)
            .await
            .map_err(ChannelError::External)?;
        info!(channel = %self.id, %txid, turn = current.turn_count(), "sent dispute resolution");
        next.pending_resolution = Some(txid);
        Ok(())
    }

    async fn send_dispute(
        &self,
        meta: &ChannelMetadata,
        next: &mut ChannelState,
    ) -> Result<TxId, ChannelError> {
        let current = self.parse(meta, next.proof.latest_state())?;
        if current.is_final() {
            return Err(MoveError::Finished.into());
        }

        let mv = self.game.dispute_move(&self.id, &next.proof);
        let txid = self
            .collaborators
            .sender
            .send_move(mv)
            .await
            .map_err(ChannelError::External)?;
        info!(channel = %self.id, %txid, turn = current.turn_count(), "filed dispute");

        next.pending_dispute = Some(txid);
        next.dispute = Some(Dispute {
            height: None,
            turn_count: current.turn_count(),
            whose_turn: current.whose_turn(),
        });
        Ok(txid)
    }

    /// Returns the metadata if it is the other side's turn and they have not made progress
    /// for at least `limit` blocks, and no dispute is already outstanding.
    fn stalled_meta(
        &self,
        state: &ChannelState,
        limit: u64,
    ) -> Result<Option<ChannelMetadata>, ChannelError> {
        let Some(meta) = &state.meta else {
            return Ok(None);
        };
        if state.closed || state.dispute.is_some() || state.pending_dispute.is_some() {
            return Ok(None);
        }

        let current = self.parse(meta, state.proof.latest_state())?;
        let theirs = match current.whose_turn() {
            Some(turn) => Some(turn) != meta.index_of_name(&self.player_name),
            None => false,
        };
        let stalled = state.block_height.saturating_sub(state.last_progress_height) >= limit;
        Ok((theirs && stalled).then(|| meta.clone()))
    }

    async fn is_pending(&self, txid: &TxId) -> Result<bool, ChannelError> {
        self.collaborators
            .sender
            .is_pending(txid)
            .await
            .map_err(ChannelError::External)
    }

    /// Replaces the state with `next`, bumping the version and notifying waiters if anything
    /// observable changed.
    fn commit(&self, state: &mut ChannelState, mut next: ChannelState) {
        if next.proof != state.proof {
            next.last_progress_height = next.block_height;
        }

        let changed = state.observably_differs(&next);
        next.version = if changed {
            state.version + 1
        } else {
            state.version
        };
        *state = next;

        if changed {
            let snapshot = state.snapshot(
                &self.id,
                &self.player_name,
                self.rules.as_ref(),
                self.config.dispute_blocks,
            );
            debug!(
                channel = %self.id,
                version = snapshot.version,
                turn = ?snapshot.current.as_ref().map(|c| c.turn_count),
                "channel state updated"
            );
            self.updates.send_replace(Arc::new(snapshot));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        mocks::{
            test_metadata, AdditionChannel, AdditionRules, MockBroadcast, MockMoveSender,
            MockSigner, MockVerifier, ALICE, BOB,
        },
        state::ChannelStatus,
    };
    use alloy_primitives::Address;
    use serde_json::json;

    type AdditionManager = ChannelManager<AdditionRules, AdditionChannel>;

    struct Harness {
        manager: Arc<AdditionManager>,
        verifier: Arc<MockVerifier>,
        signer: Arc<MockSigner>,
        sender: Arc<MockMoveSender>,
        broadcast: Arc<MockBroadcast>,
    }

    fn channel_id() -> ChannelId {
        ChannelId::repeat_byte(0x42)
    }

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn harness(player: &str, config: ChannelConfig) -> Harness {
        let address = if player == "alice" { ALICE } else { BOB };
        let verifier = Arc::new(MockVerifier::default());
        let signer = Arc::new(MockSigner::new(address));
        let sender = Arc::new(MockMoveSender::default());
        let broadcast = Arc::new(MockBroadcast::default());
        let collaborators = Collaborators {
            verifier: verifier.clone(),
            signer: signer.clone(),
            sender: sender.clone(),
            broadcast: broadcast.clone(),
        };
        let manager = Arc::new(ChannelManager::new(
            channel_id(),
            player,
            Arc::new(AdditionRules),
            Arc::new(AdditionChannel::default()),
            collaborators,
            config,
        ));
        Harness {
            manager,
            verifier,
            signer,
            sender,
            broadcast,
        }
    }

    fn update(height: u64, state: &'static str, dispute_height: Option<u64>) -> OnChainUpdate {
        OnChainUpdate {
            height,
            meta: test_metadata(),
            reinit_state: bytes(state),
            proof: StateProof::from_state(bytes(state)),
            dispute_height,
        }
    }

    /// Opens the channel at `state` without letting automoves run.
    async fn open_at(h: &Harness, state: &'static str) {
        let enabled = h.manager.game().set_automoves_enabled(false);
        h.manager.process_on_chain(update(1, state, None)).await.unwrap();
        h.manager.game().set_automoves_enabled(enabled);
    }

    fn latest(h: &Harness) -> BoardState {
        h.manager
            .snapshot()
            .current
            .as_ref()
            .unwrap()
            .proof
            .latest_state()
            .clone()
    }

    fn version(h: &Harness) -> u64 {
        h.manager.snapshot().version
    }

    /// Builds a proof from `start` with alternating moves, signed by whoever is to move.
    async fn remote_proof(start: &'static str, moves: &[&'static str]) -> StateProof {
        let meta = test_metadata();
        let mut proof = StateProof::from_state(bytes(start));
        for mv in moves {
            let parsed = AdditionRules
                .parse_state(&channel_id(), &meta, proof.latest_state())
                .unwrap();
            let mover = meta.participants[parsed.whose_turn().unwrap()].address;
            proof = extend_state_proof(
                &MockSigner::new(mover),
                &AdditionRules,
                &channel_id(),
                &meta,
                &proof,
                &bytes(mv),
            )
            .await
            .unwrap();
        }
        proof
    }

    #[tokio::test]
    async fn local_move_chains_automoves() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "6,3").await;
        let before = version(&h);

        h.manager.process_local_move(bytes("2")).await.unwrap();

        assert_eq!(latest(&h), bytes("10,5"));
        assert_eq!(version(&h), before + 1);
        let sent = h.broadcast.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, bytes("reinit"));
        assert_eq!(sent[0].1.transitions.len(), 2);
        assert!(h.sender.moves().await.is_empty());
    }

    #[tokio::test]
    async fn final_state_triggers_on_chain_move_once() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        open_at(&h, "98,10").await;

        h.manager.process_local_move(bytes("2")).await.unwrap();
        assert_eq!(latest(&h), bytes("100,11"));
        assert_eq!(h.sender.moves().await, vec![Value::from("100")]);

        let before = version(&h);
        h.manager.trigger_auto_moves().await.unwrap();
        assert_eq!(h.sender.moves().await.len(), 1);
        assert_eq!(version(&h), before);
    }

    #[tokio::test]
    async fn moves_require_our_turn() {
        let h = harness("bob", ChannelConfig::default());
        open_at(&h, "6,3").await;
        let before = version(&h);

        let err = h.manager.process_local_move(bytes("1")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Move(MoveError::NotYourTurn(1))));
        assert_eq!(version(&h), before);
        assert_eq!(latest(&h), bytes("6,3"));
        assert!(h.broadcast.sent().await.is_empty());
    }

    #[tokio::test]
    async fn operations_before_open_and_for_outsiders() {
        let h = harness("alice", ChannelConfig::default());
        assert!(matches!(
            h.manager.process_local_move(bytes("1")).await,
            Err(ChannelError::Unknown)
        ));
        assert!(matches!(
            h.manager.file_dispute().await,
            Err(ChannelError::Unknown)
        ));
        h.manager.trigger_auto_moves().await.unwrap();
        assert_eq!(version(&h), 1);

        let carol = harness("carol", ChannelConfig::default());
        open_at(&carol, "0,0").await;
        assert!(matches!(
            carol.manager.process_local_move(bytes("1")).await,
            Err(ChannelError::NotParticipant(_))
        ));
    }

    #[tokio::test]
    async fn ingests_more_advanced_remote_proofs_only() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        open_at(&h, "0,0").await;
        let before = version(&h);

        let proof = remote_proof("0,0", &["1", "3"]).await;
        h.manager
            .process_off_chain(&bytes("reinit"), proof.clone())
            .await
            .unwrap();
        assert_eq!(latest(&h), bytes("4,2"));
        assert_eq!(version(&h), before + 1);
        // Remote states are not broadcast again.
        assert!(h.broadcast.sent().await.is_empty());

        let calls = h.verifier.calls();
        let err = h
            .manager
            .process_off_chain(&bytes("reinit"), proof)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::StaleProof {
                current: 2,
                offered: 2
            }
        ));
        let shorter = remote_proof("0,0", &["1"]).await;
        assert!(matches!(
            h.manager.process_off_chain(&bytes("reinit"), shorter).await,
            Err(ChannelError::StaleProof { .. })
        ));
        assert_eq!(h.verifier.calls(), calls);
        assert_eq!(version(&h), before + 1);

        let longer = remote_proof("0,0", &["1", "3", "1"]).await;
        assert!(matches!(
            h.manager.process_off_chain(&bytes("other"), longer).await,
            Err(ChannelError::ReinitMismatch)
        ));
    }

    #[tokio::test]
    async fn rejects_proof_signed_by_outsider() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "0,0").await;
        let before = version(&h);

        let meta = test_metadata();
        let mut proof = remote_proof("0,0", &["1"]).await;
        proof.transitions[0].new_state.signatures = vec![crate::signatures::sign_data(
            &MockSigner::new(Address::repeat_byte(0x99)),
            &channel_id(),
            &meta,
            crate::signatures::STATE_TOPIC,
            &proof.transitions[0].new_state.data,
        )
        .await
        .unwrap()];

        let err = h
            .manager
            .process_off_chain(&bytes("reinit"), proof)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Signature(_)));
        assert_eq!(latest(&h), bytes("0,0"));
        assert_eq!(version(&h), before);
    }

    #[tokio::test]
    async fn rejects_proof_signed_for_other_channel() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "0,0").await;

        let meta = test_metadata();
        let other = ChannelId::repeat_byte(0x43);
        let proof = extend_state_proof(
            &MockSigner::new(ALICE),
            &AdditionRules,
            &other,
            &meta,
            &StateProof::from_state(bytes("0,0")),
            &bytes("1"),
        )
        .await
        .unwrap();

        let err = h
            .manager
            .process_off_chain(&bytes("reinit"), proof)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Signature(_)));
    }

    #[tokio::test]
    async fn trigger_auto_moves_is_idempotent() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "6,3").await;
        h.manager.game().set_automoves_enabled(false);
        let before = version(&h);

        h.manager.trigger_auto_moves().await.unwrap();
        assert_eq!(version(&h), before);

        h.manager.game().set_automoves_enabled(true);
        h.manager.trigger_auto_moves().await.unwrap();
        assert_eq!(latest(&h), bytes("10,5"));
        assert_eq!(version(&h), before + 1);
        assert_eq!(h.broadcast.sent().await.len(), 1);

        for _ in 0..3 {
            h.manager.trigger_auto_moves().await.unwrap();
        }
        assert_eq!(version(&h), before + 1);
        assert_eq!(h.broadcast.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn automoves_are_bounded() {
        let config = ChannelConfig {
            max_auto_moves: 1,
            ..Default::default()
        };
        let h = harness("alice", config);
        open_at(&h, "6,3").await;
        let before = version(&h);

        let err = h.manager.trigger_auto_moves().await.unwrap_err();
        assert!(matches!(err, ChannelError::AutoMoveLimit(1)));
        assert_eq!(latest(&h), bytes("6,3"));
        assert_eq!(version(&h), before);
    }

    #[tokio::test]
    async fn external_failures_leave_state_unchanged() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "0,0").await;
        let before = version(&h);

        h.signer.set_failing(true);
        let err = h.manager.process_local_move(bytes("2")).await.unwrap_err();
        assert!(err.is_transient());
        h.signer.set_failing(false);

        h.broadcast.set_failing(true);
        let err = h.manager.process_local_move(bytes("2")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(latest(&h), bytes("0,0"));
        assert_eq!(version(&h), before);
        h.broadcast.set_failing(false);

        h.manager.process_local_move(bytes("2")).await.unwrap();
        assert_eq!(latest(&h), bytes("2,1"));
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_block_dispute_answer() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "6,3").await;
        h.broadcast.set_failing(true);

        let err = h
            .manager
            .process_on_chain(update(5, "6,3", Some(5)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.status, ChannelStatus::DisputeFiled);
        assert!(snapshot.pending.resolution.is_some());
        assert_eq!(latest(&h), bytes("10,5"));
        let moves = h.sender.moves().await;
        assert_eq!(moves.len(), 1);
        assert!(moves[0].get("r").is_some());
        assert!(h.broadcast.sent().await.is_empty());

        // Once the peer is back, the automoves go out without a new version.
        h.broadcast.set_failing(false);
        let before = version(&h);
        h.manager.trigger_auto_moves().await.unwrap();
        let sent = h.broadcast.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.latest_state(), &bytes("10,5"));
        assert_eq!(version(&h), before);
        assert_eq!(h.sender.moves().await.len(), 1);

        h.manager.trigger_auto_moves().await.unwrap();
        assert_eq!(h.broadcast.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn waiters_see_next_version() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "0,0").await;
        let known = version(&h);

        // A stale known version returns right away.
        let snapshot = h.manager.wait_for_change(known - 1).await;
        assert_eq!(snapshot.version, known);

        let manager = h.manager.clone();
        let waiter = tokio::spawn(async move { manager.wait_for_change(known).await });
        let always = {
            let manager = h.manager.clone();
            tokio::spawn(async move {
                manager
                    .wait_for_change(WAITFORCHANGE_ALWAYS_BLOCK)
                    .await
            })
        };
        tokio::task::yield_now().await;

        h.manager.process_local_move(bytes("2")).await.unwrap();
        assert!(waiter.await.unwrap().version > known);
        assert!(always.await.unwrap().version > known);
    }

    #[tokio::test]
    async fn waiting_times_out_and_stops() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "0,0").await;
        let known = version(&h);

        let snapshot = h
            .manager
            .wait_for_change_timeout(known, Duration::from_millis(10))
            .await;
        assert_eq!(snapshot.version, known);

        let manager = h.manager.clone();
        let waiter = tokio::spawn(async move {
            manager
                .wait_for_change_timeout(known, Duration::from_secs(60))
                .await
        });
        tokio::task::yield_now().await;
        h.manager.stop_updates();
        assert_eq!(waiter.await.unwrap().version, known);

        let snapshot = h
            .manager
            .wait_for_change_timeout(WAITFORCHANGE_ALWAYS_BLOCK, Duration::from_secs(60))
            .await;
        assert_eq!(snapshot.version, known);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_moves_are_serialized() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        open_at(&h, "0,0").await;
        let before = version(&h);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.process_local_move(bytes("2")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(latest(&h), bytes("20,10"));
        assert_eq!(version(&h), before + 10);
        assert_eq!(h.broadcast.sent().await.len(), 10);
    }

    #[tokio::test]
    async fn own_dispute_blocks_moves() {
        let h = harness("alice", ChannelConfig::default());
        open_at(&h, "1,1").await;

        let txid = h.manager.file_dispute().await.unwrap();
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.status, ChannelStatus::DisputeFiled);
        assert_eq!(snapshot.pending.dispute, Some(txid));
        let moves = h.sender.moves().await;
        assert_eq!(moves[0]["d"]["id"], json!(channel_id()));

        assert!(matches!(
            h.manager.file_dispute().await,
            Err(ChannelError::DisputeWindow)
        ));

        // Still pending: an on-chain update without dispute keeps ours.
        h.manager.process_on_chain(update(2, "1,1", None)).await.unwrap();
        assert_eq!(h.manager.snapshot().status, ChannelStatus::DisputeFiled);

        // Confirmed.
        h.manager
            .process_on_chain(update(3, "1,1", Some(3)))
            .await
            .unwrap();
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.status, ChannelStatus::DisputeFiled);
        assert_eq!(snapshot.pending.dispute, None);
        assert_eq!(snapshot.dispute.as_ref().unwrap().expires, Some(13));
        assert!(matches!(
            h.manager.process_local_move(bytes("2")).await,
            Err(ChannelError::DisputeWindow)
        ));
    }

    #[tokio::test]
    async fn answers_dispute_with_resolution() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        h.manager
            .process_on_chain(update(5, "0,0", Some(5)))
            .await
            .unwrap();
        assert_eq!(h.manager.snapshot().status, ChannelStatus::DisputeFiled);

        h.manager.process_local_move(bytes("2")).await.unwrap();
        let moves = h.sender.moves().await;
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0]["r"]["proof"]["transitions"].as_array().unwrap().len(), 1);
        assert!(h.manager.snapshot().pending.resolution.is_some());

        // The answer is in; further moves wait for the dispute to clear.
        assert!(matches!(
            h.manager.process_local_move(bytes("2")).await,
            Err(ChannelError::DisputeWindow)
        ));

        // Pending resolutions are not sent twice.
        h.manager.trigger_auto_moves().await.unwrap();
        assert_eq!(h.sender.moves().await.len(), 1);

        h.sender.confirm_all().await;
        let resolved = remote_proof("0,0", &["2"]).await;
        h.manager
            .process_on_chain(OnChainUpdate {
                proof: resolved,
                ..update(6, "0,0", None)
            })
            .await
            .unwrap();
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.status, ChannelStatus::Open);
        assert!(snapshot.pending.resolution.is_none());
        h.manager.process_local_move(bytes("2")).await.unwrap();
        assert_eq!(latest(&h), bytes("4,2"));
    }

    #[tokio::test]
    async fn resolves_dispute_with_remote_proof() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        // Bob disputes at a state where it is our turn, but we already hold a newer state.
        h.manager
            .process_on_chain(update(5, "0,0", None))
            .await
            .unwrap();
        let proof = remote_proof("0,0", &["1", "1"]).await;
        h.manager
            .process_off_chain(&bytes("reinit"), proof)
            .await
            .unwrap();
        assert!(h.sender.moves().await.is_empty());

        h.manager
            .process_on_chain(update(6, "0,0", Some(6)))
            .await
            .unwrap();
        let moves = h.sender.moves().await;
        assert_eq!(moves.len(), 1);
        assert!(moves[0].get("r").is_some());
        assert!(h.manager.snapshot().dispute.as_ref().unwrap().can_resolve);
    }

    #[tokio::test]
    async fn reinitialization_resets_proof() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        open_at(&h, "0,0").await;
        h.manager.process_local_move(bytes("2")).await.unwrap();
        h.manager.process_local_move(bytes("2")).await.unwrap();
        assert_eq!(latest(&h), bytes("4,2"));

        // An older on-chain proof for the same epoch does not roll us back.
        h.manager
            .process_on_chain(update(5, "0,0", None))
            .await
            .unwrap();
        assert_eq!(latest(&h), bytes("4,2"));

        let mut reinit = update(10, "1,0", None);
        reinit.meta.reinit = bytes("second");
        h.manager.process_on_chain(reinit).await.unwrap();
        assert_eq!(latest(&h), bytes("1,0"));
        assert_eq!(
            h.manager.snapshot().meta.as_ref().unwrap().reinit,
            bytes("second")
        );
    }

    #[tokio::test]
    async fn closes_when_gone_from_chain() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.process_on_chain_non_existent().await;
        assert_eq!(version(&h), 1);

        open_at(&h, "0,0").await;
        h.manager.process_on_chain_non_existent().await;
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.status, ChannelStatus::Closed);
        assert!(!snapshot.exists_on_chain);

        assert!(matches!(
            h.manager.process_local_move(bytes("2")).await,
            Err(ChannelError::Closed)
        ));
        assert!(matches!(
            h.manager.process_on_chain(update(9, "0,0", None)).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn disputes_stalling_counterpart() {
        let config = ChannelConfig {
            auto_dispute_blocks: Some(3),
            ..Default::default()
        };
        let h = harness("alice", config);
        h.manager
            .process_on_chain(update(10, "1,1", None))
            .await
            .unwrap();
        let before = version(&h);

        h.manager.process_block(12).await.unwrap();
        assert!(h.sender.moves().await.is_empty());
        assert_eq!(version(&h), before);

        h.manager.process_block(13).await.unwrap();
        let moves = h.sender.moves().await;
        assert_eq!(moves.len(), 1);
        assert!(moves[0].get("d").is_some());
        assert_eq!(h.manager.snapshot().status, ChannelStatus::DisputeFiled);

        h.manager.process_block(20).await.unwrap();
        assert_eq!(h.sender.moves().await.len(), 1);
    }

    #[tokio::test]
    async fn json_snapshot() {
        let h = harness("alice", ChannelConfig::default());
        h.manager.game().set_automoves_enabled(false);
        open_at(&h, "6,3").await;

        let json = h.manager.to_json();
        assert_eq!(json["player_name"], "alice");
        assert_eq!(json["status"], "open");
        assert_eq!(json["exists_on_chain"], true);
        assert_eq!(json["current"]["board"], json!({ "number": 6, "turns": 3 }));
        assert_eq!(json["current"]["whose_turn"], 0);
        assert_eq!(json["version"], version(&h));
    }
}

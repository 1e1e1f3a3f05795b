//! This module contains the validation and extension of [StateProof]s.
//!
//! A state proof is only worth as much as its weakest link: the initial state must either be
//! the channel's reinitialization state or carry the signatures of every participant, and each
//! transition must be a legal move by the participant whose turn it was, who also has to have
//! signed the resulting state.

use crate::signatures::{sign_data, verify_participant_signatures, STATE_TOPIC};
use tabletop_primitives::{
    BoardMove, BoardRules, BoardState, ChannelError, ChannelId, ChannelMetadata, MessageSigner,
    MoveError, ParsedBoardState, SignatureVerifier, SignedData, StateProof, StateTransition,
};

/// Verifies a full [StateProof] for the given channel and returns its parsed end state.
///
/// ### Takes
/// - `reinit_state`: The on-chain starting state of the current channel epoch. A proof rooted
///   at this state does not need signatures on its initial state.
///
/// ### Returns
/// - The parsed latest state of the proof, or the first error found along the chain.
pub async fn verify_state_proof(
    verifier: &dyn SignatureVerifier,
    rules: &dyn BoardRules,
    channel_id: &ChannelId,
    meta: &ChannelMetadata,
    reinit_state: &BoardState,
    proof: &StateProof,
) -> Result<Box<dyn ParsedBoardState>, ChannelError> {
    let mut current = rules.parse_state(channel_id, meta, &proof.initial_state.data)?;

    let signers = verify_participant_signatures(
        verifier,
        channel_id,
        meta,
        STATE_TOPIC,
        &proof.initial_state,
    )
    .await?;
    if !current.equals(reinit_state) && signers.len() < meta.participants.len() {
        return Err(ChannelError::Signature(
            "initial state is not signed by all participants".to_string(),
        ));
    }

    for (i, transition) in proof.transitions.iter().enumerate() {
        let mover = current.whose_turn().ok_or(MoveError::Finished)?;
        let applied = current.apply_move(&transition.mv)?;

        let next = rules.parse_state(channel_id, meta, &transition.new_state.data)?;
        if !next.equals(&applied) {
            return Err(MoveError::Illegal(format!(
                "transition {i} claims a state the move does not lead to"
            ))
            .into());
        }

        let signers = verify_participant_signatures(
            verifier,
            channel_id,
            meta,
            STATE_TOPIC,
            &transition.new_state,
        )
        .await?;
        if !signers.contains(&mover) {
            return Err(ChannelError::Signature(format!(
                "transition {i} is not signed by participant {mover}"
            )));
        }

        current = next;
    }

    Ok(current)
}

/// Extends `proof` with a move by the local participant, signing the resulting state.
/// The input proof is expected to be valid already; it is not re-verified.
pub async fn extend_state_proof(
    signer: &dyn MessageSigner,
    rules: &dyn BoardRules,
    channel_id: &ChannelId,
    meta: &ChannelMetadata,
    proof: &StateProof,
    mv: &BoardMove,
) -> Result<StateProof, ChannelError> {
    let current = rules.parse_state(channel_id, meta, proof.latest_state())?;
    let mover = current.whose_turn().ok_or(MoveError::Finished)?;

    let own = meta.index_of_address(&signer.address()).ok_or_else(|| {
        ChannelError::Signature("the local signer is not a participant".to_string())
    })?;
    if own != mover {
        return Err(MoveError::NotYourTurn(own).into());
    }

    let new_state = current.apply_move(mv)?;
    let signature = sign_data(signer, channel_id, meta, STATE_TOPIC, &new_state).await?;

    let mut extended = proof.clone();
    extended.transitions.push(StateTransition {
        mv: mv.clone(),
        new_state: SignedData {
            data: new_state,
            signatures: vec![signature],
        },
    });
    Ok(extended)
}

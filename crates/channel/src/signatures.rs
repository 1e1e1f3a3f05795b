//! This module contains the construction of channel-bound signature messages and the
//! verification of participant signatures through a [SignatureVerifier].

use alloy_primitives::{keccak256, Bytes, B256};
use alloy_sol_types::{sol, SolType};
use std::collections::BTreeSet;
use tabletop_primitives::{
    ChannelError, ChannelId, ChannelMetadata, MessageSigner, ParticipantIndex, SignatureVerifier,
    SignedData,
};
use tracing::warn;

/// The topic under which board states in a state proof are signed.
pub const STATE_TOPIC: &str = "state";

/// `(channel id, keccak(reinit id), topic, keccak(data))`
type ChannelSignatureMessage = sol! { tuple(bytes32, bytes32, string, bytes32) };

/// Computes the message that is actually signed for `data` under `topic` in the given channel.
///
/// The message commits to the channel id and the reinitialization id of the current epoch,
/// so that a signature can neither be replayed in another channel nor after a reset of the
/// same channel, and to the topic, so that a signature made for one purpose cannot be used
/// for another.
pub fn channel_signature_message(
    channel_id: &ChannelId,
    meta: &ChannelMetadata,
    topic: &str,
    data: &[u8],
) -> B256 {
    let encoded = ChannelSignatureMessage::abi_encode(&(
        *channel_id,
        keccak256(&meta.reinit),
        topic.to_string(),
        keccak256(data),
    ));
    keccak256(encoded)
}

/// Verifies all signatures on `signed` and returns the set of participants that signed it.
///
/// Every signature must be valid and belong to a participant of the channel; a single
/// signature that does not is reported as [ChannelError::Signature].
pub async fn verify_participant_signatures(
    verifier: &dyn SignatureVerifier,
    channel_id: &ChannelId,
    meta: &ChannelMetadata,
    topic: &str,
    signed: &SignedData,
) -> Result<BTreeSet<ParticipantIndex>, ChannelError> {
    let message = channel_signature_message(channel_id, meta, topic, &signed.data);

    let mut signers = BTreeSet::new();
    for signature in &signed.signatures {
        let address = verifier
            .recover_address(&message, signature)
            .await
            .map_err(ChannelError::External)?;

        let Some(address) = address else {
            warn!(%channel_id, topic, "invalid signature on channel data");
            return Err(ChannelError::Signature("signature does not verify".to_string()));
        };
        let Some(index) = meta.index_of_address(&address) else {
            warn!(%channel_id, %address, "signature by an address outside the channel");
            return Err(ChannelError::Signature(format!(
                "{address} is not a participant of the channel"
            )));
        };

        signers.insert(index);
    }

    Ok(signers)
}

/// Signs `data` under `topic` for the given channel with the local signer.
pub async fn sign_data(
    signer: &dyn MessageSigner,
    channel_id: &ChannelId,
    meta: &ChannelMetadata,
    topic: &str,
    data: &[u8],
) -> Result<Bytes, ChannelError> {
    let message = channel_signature_message(channel_id, meta, topic, data);
    signer
        .sign_message(&message)
        .await
        .map_err(ChannelError::External)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mocks::{test_metadata, MockSigner, MockVerifier, ALICE, BOB};
    use alloy_primitives::Address;

    #[test]
    fn message_binds_channel_reinit_and_topic() {
        let meta = test_metadata();
        let id = ChannelId::repeat_byte(1);
        let base = channel_signature_message(&id, &meta, STATE_TOPIC, b"data");

        assert_eq!(
            base,
            channel_signature_message(&id, &meta, STATE_TOPIC, b"data")
        );
        assert_ne!(
            base,
            channel_signature_message(&ChannelId::repeat_byte(2), &meta, STATE_TOPIC, b"data")
        );
        assert_ne!(
            base,
            channel_signature_message(&id, &meta, "dispute", b"data")
        );
        assert_ne!(
            base,
            channel_signature_message(&id, &meta, STATE_TOPIC, b"other")
        );

        let mut reinit = meta.clone();
        reinit.reinit = Bytes::from_static(b"epoch 2");
        assert_ne!(
            base,
            channel_signature_message(&id, &reinit, STATE_TOPIC, b"data")
        );
    }

    #[tokio::test]
    async fn collects_signers() {
        let meta = test_metadata();
        let id = ChannelId::repeat_byte(1);
        let verifier = MockVerifier::default();

        let mut signed = SignedData::unsigned(Bytes::from_static(b"data"));
        for address in [BOB, ALICE] {
            let signer = MockSigner::new(address);
            signed
                .signatures
                .push(sign_data(&signer, &id, &meta, STATE_TOPIC, &signed.data).await.unwrap());
        }

        let signers = verify_participant_signatures(&verifier, &id, &meta, STATE_TOPIC, &signed)
            .await
            .unwrap();
        assert_eq!(signers.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn rejects_replay_in_other_channel() {
        let meta = test_metadata();
        let verifier = MockVerifier::default();
        let signer = MockSigner::new(ALICE);

        let mut signed = SignedData::unsigned(Bytes::from_static(b"data"));
        signed.signatures.push(
            sign_data(&signer, &ChannelId::repeat_byte(1), &meta, STATE_TOPIC, &signed.data)
                .await
                .unwrap(),
        );

        let err = verify_participant_signatures(
            &verifier,
            &ChannelId::repeat_byte(2),
            &meta,
            STATE_TOPIC,
            &signed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChannelError::Signature(_)));
    }

    #[tokio::test]
    async fn rejects_outsider_and_surfaces_verifier_failure() {
        let meta = test_metadata();
        let id = ChannelId::repeat_byte(1);
        let verifier = MockVerifier::default();

        let outsider = MockSigner::new(Address::repeat_byte(0xee));
        let mut signed = SignedData::unsigned(Bytes::from_static(b"data"));
        signed.signatures.push(
            sign_data(&outsider, &id, &meta, STATE_TOPIC, &signed.data)
                .await
                .unwrap(),
        );
        let err = verify_participant_signatures(&verifier, &id, &meta, STATE_TOPIC, &signed)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Signature(_)));

        verifier.set_failing(true);
        let err = verify_participant_signatures(&verifier, &id, &meta, STATE_TOPIC, &signed)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}

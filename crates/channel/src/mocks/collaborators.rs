//! In-memory implementations of the external collaborators of a channel.
//!
//! The mock signature scheme is deliberately transparent: a signature is the signer's address
//! followed by the signed message, and verification recovers the address whenever the message
//! part matches. This is enough to exercise all channel and topic binding logic.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use anyhow::{bail, Result};
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tabletop_primitives::{
    ChannelMetadata, MessageSigner, MoveSender, OffChainBroadcast, Participant, SignatureVerifier,
    StateProof, TxId,
};
use tokio::sync::Mutex;

const ADDRESS_LEN: usize = 20;

pub const ALICE: Address = Address::new([0xaa; 20]);
pub const BOB: Address = Address::new([0xbb; 20]);

/// Metadata of a two-party channel between "alice" ([ALICE]) and "bob" ([BOB]).
pub fn test_metadata() -> ChannelMetadata {
    ChannelMetadata::new(
        vec![
            Participant {
                name: "alice".to_string(),
                address: ALICE,
            },
            Participant {
                name: "bob".to_string(),
                address: BOB,
            },
        ],
        Bytes::from_static(b"reinit"),
    )
}

/// The [MockVerifier] recovers addresses from [MockSigner] signatures.
#[derive(Debug, Default)]
pub struct MockVerifier {
    failing: AtomicBool,
    calls: AtomicU64,
}

impl MockVerifier {
    /// Makes every following call fail as if the verification service were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of verification requests served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SignatureVerifier for MockVerifier {
    async fn recover_address(&self, message: &B256, signature: &[u8]) -> Result<Option<Address>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("verifier unavailable");
        }

        if signature.len() != ADDRESS_LEN + message.len()
            || &signature[ADDRESS_LEN..] != message.as_slice()
        {
            return Ok(None);
        }
        Ok(Some(Address::from_slice(&signature[..ADDRESS_LEN])))
    }
}

/// The [MockSigner] produces signatures that [MockVerifier] attributes to its address.
#[derive(Debug)]
pub struct MockSigner {
    address: Address,
    failing: AtomicBool,
}

impl MockSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MessageSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_message(&self, message: &B256) -> Result<Bytes> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("wallet locked");
        }
        Ok([self.address.as_slice(), message.as_slice()].concat().into())
    }
}

/// The [MockMoveSender] records submitted moves. Every transaction stays pending until
/// [MockMoveSender::confirm_all] is called.
#[derive(Debug, Default)]
pub struct MockMoveSender {
    moves: Mutex<Vec<Value>>,
    pending: Mutex<HashSet<TxId>>,
    nonce: AtomicU64,
    failing: AtomicBool,
}

impl MockMoveSender {
    /// Returns all moves submitted so far, in order.
    pub async fn moves(&self) -> Vec<Value> {
        self.moves.lock().await.clone()
    }

    /// Marks all submitted transactions as confirmed.
    pub async fn confirm_all(&self) {
        self.pending.lock().await.clear();
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MoveSender for MockMoveSender {
    async fn send_move(&self, mv: Value) -> Result<TxId> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("daemon unreachable");
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let txid = keccak256(nonce.to_be_bytes());
        self.moves.lock().await.push(mv);
        self.pending.lock().await.insert(txid);
        Ok(txid)
    }

    async fn is_pending(&self, txid: &TxId) -> Result<bool> {
        Ok(self.pending.lock().await.contains(txid))
    }
}

/// The [MockBroadcast] records every state proof sent to the other participants.
#[derive(Debug, Default)]
pub struct MockBroadcast {
    sent: Mutex<Vec<(Bytes, StateProof)>>,
    failing: AtomicBool,
}

impl MockBroadcast {
    pub async fn sent(&self) -> Vec<(Bytes, StateProof)> {
        self.sent.lock().await.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl OffChainBroadcast for MockBroadcast {
    async fn send_new_state(&self, reinit: &Bytes, proof: &StateProof) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("peer unreachable");
        }
        self.sent.lock().await.push((reinit.clone(), proof.clone()));
        Ok(())
    }
}

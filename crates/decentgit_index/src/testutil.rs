//! Signing helpers and an in-memory block source for unit tests.

use crate::chain::{Attestation, Block, BlockSource, FetchError, Transaction};
use crate::verify::canonical_message;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

/// Raw `x || y` hex, the form the signing CLI publishes.
pub(crate) fn public_key_hex(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    hex::encode(&point.as_bytes()[1..])
}

pub(crate) fn signed(key: &SigningKey, repo: &str, name: &str, old: &str, new: &str) -> Attestation {
    let mut att = Attestation {
        repo_id: repo.to_string(),
        ref_name: name.to_string(),
        old_commit: old.to_string(),
        new_commit: new.to_string(),
        signer_identity: public_key_hex(key),
        signature: String::new(),
    };
    let digest = Sha1::digest(canonical_message(&att).unwrap());
    let sig: Signature = key.sign_prehash(&digest).unwrap();
    att.signature = hex::encode(sig.to_bytes());
    att
}

pub(crate) fn block(index: u64, timestamp: i64, txs: Vec<Transaction>) -> Block {
    Block {
        index,
        timestamp,
        transactions: txs,
    }
}

pub(crate) fn commit(tag: &str) -> String {
    tag.repeat(40 / tag.len())
}

/// Serves whatever chain it currently holds; can be told to fail fetches.
#[derive(Default)]
pub(crate) struct MemorySource {
    chain: Mutex<Vec<Block>>,
    failures_left: AtomicU64,
    fetches: AtomicU64,
}

impl MemorySource {
    pub(crate) fn new(chain: Vec<Block>) -> Self {
        Self {
            chain: Mutex::new(chain),
            ..Default::default()
        }
    }

    pub(crate) fn set_chain(&self, chain: Vec<Block>) {
        *self.chain.lock().unwrap() = chain;
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.fail_next(if failing { u64::MAX } else { 0 });
    }

    /// Fail the next `n` fetches, then serve normally.
    pub(crate) fn fail_next(&self, n: u64) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BlockSource for MemorySource {
    async fn fetch_chain(&self) -> Result<Vec<Block>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FetchError::Status(503, "node unavailable".to_string()));
        }
        Ok(self.chain.lock().unwrap().clone())
    }
}

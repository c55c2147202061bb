//! SHA-256 fingerprint of the derived state, for comparing replicas.

use crate::store::{RefRow, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Checkpoint plus every ref row, ordered by `(repo_id, ref_name)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub checkpoint: u64,
    pub refs: Vec<RefRow>,
}

impl StateSnapshot {
    pub fn capture(store: &StateStore) -> Result<Self, StoreError> {
        Ok(Self {
            checkpoint: store.get_checkpoint()?,
            refs: store.list_refs(None)?,
        })
    }

    pub fn digest(&self) -> Result<String, DigestError> {
        let json = serde_json::to_value(self)?;
        let normalized = normalize_for_hash(&json)?;
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Normalize JSON for hashing: sorted keys, no whitespace.
pub fn normalize_for_hash(value: &serde_json::Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&sort_json_keys(value))
}

fn sort_json_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(m) => {
            let sorted: std::collections::BTreeMap<&String, serde_json::Value> =
                m.iter().map(|(k, v)| (k, sort_json_keys(v))).collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

/// Digest of the store's current checkpoint and ref table.
pub fn state_digest(store: &StateStore) -> Result<String, DigestError> {
    StateSnapshot::capture(store)?.digest()
}

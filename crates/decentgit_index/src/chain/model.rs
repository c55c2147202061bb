//! Block and transaction shapes served by the ledger node.
//!
//! Transactions arrive as loosely-typed JSON. They are classified exactly once,
//! at deserialization time, into a well-formed [`Attestation`] or an
//! [`Transaction::Unrecognized`] value that the replay engine ignores.

use serde::{Deserialize, Deserializer, Serialize};

/// Placeholder head for a ref that has never been attested.
pub const GENESIS_COMMIT: &str = "0000000000000000000000000000000000000000";

/// Body of `GET {node}/chain`.
#[derive(Clone, Debug, Deserialize)]
pub struct ChainResponse {
    pub chain: Vec<Block>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Block {
    pub index: u64,
    #[serde(deserialize_with = "de_epoch_seconds")]
    pub timestamp: i64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// Signed claim that `ref_name` of `repo_id` moved from `old_commit` to `new_commit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub repo_id: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub old_commit: String,
    pub new_commit: String,
    /// Hex-encoded P-256 public key.
    pub signer_identity: String,
    /// Hex-encoded raw `r || s` signature.
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum Transaction {
    Attestation(Attestation),
    Unrecognized(serde_json::Value),
}

impl Transaction {
    pub fn as_attestation(&self) -> Option<&Attestation> {
        match self {
            Transaction::Attestation(a) => Some(a),
            Transaction::Unrecognized(_) => None,
        }
    }
}

impl From<serde_json::Value> for Transaction {
    fn from(value: serde_json::Value) -> Self {
        match attestation_from_value(&value) {
            Some(att) => Transaction::Attestation(att),
            None => Transaction::Unrecognized(value),
        }
    }
}

impl From<Attestation> for Transaction {
    fn from(att: Attestation) -> Self {
        Transaction::Attestation(att)
    }
}

fn attestation_from_value(value: &serde_json::Value) -> Option<Attestation> {
    let obj = value.as_object()?;
    let field = |name: &str| obj.get(name).and_then(|v| v.as_str()).map(str::to_string);
    let att = Attestation {
        repo_id: field("repo_id")?,
        ref_name: field("ref")?,
        old_commit: field("old_commit")?,
        new_commit: field("new_commit")?,
        signer_identity: field("signer_identity")?,
        signature: field("signature")?,
    };
    if att.repo_id.is_empty() || att.ref_name.is_empty() {
        return None;
    }
    if !is_commit_hash(&att.old_commit) || !is_commit_hash(&att.new_commit) {
        return None;
    }
    Some(att)
}

/// 40 hex characters.
pub fn is_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// The node stamps blocks with `time.time()`, so floats show up; truncate to seconds.
fn de_epoch_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
    }
    match Raw::deserialize(d)? {
        Raw::Int(i) => Ok(i),
        Raw::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
        Raw::Float(f) => Err(serde::de::Error::custom(format!(
            "non-finite block timestamp {}",
            f
        ))),
    }
}

//! Ledger block model and fetching.

pub(crate) mod fetch;
mod model;

pub use fetch::{BlockSource, FetchConfig, FetchError, NodeClient, DEFAULT_NODE_URL};
pub use model::{is_commit_hash, Attestation, Block, ChainResponse, Transaction, GENESIS_COMMIT};

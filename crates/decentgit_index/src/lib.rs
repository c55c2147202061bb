//! decentgit_index — read replica of DeCentGit ref attestations.
//!
//! Replays signed "ref moved from A to B" attestations out of the ledger's
//! block sequence into a local SQLite table of current heads, with a
//! checkpoint so restarts resume where they left off.
//! Read-only with respect to the ledger; no signing, no consensus.

pub mod chain;
pub mod config;
pub mod digest;
pub mod replay;
pub mod scheduler;
pub mod store;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

pub use chain::{Attestation, Block, BlockSource, FetchConfig, NodeClient, Transaction, GENESIS_COMMIT};
pub use config::IndexerConfig;
pub use digest::{state_digest, StateSnapshot};
pub use replay::{CycleError, CycleReport, ReplayEngine};
pub use scheduler::Scheduler;
pub use store::{RefRow, StateStore, StoreError};

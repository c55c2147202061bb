//! One fetch-validate-commit pass over the ledger.
//!
//! Each new block is evaluated transaction by transaction and then committed
//! together with the checkpoint, so a crash loses at most the block in flight.

use crate::chain::{Attestation, Block, BlockSource, FetchError, Transaction};
use crate::store::{RefRow, StateStore, StoreError, MAX_BLOCK_INDEX};
use crate::verify::{self, Admission, Rejection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// What a cycle did. `checkpoint` is the last block durably committed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub starting_checkpoint: u64,
    pub checkpoint: u64,
    pub blocks_committed: u64,
    pub accepted: u64,
    pub rejected_signature: u64,
    pub rejected_stale: u64,
    pub rejected_fork: u64,
    pub unrecognized: u64,
}

impl CycleReport {
    fn record_rejection(&mut self, reason: &Rejection) {
        match reason {
            Rejection::InvalidSignature => self.rejected_signature += 1,
            Rejection::Stale => self.rejected_stale += 1,
            Rejection::Fork => self.rejected_fork += 1,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected_signature + self.rejected_stale + self.rejected_fork
    }
}

pub struct ReplayEngine<S> {
    source: S,
    store: StateStore,
}

impl<S: BlockSource> ReplayEngine<S> {
    pub fn new(source: S, store: StateStore) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch the chain, replay every block above the checkpoint in index order,
    /// committing each block atomically before moving to the next.
    ///
    /// A fetch error leaves the store untouched. A store error stops the cycle;
    /// blocks committed earlier in the same cycle stay committed.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let checkpoint = self.store.get_checkpoint()?;
        let mut report = CycleReport {
            starting_checkpoint: checkpoint,
            checkpoint,
            ..Default::default()
        };

        let chain = self.source.fetch_chain().await?;
        let mut new_blocks: Vec<Block> = chain
            .into_iter()
            .filter(|b| b.index > checkpoint)
            .collect();
        let unstorable = new_blocks.len();
        new_blocks.retain(|b| b.index <= MAX_BLOCK_INDEX);
        if new_blocks.len() != unstorable {
            warn!(
                skipped = unstorable - new_blocks.len(),
                max = MAX_BLOCK_INDEX,
                "skipping blocks whose index cannot be checkpointed"
            );
        }
        if new_blocks.is_empty() {
            debug!(checkpoint, "no new blocks");
            return Ok(report);
        }
        new_blocks.sort_by_key(|b| b.index);
        let fetched = new_blocks.len();
        new_blocks.dedup_by_key(|b| b.index);
        if new_blocks.len() != fetched {
            warn!(
                dropped = fetched - new_blocks.len(),
                "duplicate block indices in chain; keeping first of each"
            );
        }
        info!(count = new_blocks.len(), checkpoint, "processing new blocks");

        for block in &new_blocks {
            let updates = self.evaluate_block(block, &mut report)?;
            if let Err(e) = self.store.commit_block(&updates, block.index) {
                error!(block = block.index, error = %e, "commit failed; checkpoint not advanced");
                return Err(e.into());
            }
            report.blocks_committed += 1;
            report.checkpoint = block.index;
            debug!(block = block.index, updates = updates.len(), "block processed");
        }

        info!(
            checkpoint = report.checkpoint,
            accepted = report.accepted,
            rejected = report.rejected(),
            "cycle complete"
        );
        Ok(report)
    }

    /// Ref updates accepted from `block`, in transaction order.
    ///
    /// Heads accepted earlier in the same block are visible to later
    /// attestations, so a block may carry several consecutive moves of one ref.
    fn evaluate_block(
        &self,
        block: &Block,
        report: &mut CycleReport,
    ) -> Result<Vec<RefRow>, StoreError> {
        let mut staged: HashMap<(String, String), String> = HashMap::new();
        let mut updates = Vec::new();
        for tx in &block.transactions {
            let att = match tx {
                Transaction::Attestation(att) => att,
                Transaction::Unrecognized(_) => {
                    debug!(block = block.index, "skipping non-attestation transaction");
                    report.unrecognized += 1;
                    continue;
                }
            };
            let key = (att.repo_id.clone(), att.ref_name.clone());
            let current_head = match staged.get(&key) {
                Some(head) => head.clone(),
                None => self.store.get_head(&att.repo_id, &att.ref_name)?,
            };
            match evaluate_attestation(att, &current_head) {
                Admission::Accept => {
                    info!(
                        block = block.index,
                        repo_id = %att.repo_id,
                        ref_name = %att.ref_name,
                        new_commit = %att.new_commit,
                        "ref updated"
                    );
                    report.accepted += 1;
                    staged.insert(key, att.new_commit.clone());
                    updates.push(RefRow {
                        repo_id: att.repo_id.clone(),
                        ref_name: att.ref_name.clone(),
                        commit_hash: att.new_commit.clone(),
                        updated_at: block.timestamp,
                    });
                }
                Admission::Reject(reason) => {
                    warn!(
                        block = block.index,
                        repo_id = %att.repo_id,
                        ref_name = %att.ref_name,
                        %reason,
                        head = %current_head,
                        old_commit = %att.old_commit,
                        "attestation rejected"
                    );
                    report.record_rejection(&reason);
                }
            }
        }
        Ok(updates)
    }
}

/// Signature first, then chain-of-custody against `current_head`.
pub fn evaluate_attestation(att: &Attestation, current_head: &str) -> Admission {
    if !verify::verify(att) {
        return Admission::Reject(Rejection::InvalidSignature);
    }
    verify::admit(att, current_head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::GENESIS_COMMIT;
    use crate::testutil::{block, commit, signed, signing_key, MemorySource};
    use serde_json::json;

    fn engine(chain: Vec<Block>) -> ReplayEngine<MemorySource> {
        ReplayEngine::new(
            MemorySource::new(chain),
            StateStore::open_in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn genesis_then_fork_scenario() {
        let key = signing_key(1);
        let first = signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1"));
        let forked = signed(&key, "r1", "main", &commit("b2"), &commit("c3"));
        let e = engine(vec![
            block(1, 1000, vec![first.into()]),
            block(2, 2000, vec![forked.into()]),
        ]);

        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.checkpoint, 2);
        assert_eq!(report.blocks_committed, 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected_fork, 1);

        let row = e.store().get_ref("r1", "main").unwrap().unwrap();
        assert_eq!(row.commit_hash, commit("a1"));
        assert_eq!(row.updated_at, 1000);
        assert_eq!(e.store().get_checkpoint().unwrap(), 2);
    }

    #[tokio::test]
    async fn unseen_ref_needs_genesis_old_commit() {
        let key = signing_key(1);
        let att = signed(&key, "r1", "main", &commit("b2"), &commit("c3"));
        let e = engine(vec![block(1, 10, vec![att.into()])]);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected_fork, 1);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), GENESIS_COMMIT);
        assert_eq!(report.checkpoint, 1);
    }

    #[tokio::test]
    async fn rejected_transaction_does_not_block_the_rest_of_the_block() {
        let key = signing_key(1);
        let mut bad_sig = signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1"));
        bad_sig.new_commit = commit("ff");
        let good = signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1"));
        let other = signed(&key, "r2", "dev", GENESIS_COMMIT, &commit("d4"));
        let noise: Transaction = serde_json::from_value(json!({"sender": "a"})).unwrap();
        let e = engine(vec![block(
            1,
            10,
            vec![bad_sig.into(), noise, good.into(), other.into()],
        )]);

        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.rejected_signature, 1);
        assert_eq!(report.unrecognized, 1);
        assert_eq!(report.accepted, 2);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("a1"));
        assert_eq!(e.store().get_head("r2", "dev").unwrap(), commit("d4"));
    }

    #[tokio::test]
    async fn consecutive_moves_within_one_block_chain_together() {
        let key = signing_key(1);
        let e = engine(vec![block(
            1,
            10,
            vec![
                signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into(),
                signed(&key, "r1", "main", &commit("a1"), &commit("b2")).into(),
                // replays the first move against the staged head
                signed(&key, "r1", "main", GENESIS_COMMIT, &commit("b2")).into(),
            ],
        )]);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected_stale, 1);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("b2"));
    }

    #[tokio::test]
    async fn redelivered_blocks_are_not_reapplied() {
        let key = signing_key(1);
        let b1 = block(
            1,
            10,
            vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into()],
        );
        let e = engine(vec![b1.clone()]);
        e.run_cycle().await.unwrap();
        let before = e.store().list_refs(None).unwrap();

        // Same index, different content: must be filtered out by the checkpoint.
        let rewritten = block(
            1,
            99,
            vec![signed(&key, "r1", "main", &commit("a1"), &commit("ee")).into()],
        );
        e.source().set_chain(vec![rewritten]);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.blocks_committed, 0);
        assert_eq!(report.accepted, 0);
        assert_eq!(e.store().list_refs(None).unwrap(), before);
        assert_eq!(e.store().get_checkpoint().unwrap(), 1);
    }

    #[tokio::test]
    async fn unordered_chain_is_replayed_by_index() {
        let key = signing_key(1);
        let e = engine(vec![
            block(
                2,
                20,
                vec![signed(&key, "r1", "main", &commit("a1"), &commit("b2")).into()],
            ),
            block(
                1,
                10,
                vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into()],
            ),
        ]);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.accepted, 2);
        let row = e.store().get_ref("r1", "main").unwrap().unwrap();
        assert_eq!(row.commit_hash, commit("b2"));
        assert_eq!(row.updated_at, 20);
    }

    #[tokio::test]
    async fn empty_fetch_has_no_side_effects() {
        let e = engine(vec![]);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(e.store().get_checkpoint().unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_untouched() {
        let key = signing_key(1);
        let e = engine(vec![block(
            1,
            10,
            vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into()],
        )]);
        e.source().set_failing(true);
        assert!(matches!(e.run_cycle().await, Err(CycleError::Fetch(_))));
        assert_eq!(e.store().get_checkpoint().unwrap(), 0);
        assert!(e.store().list_refs(None).unwrap().is_empty());

        e.source().set_failing(false);
        assert_eq!(e.run_cycle().await.unwrap().checkpoint, 1);
    }

    #[tokio::test]
    async fn store_failure_keeps_earlier_blocks_and_retries_the_failing_one() {
        let key = signing_key(1);
        let e = engine(vec![
            block(
                1,
                10,
                vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into()],
            ),
            block(
                2,
                20,
                vec![
                    signed(&key, "r1", "main", &commit("a1"), &commit("b2")).into(),
                    signed(&key, "r1", "dev", GENESIS_COMMIT, &commit("d4")).into(),
                ],
            ),
        ]);
        e.store()
            .exec_raw(
                "CREATE TRIGGER refuse_dev BEFORE INSERT ON refs WHEN NEW.ref_name = 'dev'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        assert!(matches!(e.run_cycle().await, Err(CycleError::Store(_))));
        assert_eq!(e.store().get_checkpoint().unwrap(), 1);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("a1"));
        assert!(e.store().get_ref("r1", "dev").unwrap().is_none());

        e.store().exec_raw("DROP TRIGGER refuse_dev;").unwrap();
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.starting_checkpoint, 1);
        assert_eq!(report.checkpoint, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("b2"));
        assert_eq!(e.store().get_head("r1", "dev").unwrap(), commit("d4"));
    }

    #[tokio::test]
    async fn unstorable_block_indices_are_skipped() {
        let key = signing_key(1);
        let e = engine(vec![
            block(
                1,
                10,
                vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into()],
            ),
            block(
                u64::MAX,
                20,
                vec![signed(&key, "r1", "main", &commit("a1"), &commit("b2")).into()],
            ),
        ]);
        let first = e.run_cycle().await.unwrap();
        assert_eq!(first.blocks_committed, 1);
        assert_eq!(first.checkpoint, 1);
        let again = e.run_cycle().await.unwrap();
        assert_eq!(again.blocks_committed, 0);
        assert_eq!(again.checkpoint, 1);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("a1"));
    }

    #[tokio::test]
    async fn duplicate_indices_keep_first_block() {
        let key = signing_key(1);
        let e = engine(vec![
            block(
                1,
                10,
                vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("a1")).into()],
            ),
            block(
                1,
                11,
                vec![signed(&key, "r1", "main", GENESIS_COMMIT, &commit("b2")).into()],
            ),
        ]);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.blocks_committed, 1);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("a1"));
    }

    #[tokio::test]
    async fn accepted_heads_form_a_chain_per_ref() {
        let key = signing_key(3);
        let commits: Vec<String> = ["a1", "b2", "c3", "d4", "e5"].iter().map(|t| commit(t)).collect();
        let mut blocks = Vec::new();
        let mut prev = GENESIS_COMMIT.to_string();
        for (i, c) in commits.iter().enumerate() {
            let mut txs: Vec<Transaction> = vec![signed(&key, "r1", "main", &prev, c).into()];
            // a replay of the very first move rides along in each later block
            if i > 0 {
                txs.push(signed(&key, "r1", "main", GENESIS_COMMIT, &commits[0]).into());
            }
            blocks.push(block(i as u64 + 1, 100 + i as i64, txs));
            prev = c.clone();
        }
        let e = engine(blocks);
        let report = e.run_cycle().await.unwrap();
        assert_eq!(report.accepted, 5);
        assert_eq!(report.rejected(), 4);
        assert_eq!(e.store().get_head("r1", "main").unwrap(), commit("e5"));
        assert_eq!(e.store().get_checkpoint().unwrap(), 5);
    }
}

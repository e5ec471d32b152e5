//! Fork-choice synchronization against a single peer.
//!
//! Given a peer's claimed chain tip, [`Synchronizer::synchronize`] finds
//! the most recent block both chains share, compares cumulative chain
//! weight over the divergent range (lower is more favorable), and either
//! rejects the peer's chain or orphans back to the common block and
//! replays the peer's blocks — all under the blockchain lock.
//!
//! Applied blocks are committed **incrementally, one at a time**. A crash
//! or shutdown mid-batch leaves the chain at a valid-but-partial height
//! rather than rolled back to the pre-sync tip; the next round continues
//! from there. This mirrors long-observed behavior of the reference
//! network and is deliberate.

use std::sync::Arc;

use forge_consensus::{chain_weight, populate_minter_levels};
use forge_network::{CommonBlockData, Peer};
use forge_store::{effective_minter_level, AccountStore, ChainStore};
use forge_types::{Block, BlockSignature, BlockSummary, Timestamp};

use crate::blockchain_lock::BlockchainLock;
use crate::config::NodeConfig;
use crate::invalid_memory::InvalidSignatureMemory;
use crate::shutdown::ShutdownController;
use crate::validation::{validate_block, verify_block_signature};

/// Outcome of one synchronization attempt, reported to the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SynchronizationResult {
    /// The peer's chain was applied (or partially applied) locally.
    Ok,
    /// Peer and local chain already agree up to the peer's tip.
    NothingToDo,
    /// The peer has nothing beyond a genesis block.
    GenesisOnly,
    /// No shared history with this peer at all.
    NoCommonBlock,
    /// The common block is too far behind our tip to follow the peer.
    TooDivergent,
    /// The peer stopped answering mid-negotiation.
    NoReply,
    /// Our subchain is at least as favorable; nothing was mutated.
    InferiorChain,
    /// The peer delivered data that failed validation.
    InvalidData,
    /// The blockchain lock could not be acquired in time (not the peer's
    /// fault).
    NoBlockchainLock,
    /// Local storage failed mid-operation.
    RepositoryIssue,
    /// Cooperative shutdown interrupted the attempt at a committed
    /// boundary.
    ShuttingDown,
}

impl std::fmt::Display for SynchronizationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Internal helpers abort with the result to report.
type SyncStep<T> = Result<T, SynchronizationResult>;

pub struct Synchronizer {
    chain: Arc<dyn ChainStore>,
    accounts: Arc<dyn AccountStore>,
    lock: Arc<BlockchainLock>,
    shutdown: Arc<ShutdownController>,
    invalid_memory: InvalidSignatureMemory,
    config: Arc<NodeConfig>,
}

impl Synchronizer {
    pub fn new(
        chain: Arc<dyn ChainStore>,
        accounts: Arc<dyn AccountStore>,
        lock: Arc<BlockchainLock>,
        shutdown: Arc<ShutdownController>,
        invalid_memory: InvalidSignatureMemory,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self {
            chain,
            accounts,
            lock,
            shutdown,
            invalid_memory,
            config,
        }
    }

    /// Attempt to synchronize with `peer`.
    ///
    /// `force` skips the weight comparison and the divergence limit —
    /// used by an operator explicitly re-pointing the node at a chain.
    pub async fn synchronize(&self, peer: &Peer, force: bool) -> SynchronizationResult {
        let Some(_guard) = self.lock.try_acquire(self.config.sync_lock_timeout()).await else {
            tracing::trace!("synchronizer couldn't acquire blockchain lock");
            return SynchronizationResult::NoBlockchainLock;
        };

        let result = match self.synchronize_inner(peer, force).await {
            Ok(()) => SynchronizationResult::Ok,
            Err(result) => result,
        };

        // Free any staged-but-uncommitted repository state on every exit
        // path, before the lock is released.
        if let Err(e) = self.chain.discard() {
            tracing::warn!(error = %e, "failed to discard staged repository state");
        }

        result
    }

    async fn synchronize_inner(&self, peer: &Peer, force: bool) -> SyncStep<()> {
        let our_latest = self.last_block()?;
        let our_initial_height = our_latest.height;

        let Some(tip_claim) = peer.chain_tip() else {
            tracing::debug!(peer = peer.id(), "peer has no chain tip claim yet");
            return Err(SynchronizationResult::NoReply);
        };
        let mut peer_height = tip_claim.height;

        tracing::info!(
            peer = peer.id(),
            peer_height,
            peer_sig = %tip_claim.signature,
            our_height = our_initial_height,
            our_sig = %our_latest.signature,
            "synchronizing with peer"
        );

        self.invalid_memory.purge_expired(Timestamp::now());

        let mut peer_summaries = match self
            .fetch_summaries_from_common_block(peer, our_initial_height, force)
            .await
        {
            Ok(summaries) => summaries,
            Err(result) => {
                // Our idea of this peer's common block is no longer usable.
                peer.set_common_block_data(None);
                return Err(result);
            }
        };

        // First summary is the common block itself.
        let common_summary = peer_summaries.remove(0);
        let common_block = self
            .chain
            .block_by_signature(&common_summary.signature)
            .map_err(|e| self.repository_issue(e))?
            .ok_or(SynchronizationResult::RepositoryIssue)?;
        tracing::debug!(
            peer = peer.id(),
            common_height = common_block.height,
            common_sig = %common_block.signature,
            "common block found"
        );

        // A common block above the claimed height means the peer synced
        // very recently; trust the higher value.
        if common_block.height > peer_height {
            peer_height = common_block.height;
        }

        // Same, or longer, chain than the peer.
        if common_block.height == peer_height {
            return Err(SynchronizationResult::NothingToDo);
        }

        if !force && our_initial_height > common_block.height {
            self.compare_chains(
                peer,
                &common_block,
                &our_latest,
                peer_height,
                &mut peer_summaries,
            )
            .await?;
        }

        if common_block.height < our_initial_height {
            self.sync_to_peer_chain(
                peer,
                &common_block,
                our_initial_height,
                peer_height,
                peer_summaries,
            )
            .await?;
        } else {
            self.apply_new_blocks(peer, &common_block, peer_height, peer_summaries)
                .await?;
        }

        self.chain.save().map_err(|e| self.repository_issue(e))?;

        let new_latest = self.last_block()?;
        tracing::info!(
            peer = peer.id(),
            height = new_latest.height,
            sig = %new_latest.signature,
            reorg = our_initial_height.saturating_sub(common_block.height),
            "synchronized with peer"
        );
        Ok(())
    }

    /// Find the common block by probing backward from our tip with an
    /// exponentially growing step, requesting summaries after each probe
    /// point. Returns the peer's summaries starting **at** the common
    /// block, so round-trips stay O(log divergence).
    async fn fetch_summaries_from_common_block(
        &self,
        peer: &Peer,
        our_height: u64,
        force: bool,
    ) -> SyncStep<Vec<BlockSummary>> {
        let mut step = self.config.initial_probe_step;
        let mut test_height = our_height.saturating_sub(step).max(1);

        let (test_block, batch) = loop {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }

            let test_block = self
                .chain
                .block_by_height(test_height)
                .map_err(|e| self.repository_issue(e))?
                .ok_or_else(|| {
                    tracing::error!(
                        test_height,
                        "missing local block below tip during common-block search"
                    );
                    SynchronizationResult::RepositoryIssue
                })?;

            tracing::trace!(peer = peer.id(), test_height, step, "probing for common block");
            let Some(batch) = peer
                .get_block_summaries(&test_block.signature, step as u32)
                .await
            else {
                tracing::info!(peer = peer.id(), "no reply while searching for common block");
                return Err(SynchronizationResult::NoReply);
            };

            if !batch.is_empty() {
                // Summaries must directly follow the probe point.
                check_consecutive_heights(&batch, test_height)?;
                break (test_block, batch);
            }

            // Empty batch: peer is unaware of this signature, probe deeper.
            if test_height == 1 {
                tracing::info!(peer = peer.id(), "no common block with peer");
                return Err(SynchronizationResult::NoCommonBlock);
            }
            if !force && test_height < our_height.saturating_sub(self.config.max_common_divergence)
            {
                tracing::info!(peer = peer.id(), "blockchain too divergent with peer");
                return Err(SynchronizationResult::TooDivergent);
            }

            step = (step << 1).min(self.config.max_probe_step);
            test_height = test_height.saturating_sub(step).max(1);
        };

        // Prepend the probe block: summaries returned are *after* it.
        let mut summaries = Vec::with_capacity(batch.len() + 1);
        summaries.push(test_block.summary());
        summaries.extend(batch);

        // Advance past the prefix we already share, so the first retained
        // summary is the actual common block.
        let mut shared = 1;
        while shared < summaries.len() {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }
            if !self
                .chain
                .contains(&summaries[shared].signature)
                .map_err(|e| self.repository_issue(e))?
            {
                break;
            }
            shared += 1;
        }
        summaries.drain(..shared - 1);

        Ok(summaries)
    }

    /// Compare cumulative chain weight over the divergent range, up to the
    /// highest mutual height. Caches the comparison on the peer for the
    /// block minter, then aborts with `InferiorChain` unless the peer's
    /// subchain is strictly more favorable (strictly lower weight).
    async fn compare_chains(
        &self,
        peer: &Peer,
        common_block: &Block,
        our_latest: &Block,
        peer_height: u64,
        peer_summaries: &mut Vec<BlockSummary>,
    ) -> SyncStep<()> {
        let now = Timestamp::now();

        // If our own tip is stale we are in no position to defend our
        // fork: skip the comparison and take the peer's chain.
        if our_latest
            .timestamp
            .has_expired(self.config.stale_tip_threshold_secs, now)
        {
            tracing::info!(
                common_height = common_block.height,
                "our tip is stale, ditching our fork after the common block"
            );
            return Ok(());
        }

        tracing::debug!(
            peer = peer.id(),
            from_height = common_block.height + 1,
            "comparing chains with peer"
        );

        // Complete the peer's summaries over the whole claimed range.
        let peer_block_count = peer_height - common_block.height;
        while (peer_summaries.len() as u64) < peer_block_count {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }

            let last_height = common_block.height + peer_summaries.len() as u64;
            let previous_signature = peer_summaries
                .last()
                .map(|s| s.signature)
                .unwrap_or(common_block.signature);
            let remaining = peer_block_count - peer_summaries.len() as u64;
            let count = remaining.min(self.config.max_request_size as u64) as u32;

            let more = peer.get_block_summaries(&previous_signature, count).await;
            let Some(more) = more.filter(|m| !m.is_empty()) else {
                tracing::info!(
                    peer = peer.id(),
                    after_height = last_height,
                    "peer failed to respond with block summaries"
                );
                return Err(SynchronizationResult::NoReply);
            };
            check_consecutive_heights(&more, last_height)?;
            peer_summaries.extend(more);
        }

        let mut our_summaries = self
            .chain
            .block_summaries(common_block.height + 1, our_latest.height)
            .map_err(|e| self.repository_issue(e))?;

        let resolver = |key: &forge_types::PublicKey| {
            effective_minter_level(self.accounts.as_ref(), key).unwrap_or(0)
        };
        populate_minter_levels(&mut our_summaries, resolver);
        populate_minter_levels(peer_summaries, resolver);

        let mutual_height =
            common_block.height + our_summaries.len().min(peer_summaries.len()) as u64;
        let our_weight = chain_weight(
            common_block.height,
            &common_block.signature,
            &our_summaries,
            mutual_height,
        );
        let peer_weight = chain_weight(
            common_block.height,
            &common_block.signature,
            peer_summaries,
            mutual_height,
        );

        // Cache the comparison for the minter's arbitration step.
        peer.set_common_block_data(Some(CommonBlockData {
            common_block_summary: common_block.summary(),
            summaries_after_common: Some(peer_summaries.clone()),
            chain_weight: Some(peer_weight.clone()),
        }));

        tracing::debug!(
            peer = peer.id(),
            our_weight = %our_weight,
            peer_weight = %peer_weight,
            mutual_height,
            "cumulative chain weights (lower is more favorable)"
        );

        // Ties keep the local chain.
        if our_weight <= peer_weight {
            tracing::debug!(peer = peer.id(), "not synchronizing, our chain is no less favorable");
            return Err(SynchronizationResult::InferiorChain);
        }

        Ok(())
    }

    /// Fork switch: download the peer's blocks, then orphan back to the
    /// common block in descending height order, then apply the downloaded
    /// blocks ascending — committing after every single orphan/apply.
    async fn sync_to_peer_chain(
        &self,
        peer: &Peer,
        common_block: &Block,
        our_initial_height: u64,
        peer_height: u64,
        peer_summaries: Vec<BlockSummary>,
    ) -> SyncStep<()> {
        tracing::debug!(
            peer = peer.id(),
            common_height = common_block.height,
            common_sig = %common_block.signature,
            "fetching peer chain for fork switch"
        );

        // Leftover summaries double as the first signatures to request.
        let mut pending_signatures: Vec<BlockSignature> =
            peer_summaries.iter().map(|s| s.signature).collect();
        let mut peer_blocks: Vec<Block> = Vec::new();
        let mut height = common_block.height;
        let mut latest_signature = common_block.signature;
        let mut retry_count = 0u32;

        // Fetch everything before mutating anything. Bounded by the
        // divergence limit so a distant tip cannot balloon memory.
        while height < peer_height && (peer_blocks.len() as u64) <= self.config.max_common_divergence
        {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }

            if pending_signatures.is_empty() {
                let remaining = peer_height - height;
                let count = remaining.min(self.config.max_request_size as u64) as u32;
                if count == 0 {
                    break;
                }
                tracing::trace!(
                    peer = peer.id(),
                    after_height = height,
                    count,
                    "requesting block signatures"
                );
                match peer.get_signatures(&latest_signature, count).await {
                    Some(signatures) if !signatures.is_empty() => {
                        pending_signatures = signatures;
                    }
                    _ => {
                        tracing::info!(
                            peer = peer.id(),
                            after_height = height,
                            "peer failed to respond with more block signatures"
                        );
                        // The cached summary list is likely stale too.
                        if let Some(mut data) = peer.common_block_data() {
                            data.summaries_after_common = None;
                            peer.set_common_block_data(Some(data));
                        }
                        if self.partial_apply_helps(&peer_blocks)? {
                            break;
                        }
                        return Err(SynchronizationResult::NoReply);
                    }
                }
            }

            // Refuse to orphan our chain for blocks already known bad.
            if self.invalid_memory.contains_any(&pending_signatures) {
                tracing::info!(peer = peer.id(), "peer sent known-invalid block signature");
                return Err(SynchronizationResult::InvalidData);
            }

            let next_signature = pending_signatures[0];
            let next_height = height + 1;

            tracing::trace!(peer = peer.id(), next_height, sig = %next_signature, "fetching block");
            let Some(block) = peer.get_block(&next_signature).await else {
                tracing::info!(
                    peer = peer.id(),
                    next_height,
                    sig = %next_signature,
                    "peer failed to respond with block"
                );
                if retry_count >= self.config.max_block_retries {
                    if self.partial_apply_helps(&peer_blocks)? {
                        break;
                    }
                    return Err(SynchronizationResult::NoReply);
                }
                // Re-fetch signatures in case the peer moved to another fork.
                pending_signatures.clear();
                retry_count += 1;
                tracing::info!(
                    peer = peer.id(),
                    attempts_remaining = self.config.max_block_retries - retry_count,
                    "re-issuing block request"
                );
                continue;
            };
            retry_count = 0;

            if block.signature != next_signature || !verify_block_signature(&block) {
                tracing::info!(
                    peer = peer.id(),
                    next_height,
                    "peer sent block with invalid signature"
                );
                return Err(SynchronizationResult::InvalidData);
            }

            peer_blocks.push(block);
            height = next_height;
            latest_signature = next_signature;
            pending_signatures.remove(0);
        }

        if peer_blocks.is_empty() {
            // Never unwind without replacement blocks in hand.
            return Err(SynchronizationResult::NoReply);
        }

        // Unwind to the common block, committing each orphan.
        tracing::debug!(
            common_height = common_block.height,
            our_height = our_initial_height,
            "orphaning blocks back to common block"
        );
        let mut our_height = our_initial_height;
        while our_height > common_block.height {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }
            let orphaned = self
                .chain
                .orphan_last_block()
                .map_err(|e| self.repository_issue(e))?;
            self.chain.save().map_err(|e| self.repository_issue(e))?;
            tracing::trace!(height = orphaned.height, sig = %orphaned.signature, "orphaned block");
            our_height -= 1;
        }

        self.apply_fetched_blocks(peer, common_block, peer_blocks)
    }

    /// Forward extension (the common block is our tip): fetch signatures
    /// and blocks in bounded batches, validating and committing per block.
    async fn apply_new_blocks(
        &self,
        peer: &Peer,
        common_block: &Block,
        peer_height: u64,
        peer_summaries: Vec<BlockSummary>,
    ) -> SyncStep<()> {
        tracing::debug!(peer = peer.id(), "fetching new blocks from peer");

        let mut pending_signatures: Vec<BlockSignature> =
            peer_summaries.iter().map(|s| s.signature).collect();
        let mut parent = common_block.clone();
        let max_batch_height = common_block.height + self.config.sync_batch_size;

        while parent.height < peer_height && parent.height < max_batch_height {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }

            if pending_signatures.is_empty() {
                let remaining = (max_batch_height - parent.height)
                    .min(self.config.max_request_size as u64) as u32;
                match peer.get_signatures(&parent.signature, remaining).await {
                    Some(signatures) if !signatures.is_empty() => {
                        pending_signatures = signatures;
                    }
                    _ => {
                        tracing::info!(
                            peer = peer.id(),
                            after_height = parent.height,
                            "peer failed to respond with more block signatures"
                        );
                        return Err(SynchronizationResult::NoReply);
                    }
                }
            }

            let next_signature = pending_signatures.remove(0);
            let next_height = parent.height + 1;

            let Some(block) = peer.get_block(&next_signature).await else {
                tracing::info!(
                    peer = peer.id(),
                    next_height,
                    "peer failed to respond with block"
                );
                return Err(SynchronizationResult::NoReply);
            };

            if block.signature != next_signature || !verify_block_signature(&block) {
                tracing::info!(
                    peer = peer.id(),
                    next_height,
                    "peer sent block with invalid signature"
                );
                return Err(SynchronizationResult::InvalidData);
            }

            self.validate_and_commit(peer, &parent, &block)?;
            parent = block;
        }

        Ok(())
    }

    /// Apply pre-fetched blocks in ascending height order, committing each.
    fn apply_fetched_blocks(
        &self,
        peer: &Peer,
        common_block: &Block,
        blocks: Vec<Block>,
    ) -> SyncStep<()> {
        let mut parent = common_block.clone();
        for block in blocks {
            if self.shutdown.is_stopping() {
                return Err(SynchronizationResult::ShuttingDown);
            }
            self.validate_and_commit(peer, &parent, &block)?;
            parent = block;
        }
        Ok(())
    }

    /// Full-validate one block against its parent, then apply and commit.
    fn validate_and_commit(&self, peer: &Peer, parent: &Block, block: &Block) -> SyncStep<()> {
        let now = Timestamp::now();
        if let Err(reason) = validate_block(
            parent,
            block,
            self.accounts.as_ref(),
            self.config.max_transactions_per_block,
            now,
        ) {
            tracing::info!(
                peer = peer.id(),
                height = block.height,
                sig = %block.signature,
                %reason,
                "peer sent invalid block"
            );
            self.invalid_memory.remember(block.signature, now);
            return Err(SynchronizationResult::InvalidData);
        }

        self.chain
            .apply_block(block)
            .map_err(|e| self.repository_issue(e))?;
        self.chain.save().map_err(|e| self.repository_issue(e))?;
        tracing::trace!(height = block.height, sig = %block.signature, "processed block");
        Ok(())
    }

    /// When a peer goes quiet mid-download but our own tip is stale and
    /// the fetched blocks move us forward, applying the partial batch is
    /// better than discarding all progress. Typical after restarting a
    /// node that was left on a small fork.
    fn partial_apply_helps(&self, peer_blocks: &[Block]) -> SyncStep<bool> {
        let Some(last_fetched) = peer_blocks.last() else {
            return Ok(false);
        };
        let our_latest = self.last_block()?;
        let now = Timestamp::now();
        let our_tip_stale = our_latest
            .timestamp
            .has_expired(self.config.stale_tip_threshold_secs, now);
        Ok(our_tip_stale && last_fetched.timestamp > our_latest.timestamp)
    }

    fn last_block(&self) -> SyncStep<Block> {
        self.chain.last_block().map_err(|e| self.repository_issue(e))
    }

    fn repository_issue(&self, error: forge_store::StoreError) -> SynchronizationResult {
        tracing::warn!(%error, "repository issue during synchronization");
        SynchronizationResult::RepositoryIssue
    }
}

/// Summaries returned by a peer must carry strictly consecutive heights
/// directly above `parent_height`; anything else is treated as a
/// non-answer.
fn check_consecutive_heights(
    summaries: &[BlockSummary],
    parent_height: u64,
) -> SyncStep<()> {
    for (i, summary) in summaries.iter().enumerate() {
        let expected = parent_height + 1 + i as u64;
        if summary.height != expected {
            tracing::info!(
                expected,
                actual = summary.height,
                "peer responded with invalid block summary heights"
            );
            return Err(SynchronizationResult::NoReply);
        }
    }
    Ok(())
}

//! Block minting and candidate arbitration.
//!
//! A continuously-running loop that builds one block candidate per
//! eligible local minting key against the current tip, picks the one with
//! the lowest weight (lower is more favorable), and commits it under the
//! blockchain lock — unless a peer is demonstrably on a more favorable
//! chain, in which case the candidate is held for a grace period to give
//! the synchronizer a chance to take that chain instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use num_bigint::BigUint;
use tokio::sync::{watch, RwLock};

use forge_consensus::{block_weight, chain_weight, populate_minter_levels};
use forge_crypto::sign_block;
use forge_messages::Message;
use forge_network::{broadcast_with, Peer, PeerManager};
use forge_store::{effective_minter_level, AccountStore, ChainStore, StoreError, TransactionPool};
use forge_types::{Block, BlockSignature, BlockSummary, KeyPair, Timestamp};

use crate::blockchain_lock::BlockchainLock;
use crate::config::NodeConfig;
use crate::invalid_memory::InvalidSignatureMemory;
use crate::online_accounts::OnlineAccountsManager;
use crate::shutdown::ShutdownController;
use crate::validation::validate_block;

/// Extra sleep before retrying while a more favorable peer chain is being
/// held against, giving the synchronizer room to take it. Slept outside
/// the blockchain lock.
const LOW_WEIGHT_HOLD_SLEEP: Duration = Duration::from_secs(10);

/// A fully built, signed block candidate awaiting arbitration.
pub struct BlockCandidate {
    pub block: Block,
    pub minter_level: u32,
    keypair: KeyPair,
}

impl BlockCandidate {
    /// Fork-choice summary of this candidate with its level filled in.
    fn summary(&self) -> BlockSummary {
        let mut summary = self.block.summary();
        summary.minter_level = self.minter_level;
        summary
    }
}

/// Build a signed candidate for `keypair` on top of `tip`.
pub fn build_candidate(
    tip: &Block,
    keypair: KeyPair,
    minter_level: u32,
    online_accounts_count: u32,
    target_block_interval_secs: u64,
) -> BlockCandidate {
    let mut block = Block {
        height: tip.height + 1,
        signature: BlockSignature::ZERO,
        reference: tip.signature,
        minter_public_key: keypair.public,
        timestamp: tip.timestamp.plus(target_block_interval_secs),
        online_accounts_count,
        transactions: Vec::new(),
    };
    block.signature = sign_block(&block.signable_bytes(), &keypair.private);
    BlockCandidate {
        block,
        minter_level,
        keypair,
    }
}

/// Rate limiter for repeated failure logs: during sustained inability to
/// mint, the same complaint is logged at most once per timeout window.
struct ModeratedLog {
    last: Option<Instant>,
    timeout: Duration,
}

impl ModeratedLog {
    const INITIAL_TIMEOUT: Duration = Duration::from_secs(2 * 60);
    const REDUCED_TIMEOUT: Duration = Duration::from_secs(10);

    fn new() -> Self {
        Self {
            last: None,
            timeout: Self::INITIAL_TIMEOUT,
        }
    }

    /// Whether the caller should log now. Logging resets the window.
    fn should_log(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < self.timeout => false,
            _ => {
                self.last = Some(Instant::now());
                self.timeout = Self::INITIAL_TIMEOUT;
                true
            }
        }
    }

    /// A new tip arrived: allow the next complaint sooner.
    fn reduce_timeout(&mut self) {
        self.timeout = Self::REDUCED_TIMEOUT;
    }
}

/// Per-round outcome of the commit step.
enum CommitOutcome {
    Committed(Block),
    /// The tip changed between candidate construction and lock
    /// acquisition — a synchronize() won the race.
    TipChanged,
    /// The candidate went invalid after adding transactions; rebuild
    /// everything.
    InvalidAfterTransactions,
}

/// Loop state carried across minting iterations.
struct MinterState {
    previous_tip: Option<Block>,
    candidates: Vec<BlockCandidate>,
    /// Parent signature for which a more favorable peer chain was first
    /// detected, and when. Reset when the parent changes.
    low_weight_parent: Option<BlockSignature>,
    low_weight_since: Option<Timestamp>,
    moderated: ModeratedLog,
}

pub struct BlockMinter {
    chain: Arc<dyn ChainStore>,
    accounts: Arc<dyn AccountStore>,
    pool: Arc<dyn TransactionPool>,
    lock: Arc<BlockchainLock>,
    shutdown: Arc<ShutdownController>,
    peer_manager: Arc<RwLock<PeerManager>>,
    online_accounts: Arc<OnlineAccountsManager>,
    invalid_memory: InvalidSignatureMemory,
    config: Arc<NodeConfig>,
    minting_possible_tx: watch::Sender<bool>,
}

impl BlockMinter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainStore>,
        accounts: Arc<dyn AccountStore>,
        pool: Arc<dyn TransactionPool>,
        lock: Arc<BlockchainLock>,
        shutdown: Arc<ShutdownController>,
        peer_manager: Arc<RwLock<PeerManager>>,
        online_accounts: Arc<OnlineAccountsManager>,
        invalid_memory: InvalidSignatureMemory,
        config: Arc<NodeConfig>,
    ) -> (Self, watch::Receiver<bool>) {
        let (minting_possible_tx, minting_possible_rx) = watch::channel(false);
        (
            Self {
                chain,
                accounts,
                pool,
                lock,
                shutdown,
                peer_manager,
                online_accounts,
                invalid_memory,
                config,
                minting_possible_tx,
            },
            minting_possible_rx,
        )
    }

    /// The minting loop. Consumes the minter; spawn it as a task.
    pub async fn run(self) {
        if self.config.lite {
            tracing::info!("lite node configuration, block minter disabled");
            return;
        }

        let interval = Duration::from_millis(self.config.mint_interval_millis);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut state = MinterState {
            previous_tip: None,
            candidates: Vec::new(),
            low_weight_parent: None,
            low_weight_since: None,
            moderated: ModeratedLog::new(),
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("block minter shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.iterate(&mut state).await {
                // Storage trouble aborts the round, not the loop.
                tracing::warn!(error = %e, "repository issue while minting");
            }
        }
    }

    /// One arbitration round.
    ///
    /// Everything up to the commit step only reads chain state; staged
    /// repository writes happen exclusively under the blockchain lock in
    /// [`commit_candidate`](Self::commit_candidate).
    async fn iterate(&self, state: &mut MinterState) -> Result<(), StoreError> {
        let now = Timestamp::now();

        // Eligible local minting keys: the reward-share must still exist,
        // its account must still mint, and the level must clear the
        // submission floor.
        let mut minting_keys = self.accounts.minting_accounts()?;
        if minting_keys.is_empty() {
            self.set_minting_possible(false);
            return Ok(());
        }
        let mut levels = Vec::with_capacity(minting_keys.len());
        minting_keys.retain(|keypair| {
            let level =
                effective_minter_level(self.accounts.as_ref(), &keypair.public).unwrap_or(0);
            if level == 0 || level < self.config.min_level_for_block_submissions {
                return false;
            }
            levels.push((keypair.public, level));
            true
        });
        if minting_keys.is_empty() {
            self.set_minting_possible(false);
            return Ok(());
        }

        let tip = self.chain.last_block()?;

        // Enough up-to-date peers? Without them there is nobody to supply
        // transactions or dispute our fork choice.
        let peers = {
            let manager = self.peer_manager.read().await;
            let mut peers = manager.eligible(now);
            peers.retain(|p| {
                p.chain_tip().is_some_and(|t| {
                    !t.timestamp
                        .has_expired(self.config.stale_tip_threshold_secs, now)
                })
            });
            peers
        };
        if peers.len() < self.config.min_peers_for_minting {
            self.set_minting_possible(false);
            return Ok(());
        }

        // A stale local tip means we should be synchronizing, not minting.
        if !self.config.single_node_testnet
            && !peers.is_empty()
            && tip
                .timestamp
                .has_expired(self.config.stale_tip_threshold_secs, now)
        {
            self.set_minting_possible(false);
            return Ok(());
        }

        self.set_minting_possible(true);

        // New tip? Previously built candidates are stale.
        if state.previous_tip.as_ref().map(|t| t.signature) != Some(tip.signature) {
            state.previous_tip = Some(tip.clone());
            state.candidates.clear();
            state.moderated.reduce_timeout();
            state.low_weight_parent = None;
            state.low_weight_since = None;
        }

        // If one of our keys minted the tip, sit this round out — no
        // back-to-back self-minting.
        let minted_last = minting_keys
            .iter()
            .any(|keypair| keypair.public == tip.minter_public_key);
        if minted_last && !self.config.single_node_testnet {
            tracing::trace!("one of our keys minted the last block, sitting this round out");
            return Ok(());
        }

        // Holding against a more favorable peer chain: sleep outside the
        // lock so the synchronizer can take it.
        if state.low_weight_parent.is_some() {
            tracing::info!("more favorable chain held against, pausing before arbitration");
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(LOW_WEIGHT_HOLD_SLEEP) => {}
            }
        }

        // Build missing candidates (retained ones are reused while the tip
        // is unchanged — construction is the expensive step).
        let online_count = self.online_accounts.count_current(now);
        for keypair in minting_keys {
            let already_built = state
                .candidates
                .iter()
                .any(|c| c.block.minter_public_key == keypair.public);
            if already_built {
                continue;
            }
            let level = levels
                .iter()
                .find(|(public, _)| *public == keypair.public)
                .map(|(_, level)| *level)
                .unwrap_or(1);
            state.candidates.push(build_candidate(
                &tip,
                keypair,
                level,
                online_count,
                self.config.target_block_interval_secs,
            ));
        }
        if state.candidates.is_empty() {
            if state.moderated.should_log() {
                tracing::info!("couldn't build any block candidate");
            }
            return Ok(());
        }

        // Pre-validate before adding transactions, discarding one invalid
        // candidate per round so a replacement can be built cheaply.
        let mut valid_indices = Vec::new();
        let mut invalid_index = None;
        for (i, candidate) in state.candidates.iter().enumerate() {
            // Not mintable yet; keep for a later round.
            if candidate.block.timestamp > now {
                continue;
            }
            match validate_block(
                &tip,
                &candidate.block,
                self.accounts.as_ref(),
                self.config.max_transactions_per_block,
                now,
            ) {
                Ok(()) => valid_indices.push(i),
                Err(reason) => {
                    if state.moderated.should_log() {
                        tracing::error!(%reason, "to-be-minted block invalid before transactions");
                    }
                    invalid_index = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = invalid_index {
            state.candidates.remove(i);
            return Ok(());
        }
        if valid_indices.is_empty() {
            return Ok(());
        }

        // Pick the candidate with the lowest block weight.
        let best_index = valid_indices
            .into_iter()
            .min_by_key(|&i| {
                block_weight(tip.height, &tip.signature, &state.candidates[i].summary())
            })
            .expect("non-empty valid candidate set");
        let best_weight = block_weight(
            tip.height,
            &tip.signature,
            &state.candidates[best_index].summary(),
        );

        // Hold the candidate while any peer's cached chain weight is at
        // least as favorable as ours-including-candidate — but never stall
        // past the grace period.
        match self.more_favorable_chain_exists(&tip, &best_weight, &peers) {
            Ok(true) => {
                // First detection per distinct parent starts the timer.
                if state.low_weight_parent != Some(tip.signature) {
                    state.low_weight_since = Some(now);
                }
                state.low_weight_parent = Some(tip.signature);

                let since = state.low_weight_since.unwrap_or(now);
                if since.elapsed_since(now) < self.config.candidate_hold_grace_secs {
                    tracing::info!(
                        held_secs = since.elapsed_since(now),
                        "more favorable chain visible in peers, not signing a block this round"
                    );
                    return Ok(());
                }
                tracing::info!("hold grace period expired, submitting block candidate anyway");
            }
            Ok(false) => {
                tracing::debug!("no more favorable chain visible in peers");
            }
            Err(e) => {
                tracing::debug!(error = %e, "unable to check peer chain weights, proceeding");
            }
        }
        state.low_weight_parent = None;
        state.low_weight_since = None;

        // Commit under the blockchain lock.
        let Some(guard) = self.lock.try_acquire(self.config.mint_lock_timeout()).await else {
            tracing::debug!("couldn't acquire blockchain lock for minting");
            return Ok(());
        };
        let outcome = self.commit_candidate(&state.candidates[best_index], &tip, now);
        drop(guard);

        match outcome {
            Ok(CommitOutcome::Committed(block)) => {
                tracing::info!(
                    height = block.height,
                    sig = %block.signature,
                    parent_sig = %block.reference,
                    transactions = block.transactions.len(),
                    "minted new block"
                );
                state.candidates.clear();
                self.broadcast_tip(&block).await;
            }
            Ok(CommitOutcome::TipChanged) => {
                tracing::debug!("tip changed under us, abandoning this round");
            }
            Ok(CommitOutcome::InvalidAfterTransactions) => {
                tracing::error!("minted block went invalid after adding transactions, rebuilding");
                state.candidates.clear();
            }
            Err(e) => {
                // Unexpected failure during commit: force a full rebuild.
                tracing::error!(error = %e, "unable to process newly minted block");
                state.candidates.clear();
                return Err(e);
            }
        }

        Ok(())
    }

    /// Commit step: re-check the tip, fill the block with unconfirmed
    /// transactions, sign, final-validate, and append to the chain.
    fn commit_candidate(
        &self,
        candidate: &BlockCandidate,
        tip: &Block,
        now: Timestamp,
    ) -> Result<CommitOutcome, StoreError> {
        // Fresh view of the chain now that we hold the lock.
        self.chain.discard()?;
        let latest = self.chain.last_block()?;
        if latest.signature != tip.signature {
            return Ok(CommitOutcome::TipChanged);
        }

        let mut block = candidate.block.clone();

        // Greedily add eligible unconfirmed transactions; skip any that
        // would invalidate the block.
        let unconfirmed = self.pool.unconfirmed_transactions()?;
        for tx in unconfirmed {
            if block.transactions.len() >= self.config.max_transactions_per_block {
                break;
            }
            if !tx.is_confirmable_at(block.timestamp) {
                continue;
            }
            block.transactions.push(tx);
            block.signature = sign_block(&block.signable_bytes(), &candidate.keypair.private);
            if validate_block(
                tip,
                &block,
                self.accounts.as_ref(),
                self.config.max_transactions_per_block,
                now,
            )
            .is_err()
            {
                let skipped = block.transactions.pop().expect("just pushed");
                tracing::debug!(tx = ?skipped.signature, "skipping invalidating transaction");
                block.signature = sign_block(&block.signable_bytes(), &candidate.keypair.private);
            }
        }

        // Final validation of the signed block.
        if let Err(reason) = validate_block(
            tip,
            &block,
            self.accounts.as_ref(),
            self.config.max_transactions_per_block,
            now,
        ) {
            tracing::error!(%reason, "final validation failed for minted block");
            return Ok(CommitOutcome::InvalidAfterTransactions);
        }

        self.chain.apply_block(&block)?;
        self.chain.save()?;

        for tx in &block.transactions {
            self.pool.remove_transaction(&tx.signature)?;
        }

        Ok(CommitOutcome::Committed(block))
    }

    /// Whether any peer's cached per-peer chain weight (accumulated since
    /// its last common block with us) is at least as favorable as our own
    /// chain extended by the candidate. Lower weight is more favorable.
    fn more_favorable_chain_exists(
        &self,
        tip: &Block,
        candidate_weight: &BigUint,
        peers: &[Arc<Peer>],
    ) -> Result<bool, StoreError> {
        for peer in peers {
            let Some(common_data) = peer.common_block_data() else {
                continue;
            };
            let (Some(peer_weight), Some(peer_summaries)) = (
                common_data.chain_weight.as_ref(),
                common_data.summaries_after_common.as_ref(),
            ) else {
                continue;
            };
            if self.invalid_memory.contains_any_summary(peer_summaries) {
                tracing::debug!(peer = peer.id(), "peer chain holds a known-invalid block");
                continue;
            }

            let common = &common_data.common_block_summary;
            let mut our_summaries = self
                .chain
                .block_summaries(common.height + 1, tip.height)?;
            let resolver = |key: &forge_types::PublicKey| {
                effective_minter_level(self.accounts.as_ref(), key).unwrap_or(0)
            };
            populate_minter_levels(&mut our_summaries, resolver);

            let mutual_height =
                common.height + our_summaries.len().min(peer_summaries.len()) as u64;
            let ours_since_common = chain_weight(
                common.height,
                &common.signature,
                &our_summaries,
                mutual_height,
            );
            let our_weight = ours_since_common + candidate_weight;

            if *peer_weight <= our_weight {
                tracing::info!(
                    peer = peer.id(),
                    peer_weight = %peer_weight,
                    our_weight = %our_weight,
                    "peer is on a more favorable chain than ours"
                );
                return Ok(true);
            }
            tracing::debug!(
                peer = peer.id(),
                peer_weight = %peer_weight,
                our_weight = %our_weight,
                "peer chain is less favorable than ours"
            );
        }
        Ok(false)
    }

    async fn broadcast_tip(&self, block: &Block) {
        let peers = self.peer_manager.read().await.handshaked();
        let tip = block.chain_tip();
        let result = broadcast_with(&peers, |_| Some(Message::ChainTipAnnounce(tip.clone())));
        tracing::debug!(sent = result.sent, failed = result.failed, "broadcast new chain tip");
    }

    fn set_minting_possible(&self, possible: bool) {
        // send_if_modified keeps watchers quiet unless the state flips.
        self.minting_possible_tx.send_if_modified(|current| {
            if *current != possible {
                *current = possible;
                tracing::debug!(possible, "minting-possible changed");
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_crypto::generate_keypair;
    use forge_types::PublicKey;

    fn tip_block() -> Block {
        Block {
            height: 9,
            signature: BlockSignature([9u8; 64]),
            reference: BlockSignature([8u8; 64]),
            minter_public_key: PublicKey([1u8; 32]),
            timestamp: Timestamp::new(540),
            online_accounts_count: 2,
            transactions: vec![],
        }
    }

    #[test]
    fn candidate_is_signed_and_linked() {
        let kp = generate_keypair();
        let tip = tip_block();
        let candidate = build_candidate(&tip, kp, 3, 5, 60);

        assert_eq!(candidate.block.height, 10);
        assert_eq!(candidate.block.reference, tip.signature);
        assert_eq!(candidate.block.online_accounts_count, 5);
        assert_eq!(candidate.block.timestamp, Timestamp::new(600));
        assert!(crate::validation::verify_block_signature(&candidate.block));
    }

    #[test]
    fn candidate_summary_carries_level() {
        let kp = generate_keypair();
        let candidate = build_candidate(&tip_block(), kp, 7, 1, 60);
        assert_eq!(candidate.summary().minter_level, 7);
    }

    #[test]
    fn lowest_weight_candidate_wins() {
        let tip = tip_block();
        let candidates: Vec<BlockCandidate> = (0..4)
            .map(|_| build_candidate(&tip, generate_keypair(), 1, 1, 60))
            .collect();

        let best = candidates
            .iter()
            .min_by_key(|c| block_weight(tip.height, &tip.signature, &c.summary()))
            .unwrap();
        for candidate in &candidates {
            assert!(
                block_weight(tip.height, &tip.signature, &best.summary())
                    <= block_weight(tip.height, &tip.signature, &candidate.summary())
            );
        }
    }

    #[test]
    fn moderated_log_rate_limits() {
        let mut log = ModeratedLog::new();
        assert!(log.should_log());
        assert!(!log.should_log());

        // A reduced window still gates immediate repeats.
        log.reduce_timeout();
        assert!(!log.should_log());
    }
}

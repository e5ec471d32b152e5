//! The Forge node — wires the consensus subsystems together.
//!
//! All services are explicitly constructed here and passed by reference;
//! lifecycle is `start()` / `shutdown()` on this supervisor. Three loops
//! run concurrently: the synchronization driver, the block minter, and
//! the online-accounts gossip tasks — the first two sharing the single
//! blockchain lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use forge_messages::Message;
use forge_network::{broadcast_with, Peer, PeerManager};
use forge_store::{AccountStore, ChainStore, TransactionPool};
use forge_types::Timestamp;

use crate::block_minter::BlockMinter;
use crate::blockchain_lock::BlockchainLock;
use crate::config::NodeConfig;
use crate::invalid_memory::InvalidSignatureMemory;
use crate::online_accounts::OnlineAccountsManager;
use crate::shutdown::ShutdownController;
use crate::synchronizer::{SynchronizationResult, Synchronizer};

/// Timeout for joining background tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running Forge node.
pub struct Node {
    pub config: Arc<NodeConfig>,
    pub chain: Arc<dyn ChainStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub pool: Arc<dyn TransactionPool>,
    pub peer_manager: Arc<RwLock<PeerManager>>,
    pub lock: Arc<BlockchainLock>,
    pub shutdown: Arc<ShutdownController>,
    pub synchronizer: Arc<Synchronizer>,
    pub online_accounts: Arc<OnlineAccountsManager>,

    invalid_memory: InvalidSignatureMemory,
    minting_possible_rx: watch::Receiver<bool>,
    minter: Option<BlockMinter>,
    task_handles: Vec<JoinHandle<()>>,
}

impl Node {
    /// Construct a node over the given storage collaborators.
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainStore>,
        accounts: Arc<dyn AccountStore>,
        pool: Arc<dyn TransactionPool>,
    ) -> Self {
        let config = Arc::new(config);
        let peer_manager = Arc::new(RwLock::new(PeerManager::with_cooloff(
            config.misbehavior_cooloff_secs,
        )));
        let lock = Arc::new(BlockchainLock::new());
        let shutdown = Arc::new(ShutdownController::new());
        let invalid_memory = InvalidSignatureMemory::new();

        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&chain),
            Arc::clone(&accounts),
            Arc::clone(&lock),
            Arc::clone(&shutdown),
            invalid_memory.clone(),
            Arc::clone(&config),
        ));

        let online_accounts = Arc::new(OnlineAccountsManager::new(
            Arc::clone(&accounts),
            Arc::clone(&peer_manager),
            Arc::clone(&shutdown),
            Arc::clone(&config),
        ));

        let (minter, minting_possible_rx) = BlockMinter::new(
            Arc::clone(&chain),
            Arc::clone(&accounts),
            Arc::clone(&pool),
            Arc::clone(&lock),
            Arc::clone(&shutdown),
            Arc::clone(&peer_manager),
            Arc::clone(&online_accounts),
            invalid_memory.clone(),
            Arc::clone(&config),
        );

        Self {
            config,
            chain,
            accounts,
            pool,
            peer_manager,
            lock,
            shutdown,
            synchronizer,
            online_accounts,
            invalid_memory,
            minting_possible_rx,
            minter: Some(minter),
            task_handles: Vec::new(),
        }
    }

    /// Spawn the synchronization driver, the block minter, and the
    /// online-accounts tasks.
    pub fn start(&mut self) {
        if let Some(minter) = self.minter.take() {
            self.task_handles.push(tokio::spawn(minter.run()));
        }

        self.task_handles
            .extend(Arc::clone(&self.online_accounts).start());

        let sync_loop = {
            let synchronizer = Arc::clone(&self.synchronizer);
            let peer_manager = Arc::clone(&self.peer_manager);
            let chain = Arc::clone(&self.chain);
            let config = Arc::clone(&self.config);
            let shutdown = Arc::clone(&self.shutdown);
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                let interval = Duration::from_secs(config.sync_interval_secs);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => {
                            tracing::info!("synchronization driver shutting down");
                            break;
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if shutdown.is_stopping() {
                        break;
                    }
                    sync_round(&synchronizer, &peer_manager, &chain, &config).await;
                }
            })
        };
        self.task_handles.push(sync_loop);

        tracing::info!(network = self.config.network.as_str(), "node started");
    }

    /// Signal shutdown and wait for the background tasks to stop.
    pub async fn stop(mut self) {
        self.shutdown.shutdown();
        for handle in self.task_handles.drain(..) {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("background task did not stop within shutdown timeout");
            }
        }
        tracing::info!("node stopped");
    }

    /// Observer for "can this node currently mint" transitions.
    pub fn minting_possible(&self) -> watch::Receiver<bool> {
        self.minting_possible_rx.clone()
    }

    /// Handle one inbound message from a peer, returning the response to
    /// send back (if the message warrants one).
    ///
    /// The connection layer calls this from its per-peer read tasks.
    pub fn handle_message(&self, peer: &Peer, message: Message) -> Option<Message> {
        match message {
            Message::ChainTipAnnounce(tip) => {
                peer.set_chain_tip(tip);
                None
            }

            Message::GetBlockSummaries {
                parent_signature,
                count,
            } => {
                let summaries = self
                    .chain
                    .height_of_signature(&parent_signature)
                    .ok()
                    .flatten()
                    .map(|height| {
                        let count = count.min(self.config.max_request_size) as u64;
                        self.chain
                            .block_summaries(height + 1, height + count)
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                Some(Message::BlockSummaries { summaries })
            }

            Message::GetSignatures {
                parent_signature,
                count,
            } => {
                let signatures = self
                    .chain
                    .height_of_signature(&parent_signature)
                    .ok()
                    .flatten()
                    .map(|height| {
                        let count = count.min(self.config.max_request_size) as u64;
                        self.chain
                            .block_summaries(height + 1, height + count)
                            .unwrap_or_default()
                            .into_iter()
                            .map(|s| s.signature)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Message::Signatures { signatures })
            }

            Message::GetBlock { signature } => {
                let block = self.chain.block_by_signature(&signature).ok().flatten();
                Some(Message::BlockResponse { block })
            }

            Message::GetOnlineAccounts { known } => Some(Message::OnlineAccounts {
                entries: self.online_accounts.entries_excluding(&known),
            }),

            // Responses arriving outside a request context are ignored.
            Message::BlockSummaries { .. }
            | Message::Signatures { .. }
            | Message::BlockResponse { .. } => None,

            Message::OnlineAccounts { entries } => {
                self.online_accounts.import(entries);
                None
            }
        }
    }

    /// Shared memory of invalid block signatures (exposed for tests and
    /// the API layer).
    pub fn invalid_memory(&self) -> &InvalidSignatureMemory {
        &self.invalid_memory
    }
}

/// One pass of the synchronization driver: pick the most promising peer
/// and attempt to synchronize with it. At most one attempt is in flight
/// at a time by design.
pub async fn sync_round(
    synchronizer: &Synchronizer,
    peer_manager: &RwLock<PeerManager>,
    chain: &Arc<dyn ChainStore>,
    config: &NodeConfig,
) {
    let now = Timestamp::now();
    let our_tip = match chain.last_block() {
        Ok(block) => block,
        Err(e) => {
            tracing::warn!(error = %e, "cannot read local tip, skipping sync round");
            return;
        }
    };

    let eligible = peer_manager.read().await.eligible(now);
    let mut candidates: Vec<(Arc<Peer>, u64)> = Vec::new();
    for peer in eligible {
        let Some(tip) = peer.chain_tip() else { continue };
        if tip.signature == our_tip.signature {
            continue;
        }
        if tip.height <= 1 {
            // Nothing to gain from a peer that only has its genesis block.
            tracing::debug!(
                peer = peer.id(),
                result = %SynchronizationResult::GenesisOnly,
                "skipping genesis-only peer"
            );
            continue;
        }
        if tip
            .timestamp
            .has_expired(config.stale_tip_threshold_secs, now)
            && tip.height <= our_tip.height
        {
            tracing::debug!(peer = peer.id(), "peer tip is stale, skipping");
            continue;
        }
        candidates.push((peer, tip.height));
    }
    let Some(best_height) = candidates.iter().map(|(_, height)| *height).max() else {
        return;
    };
    // Spread load across equally-tall peers.
    candidates.retain(|(_, height)| *height == best_height);
    let index = rand::random::<u32>() as usize % candidates.len();
    let (peer, _) = &candidates[index];

    let result = synchronizer.synchronize(peer, false).await;
    match result {
        SynchronizationResult::Ok => {
            // Our tip moved: tell everyone.
            let new_tip = match chain.last_block() {
                Ok(block) => block.chain_tip(),
                Err(_) => return,
            };
            let peers = peer_manager.read().await.handshaked();
            broadcast_with(&peers, |_| Some(Message::ChainTipAnnounce(new_tip.clone())));
        }
        SynchronizationResult::InvalidData => {
            peer_manager.write().await.penalize(peer.id(), now);
        }
        SynchronizationResult::InferiorChain => {
            // Let the peer know our chain beats theirs.
            let _ = peer.send(Message::ChainTipAnnounce(our_tip.chain_tip()));
        }
        SynchronizationResult::NoBlockchainLock => {
            tracing::trace!("sync round skipped: no blockchain lock");
        }
        SynchronizationResult::RepositoryIssue => {
            tracing::warn!("sync round aborted by repository issue");
        }
        other => {
            tracing::debug!(peer = peer.id(), result = %other, "sync round finished");
        }
    }
}

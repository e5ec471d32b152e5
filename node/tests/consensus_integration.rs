//! End-to-end consensus tests: the synchronizer and block minter driven
//! against scripted remote peers over the real peer channel plumbing,
//! backed by in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;

use forge_consensus::chain_weight;
use forge_crypto::{derive_address, keypair_from_seed, sign_block};
use forge_messages::Message;
use forge_network::{CommonBlockData, Peer};
use forge_node::{
    BlockchainLock, InvalidSignatureMemory, Node, NodeConfig, ShutdownController,
    SynchronizationResult, Synchronizer,
};
use forge_store::{ChainStore, MemoryStore, RewardShare, TransactionPool};
use forge_types::{
    Block, BlockSignature, BlockSummary, KeyPair, Signature, Timestamp, Transaction,
};

const REQUEST_TIMEOUT: Duration = Duration::from_millis(250);

// ── Chain-building helpers ──────────────────────────────────────────────

fn minter_key(tag: u8) -> KeyPair {
    keypair_from_seed(&[tag; 32])
}

fn register_minter(store: &MemoryStore, keypair: &KeyPair, level: u32) {
    let address = derive_address(&keypair.public);
    store.put_reward_share(RewardShare {
        share_public_key: keypair.public,
        minter: address.clone(),
        recipient: address,
        share_percent: 0,
    });
    store.put_account(derive_address(&keypair.public), level, true);
}

fn genesis_block(timestamp: Timestamp) -> Block {
    let keypair = minter_key(250);
    let mut block = Block {
        height: 1,
        signature: BlockSignature::ZERO,
        reference: BlockSignature::ZERO,
        minter_public_key: keypair.public,
        timestamp,
        online_accounts_count: 0,
        transactions: vec![],
    };
    block.signature = sign_block(&block.signable_bytes(), &keypair.private);
    block
}

fn make_block(parent: &Block, keypair: &KeyPair, timestamp: Timestamp) -> Block {
    let mut block = Block {
        height: parent.height + 1,
        signature: BlockSignature::ZERO,
        reference: parent.signature,
        minter_public_key: keypair.public,
        timestamp,
        online_accounts_count: 1,
        transactions: vec![],
    };
    block.signature = sign_block(&block.signable_bytes(), &keypair.private);
    block
}

/// Extend `parent` by `count` blocks minted by `keypair`, spaced
/// `step_secs` apart.
fn extend(parent: &Block, keypair: &KeyPair, count: u64, step_secs: u64) -> Vec<Block> {
    extend_with_keys(parent, &vec![keypair; count as usize], step_secs)
}

/// Extend `parent` with one block per key, spaced `step_secs` apart.
fn extend_with_keys(parent: &Block, keys: &[&KeyPair], step_secs: u64) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(keys.len());
    let mut parent = parent.clone();
    for keypair in keys {
        let block = make_block(&parent, keypair, parent.timestamp.plus(step_secs));
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}

fn store_from_chain(chain: &[Block]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::with_genesis(chain[0].clone()));
    for block in &chain[1..] {
        store.apply_block(block).unwrap();
    }
    store.save().unwrap();
    store
}

/// Cumulative level-1 weight of a fork's first `mutual` blocks above
/// `common` — the quantity compare_chains uses when both sides have at
/// least `mutual` blocks.
fn fork_weight(common: &Block, fork: &[Block], mutual: usize) -> BigUint {
    let summaries: Vec<BlockSummary> = fork
        .iter()
        .take(mutual)
        .map(|b| {
            let mut summary = b.summary();
            summary.minter_level = 1;
            summary
        })
        .collect();
    chain_weight(
        common.height,
        &common.signature,
        &summaries,
        common.height + mutual as u64,
    )
}

// ── Scripted remote peer ────────────────────────────────────────────────

struct RemotePeer {
    peer: Arc<Peer>,
    /// Number of GetBlockSummaries requests served — the common-block
    /// probe count.
    summary_requests: Arc<AtomicUsize>,
}

/// Spawn a task serving a fixed remote chain over the peer channel.
fn spawn_remote(id: &str, chain: Vec<Block>) -> RemotePeer {
    let (peer, mut handle) = Peer::new(id, REQUEST_TIMEOUT);
    peer.set_chain_tip(chain.last().unwrap().chain_tip());
    let summary_requests = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&summary_requests);
    tokio::spawn(async move {
        while let Some(request) = handle.requests.recv().await {
            let Some(reply) = request.reply else { continue };
            let response = respond(&chain, &request.message, &counter);
            let _ = reply.send(response);
        }
    });

    RemotePeer {
        peer: Arc::new(peer),
        summary_requests,
    }
}

fn blocks_after<'a>(chain: &'a [Block], parent: &BlockSignature, count: u32) -> Vec<&'a Block> {
    match chain.iter().position(|b| &b.signature == parent) {
        Some(i) => chain[i + 1..].iter().take(count as usize).collect(),
        None => Vec::new(),
    }
}

fn respond(chain: &[Block], message: &Message, summary_requests: &AtomicUsize) -> Message {
    match message {
        Message::GetBlockSummaries {
            parent_signature,
            count,
        } => {
            summary_requests.fetch_add(1, Ordering::SeqCst);
            let summaries = blocks_after(chain, parent_signature, *count)
                .into_iter()
                .map(|b| b.summary())
                .collect();
            Message::BlockSummaries { summaries }
        }
        Message::GetSignatures {
            parent_signature,
            count,
        } => {
            let signatures = blocks_after(chain, parent_signature, *count)
                .into_iter()
                .map(|b| b.signature)
                .collect();
            Message::Signatures { signatures }
        }
        Message::GetBlock { signature } => Message::BlockResponse {
            block: chain.iter().find(|b| &b.signature == signature).cloned(),
        },
        Message::GetOnlineAccounts { .. } => Message::OnlineAccounts { entries: vec![] },
        _ => Message::BlockSummaries { summaries: vec![] },
    }
}

fn build_synchronizer(
    store: &Arc<MemoryStore>,
    config: NodeConfig,
    lock: Arc<BlockchainLock>,
    shutdown: Arc<ShutdownController>,
) -> Synchronizer {
    Synchronizer::new(
        store.clone(),
        store.clone(),
        lock,
        shutdown,
        InvalidSignatureMemory::new(),
        Arc::new(config),
    )
}

fn default_synchronizer(store: &Arc<MemoryStore>) -> Synchronizer {
    build_synchronizer(
        store,
        NodeConfig::default(),
        Arc::new(BlockchainLock::new()),
        Arc::new(ShutdownController::new()),
    )
}

/// Standard fork fixture: shared history to height 98, a 2-block local
/// fork, and a 7-block peer fork whose prefix weight relates to the local
/// fork's as requested.
struct ForkFixture {
    local_chain: Vec<Block>,
    peer_chain: Vec<Block>,
    local_fork: Vec<Block>,
    peer_fork: Vec<Block>,
    store: Arc<MemoryStore>,
}

fn fork_fixture(peer_more_favorable: bool) -> ForkFixture {
    let now = Timestamp::now();
    let shared_minter = minter_key(1);
    let local_key = minter_key(2);

    // Timestamps laid out so the peer tip lands on `now` and the local
    // tip stays comfortably inside the staleness threshold.
    let mut shared = vec![genesis_block(now.minus(105 * 60))];
    shared.extend(extend(&shared[0], &shared_minter, 97, 60));
    let common = shared.last().unwrap().clone();
    assert_eq!(common.height, 98);

    let local_fork = extend(&common, &local_key, 2, 60);
    let local_weight = fork_weight(&common, &local_fork, 2);

    // The keyed distance is pseudo-random, so pick the peer's minting key
    // to land on the requested side of the comparison.
    let peer_key = (3u8..120)
        .map(minter_key)
        .find(|key| {
            let peer_fork = extend(&common, key, 7, 60);
            let peer_weight = fork_weight(&common, &peer_fork, 2);
            if peer_more_favorable {
                peer_weight < local_weight
            } else {
                peer_weight > local_weight
            }
        })
        .expect("a key on the requested side of the weight comparison");
    let peer_fork = extend(&common, &peer_key, 7, 60);

    let mut local_chain = shared.clone();
    local_chain.extend(local_fork.iter().cloned());
    let mut peer_chain = shared;
    peer_chain.extend(peer_fork.iter().cloned());

    let store = store_from_chain(&local_chain);
    register_minter(&store, &shared_minter, 1);
    register_minter(&store, &local_key, 1);
    register_minter(&store, &peer_key, 1);

    ForkFixture {
        local_chain,
        peer_chain,
        local_fork,
        peer_fork,
        store,
    }
}

// ── Synchronizer scenarios ──────────────────────────────────────────────

#[tokio::test]
async fn fork_switch_applies_peer_chain_in_height_order() {
    let fixture = fork_fixture(true);
    let remote = spawn_remote("peer-1", fixture.peer_chain.clone());
    let synchronizer = default_synchronizer(&fixture.store);

    let result = synchronizer.synchronize(&remote.peer, false).await;
    assert_eq!(result, SynchronizationResult::Ok);

    let tip = fixture.store.last_block().unwrap();
    assert_eq!(tip.height, 105);
    assert_eq!(tip.signature, fixture.peer_chain.last().unwrap().signature);

    // The peer's fork replaced ours entirely.
    for block in &fixture.peer_fork {
        assert!(fixture.store.contains(&block.signature).unwrap());
    }
    for block in &fixture.local_fork {
        assert!(!fixture.store.contains(&block.signature).unwrap());
    }
}

#[tokio::test]
async fn inferior_peer_chain_leaves_state_unchanged() {
    let fixture = fork_fixture(false);
    let remote = spawn_remote("peer-1", fixture.peer_chain.clone());
    let synchronizer = default_synchronizer(&fixture.store);

    let before = fixture.store.block_summaries(1, 100).unwrap();

    let result = synchronizer.synchronize(&remote.peer, false).await;
    assert_eq!(result, SynchronizationResult::InferiorChain);

    let after = fixture.store.block_summaries(1, 100).unwrap();
    assert_eq!(before, after);
    assert_eq!(
        fixture.store.last_block().unwrap().signature,
        fixture.local_chain.last().unwrap().signature
    );

    // The comparison was cached on the peer for the minter's arbitration.
    let cached = remote.peer.common_block_data().expect("cached comparison");
    assert_eq!(cached.common_block_summary.height, 98);
    assert!(cached.chain_weight.is_some());
}

#[tokio::test]
async fn repeat_sync_after_success_is_nothing_to_do() {
    let fixture = fork_fixture(true);
    let remote = spawn_remote("peer-1", fixture.peer_chain.clone());
    let synchronizer = default_synchronizer(&fixture.store);

    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::Ok
    );
    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::NothingToDo
    );
    assert_eq!(fixture.store.last_block().unwrap().height, 105);
}

#[tokio::test]
async fn common_block_search_uses_logarithmic_probes() {
    let now = Timestamp::now();
    let local_key = minter_key(5);
    let peer_key = minter_key(6);

    // 1000 blocks of divergence above a shared genesis.
    let genesis = genesis_block(now.minus(1100));
    let mut local_chain = vec![genesis.clone()];
    local_chain.extend(extend(&genesis, &local_key, 1000, 1));
    let mut peer_chain = vec![genesis.clone()];
    peer_chain.extend(extend(&genesis, &peer_key, 1005, 1));

    let store = store_from_chain(&local_chain);
    register_minter(&store, &local_key, 1);
    register_minter(&store, &peer_key, 1);

    let remote = spawn_remote("peer-1", peer_chain);
    let synchronizer = default_synchronizer(&store);

    // Forced: this is a deliberate deep reorg beyond the divergence limit.
    let result = synchronizer.synchronize(&remote.peer, true).await;
    assert_eq!(result, SynchronizationResult::Ok);

    // Step-doubling from 8 (capped at 500) reaches genesis over a
    // 1000-block divergence in well under 8 probe rounds.
    assert!(
        remote.summary_requests.load(Ordering::SeqCst) <= 8,
        "expected at most 8 probe rounds, saw {}",
        remote.summary_requests.load(Ordering::SeqCst)
    );

    // One bounded session applies at most the divergence-limit worth of
    // peer blocks past the common block.
    assert_eq!(store.last_block().unwrap().height, 242);
}

#[tokio::test]
async fn divergence_beyond_limit_is_rejected_without_force() {
    let now = Timestamp::now();
    let shared_minter = minter_key(7);
    let local_key = minter_key(8);
    let peer_key = minter_key(9);

    let mut shared = vec![genesis_block(now.minus(2000))];
    shared.extend(extend(&shared[0], &shared_minter, 49, 1));
    let common = shared.last().unwrap().clone(); // height 50

    let mut local_chain = shared.clone();
    local_chain.extend(extend(&common, &local_key, 250, 1)); // height 300
    let mut peer_chain = shared;
    peer_chain.extend(extend(&common, &peer_key, 255, 1)); // height 305

    let store = store_from_chain(&local_chain);
    register_minter(&store, &shared_minter, 1);
    register_minter(&store, &local_key, 1);
    register_minter(&store, &peer_key, 1);

    let remote = spawn_remote("peer-1", peer_chain);
    let synchronizer = default_synchronizer(&store);

    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::TooDivergent
    );
    assert_eq!(store.last_block().unwrap().height, 300);
}

#[tokio::test]
async fn disjoint_histories_find_no_common_block() {
    let now = Timestamp::now();
    let local_key = minter_key(10);
    let peer_key = minter_key(11);

    let local_genesis = genesis_block(now.minus(500));
    let mut local_chain = vec![local_genesis.clone()];
    local_chain.extend(extend(&local_genesis, &local_key, 4, 60));

    // Completely unrelated genesis.
    let peer_genesis = genesis_block(now.minus(499));
    let mut peer_chain = vec![peer_genesis.clone()];
    peer_chain.extend(extend(&peer_genesis, &peer_key, 10, 30));

    let store = store_from_chain(&local_chain);
    register_minter(&store, &local_key, 1);

    let remote = spawn_remote("peer-1", peer_chain);
    let synchronizer = default_synchronizer(&store);

    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::NoCommonBlock
    );
}

#[tokio::test]
async fn unresponsive_peer_returns_no_reply() {
    let now = Timestamp::now();
    let local_key = minter_key(12);
    let genesis = genesis_block(now.minus(500));
    let mut local_chain = vec![genesis.clone()];
    local_chain.extend(extend(&genesis, &local_key, 4, 60));
    let store = store_from_chain(&local_chain);

    // A peer with a tip claim whose connection never answers.
    let (peer, handle) = Peer::new("silent-peer", Duration::from_millis(50));
    peer.set_chain_tip(forge_types::ChainTip {
        height: 50,
        signature: BlockSignature([0xCC; 64]),
        timestamp: now,
        minter_public_key: local_key.public,
    });
    drop(handle);

    let synchronizer = default_synchronizer(&store);
    assert_eq!(
        synchronizer.synchronize(&peer, false).await,
        SynchronizationResult::NoReply
    );
}

#[tokio::test]
async fn held_lock_returns_no_blockchain_lock() {
    let fixture = fork_fixture(true);
    let remote = spawn_remote("peer-1", fixture.peer_chain.clone());

    let lock = Arc::new(BlockchainLock::new());
    let mut config = NodeConfig::default();
    config.sync_lock_timeout_secs = 0;
    let synchronizer = build_synchronizer(
        &fixture.store,
        config,
        Arc::clone(&lock),
        Arc::new(ShutdownController::new()),
    );

    let _guard = lock.try_acquire_now().unwrap();
    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::NoBlockchainLock
    );
}

#[tokio::test]
async fn shutdown_interrupts_synchronization() {
    let fixture = fork_fixture(true);
    let remote = spawn_remote("peer-1", fixture.peer_chain.clone());

    let shutdown = Arc::new(ShutdownController::new());
    let synchronizer = build_synchronizer(
        &fixture.store,
        NodeConfig::default(),
        Arc::new(BlockchainLock::new()),
        Arc::clone(&shutdown),
    );

    shutdown.shutdown();
    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::ShuttingDown
    );
    // Chain untouched — shutdown only ever lands on committed boundaries.
    assert_eq!(fixture.store.last_block().unwrap().height, 100);
}

#[tokio::test]
async fn tampered_block_signature_aborts_before_any_mutation() {
    let mut fixture = fork_fixture(true);

    // Corrupt the peer's tip block signature after signing.
    let last = fixture.peer_chain.last_mut().unwrap();
    last.signature.0[0] ^= 0xFF;
    let remote = spawn_remote("peer-1", fixture.peer_chain.clone());

    let synchronizer = default_synchronizer(&fixture.store);
    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::InvalidData
    );

    // Detected during download, before orphaning: nothing changed.
    assert_eq!(
        fixture.store.last_block().unwrap().signature,
        fixture.local_chain.last().unwrap().signature
    );
}

#[tokio::test]
async fn invalid_block_mid_batch_keeps_committed_progress() {
    let now = Timestamp::now();
    let shared_minter = minter_key(1);
    let local_key = minter_key(2);
    let rogue_key = minter_key(99); // never registered locally

    let mut shared = vec![genesis_block(now.minus(105 * 60))];
    shared.extend(extend(&shared[0], &shared_minter, 97, 60));
    let common = shared.last().unwrap().clone();

    let local_fork = extend(&common, &local_key, 2, 60);
    let local_weight = fork_weight(&common, &local_fork, 2);

    // Peer fork: first block from an eligible key chosen to win the
    // weight comparison, second from a key that fails eligibility
    // resolution during full validation.
    let peer_key = (3u8..120)
        .filter(|&tag| tag != 99)
        .map(minter_key)
        .find(|key| {
            let keys: Vec<&KeyPair> = vec![key, &rogue_key, key, key, key, key, key];
            let fork = extend_with_keys(&common, &keys, 60);
            fork_weight(&common, &fork, 2) < local_weight
        })
        .expect("a key that beats the local fork");
    let keys: Vec<&KeyPair> = vec![&peer_key, &rogue_key, &peer_key, &peer_key, &peer_key,
        &peer_key, &peer_key];
    let peer_fork = extend_with_keys(&common, &keys, 60);

    let mut local_chain = shared.clone();
    local_chain.extend(local_fork);
    let mut peer_chain = shared;
    peer_chain.extend(peer_fork.iter().cloned());

    let store = store_from_chain(&local_chain);
    register_minter(&store, &shared_minter, 1);
    register_minter(&store, &local_key, 1);
    register_minter(&store, &peer_key, 1);

    let remote = spawn_remote("peer-1", peer_chain);
    let synchronizer = default_synchronizer(&store);

    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::InvalidData
    );

    // Incremental commits: the valid first fork block survived, the rest
    // of the batch was abandoned at the failure point.
    let tip = store.last_block().unwrap();
    assert_eq!(tip.height, 99);
    assert_eq!(tip.signature, peer_fork[0].signature);

    // The bad signature is remembered: retrying rejects without regress.
    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::InvalidData
    );
    assert_eq!(store.last_block().unwrap().height, 99);
}

#[tokio::test]
async fn forward_extension_applies_new_blocks() {
    let now = Timestamp::now();
    let shared_minter = minter_key(14);
    let peer_key = minter_key(15);

    let mut local_chain = vec![genesis_block(now.minus(800))];
    local_chain.extend(extend(&local_chain[0], &shared_minter, 9, 60));
    let mut peer_chain = local_chain.clone();
    peer_chain.extend(extend(local_chain.last().unwrap(), &peer_key, 5, 30));

    let store = store_from_chain(&local_chain);
    register_minter(&store, &shared_minter, 1);
    register_minter(&store, &peer_key, 1);

    let remote = spawn_remote("peer-1", peer_chain.clone());
    let synchronizer = default_synchronizer(&store);

    assert_eq!(
        synchronizer.synchronize(&remote.peer, false).await,
        SynchronizationResult::Ok
    );
    let tip = store.last_block().unwrap();
    assert_eq!(tip.height, 15);
    assert_eq!(tip.signature, peer_chain.last().unwrap().signature);
}

// ── Block minter scenarios ──────────────────────────────────────────────

/// Wait until the chain reaches `height` or the timeout elapses.
async fn wait_for_height(store: &MemoryStore, height: u64, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if store.last_block().unwrap().height >= height {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn minting_store(tip_minter: &KeyPair, our_key: &KeyPair, now: Timestamp) -> Arc<MemoryStore> {
    let genesis = genesis_block(now.minus(700));
    let chain = {
        let mut chain = vec![genesis.clone()];
        chain.extend(extend(&genesis, tip_minter, 1, 60));
        chain
    };
    let store = store_from_chain(&chain);
    register_minter(&store, tip_minter, 1);
    register_minter(&store, our_key, 2);
    store.add_minting_key(our_key.public, our_key.private.0);
    store
}

#[tokio::test]
async fn minter_extends_chain_on_single_node_testnet() {
    let now = Timestamp::now();
    let our_key = minter_key(20);
    let store = minting_store(&minter_key(21), &our_key, now);
    let initial_height = store.last_block().unwrap().height;

    let mut node = Node::new(
        NodeConfig::single_node_testnet(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    let minting_possible = node.minting_possible();
    node.start();

    assert!(wait_for_height(&store, initial_height + 1, Duration::from_secs(5)).await);
    assert!(*minting_possible.borrow());
    node.stop().await;

    let tip = store.last_block().unwrap();
    assert_eq!(tip.minter_public_key, our_key.public);
}

#[tokio::test]
async fn minter_sits_out_after_minting_previous_block() {
    let now = Timestamp::now();
    let our_key = minter_key(22);
    // The current tip was minted by our own key.
    let store = minting_store(&our_key, &our_key, now);
    let initial_height = store.last_block().unwrap().height;

    let mut config = NodeConfig::default();
    config.min_peers_for_minting = 0;
    config.mint_interval_millis = 50;
    config.target_block_interval_secs = 1;

    let mut node = Node::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
    );
    node.start();

    tokio::time::sleep(Duration::from_millis(600)).await;
    node.stop().await;

    // Back-to-back self-minting is excluded outside test configurations.
    assert_eq!(store.last_block().unwrap().height, initial_height);
}

#[tokio::test]
async fn minter_stops_after_one_block_when_alone() {
    let now = Timestamp::now();
    let our_key = minter_key(23);
    let store = minting_store(&minter_key(24), &our_key, now);
    let initial_height = store.last_block().unwrap().height;

    let mut config = NodeConfig::default();
    config.min_peers_for_minting = 0;
    config.mint_interval_millis = 50;
    config.target_block_interval_secs = 1;

    let mut node = Node::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
    );
    node.start();

    assert!(wait_for_height(&store, initial_height + 1, Duration::from_secs(5)).await);
    // Once our key minted the tip, the next round must sit out.
    tokio::time::sleep(Duration::from_millis(400)).await;
    node.stop().await;

    assert_eq!(store.last_block().unwrap().height, initial_height + 1);
}

#[tokio::test]
async fn minted_block_carries_eligible_unconfirmed_transactions() {
    let now = Timestamp::now();
    let our_key = minter_key(25);
    let store = minting_store(&minter_key(26), &our_key, now);
    let initial_height = store.last_block().unwrap().height;

    let tx = |tag: u8, timestamp: Timestamp, deadline: Timestamp| Transaction {
        signature: Signature([tag; 64]),
        public_key: our_key.public,
        timestamp,
        deadline,
        fee: tag as u64,
        payload: vec![],
    };
    store
        .add_transaction(tx(1, now.minus(680), now.plus(3600)))
        .unwrap();
    store
        .add_transaction(tx(2, now.minus(680), now.plus(3600)))
        .unwrap();
    // Already expired — must be skipped.
    store
        .add_transaction(tx(3, now.minus(680), now.minus(650)))
        .unwrap();

    let mut node = Node::new(
        NodeConfig::single_node_testnet(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    node.start();
    assert!(wait_for_height(&store, initial_height + 1, Duration::from_secs(5)).await);
    node.stop().await;

    let minted = store
        .block_by_height(initial_height + 1)
        .unwrap()
        .expect("minted block");
    let carried: Vec<u8> = minted
        .transactions
        .iter()
        .map(|t| t.signature.0[0])
        .collect();
    assert!(carried.contains(&1));
    assert!(carried.contains(&2));
    assert!(!carried.contains(&3));

    // Confirmed transactions left the pool.
    let remaining = store.unconfirmed_transactions().unwrap();
    assert!(remaining.iter().all(|t| t.signature.0[0] == 3));
}

#[tokio::test]
async fn minter_holds_candidate_while_peer_chain_is_more_favorable() {
    let now = Timestamp::now();
    let our_key = minter_key(27);

    // Recent tip so minting is otherwise possible.
    let genesis = genesis_block(now.minus(160));
    let mut chain = vec![genesis.clone()];
    chain.extend(extend(&genesis, &minter_key(28), 1, 60));
    let store = store_from_chain(&chain);
    register_minter(&store, &minter_key(28), 1);
    register_minter(&store, &our_key, 2);
    store.add_minting_key(our_key.public, our_key.private.0);
    let tip = store.last_block().unwrap();

    let mut config = NodeConfig::default();
    config.min_peers_for_minting = 0;
    config.mint_interval_millis = 50;
    config.target_block_interval_secs = 1;
    config.candidate_hold_grace_secs = 3600;

    let mut node = Node::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
    );

    // A peer whose cached comparison says it is on a more favorable
    // (lower-weight) chain than anything we could mint.
    let remote = spawn_remote("ahead-peer", chain.clone());
    remote.peer.set_common_block_data(Some(CommonBlockData {
        common_block_summary: tip.summary(),
        summaries_after_common: Some(vec![BlockSummary {
            height: tip.height + 1,
            signature: BlockSignature([0xAB; 64]),
            minter_public_key: minter_key(29).public,
            minter_level: 1,
        }]),
        chain_weight: Some(BigUint::from(0u32)),
    }));
    node.peer_manager
        .write()
        .await
        .register(Arc::clone(&remote.peer));

    node.start();
    tokio::time::sleep(Duration::from_millis(800)).await;
    node.stop().await;

    // Held for the (long) grace period: no block was committed.
    assert_eq!(store.last_block().unwrap().height, tip.height);
}

#[tokio::test]
async fn minter_proceeds_once_hold_grace_expires() {
    let now = Timestamp::now();
    let our_key = minter_key(30);

    let genesis = genesis_block(now.minus(160));
    let mut chain = vec![genesis.clone()];
    chain.extend(extend(&genesis, &minter_key(31), 1, 60));
    let store = store_from_chain(&chain);
    register_minter(&store, &minter_key(31), 1);
    register_minter(&store, &our_key, 2);
    store.add_minting_key(our_key.public, our_key.private.0);
    let tip = store.last_block().unwrap();

    let mut config = NodeConfig::default();
    config.min_peers_for_minting = 0;
    config.mint_interval_millis = 50;
    config.target_block_interval_secs = 1;
    // Grace already expired: never stall indefinitely.
    config.candidate_hold_grace_secs = 0;

    let mut node = Node::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
    );

    let remote = spawn_remote("ahead-peer", chain.clone());
    remote.peer.set_common_block_data(Some(CommonBlockData {
        common_block_summary: tip.summary(),
        summaries_after_common: Some(vec![BlockSummary {
            height: tip.height + 1,
            signature: BlockSignature([0xAB; 64]),
            minter_public_key: minter_key(32).public,
            minter_level: 1,
        }]),
        chain_weight: Some(BigUint::from(0u32)),
    }));
    node.peer_manager
        .write()
        .await
        .register(Arc::clone(&remote.peer));

    node.start();
    assert!(wait_for_height(&store, tip.height + 1, Duration::from_secs(5)).await);
    node.stop().await;
}

// ── Node message serving ────────────────────────────────────────────────

#[tokio::test]
async fn node_serves_consensus_requests() {
    let now = Timestamp::now();
    let minter = minter_key(33);
    let genesis = genesis_block(now.minus(800));
    let mut chain = vec![genesis.clone()];
    chain.extend(extend(&genesis, &minter, 9, 60));
    let store = store_from_chain(&chain);
    register_minter(&store, &minter, 1);

    let node = Node::new(
        NodeConfig::default(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    let (peer, _handle) = Peer::new("client", REQUEST_TIMEOUT);

    // Tip announcements refresh the peer's cached claim.
    let claim = chain.last().unwrap().chain_tip();
    assert!(node
        .handle_message(&peer, Message::ChainTipAnnounce(claim.clone()))
        .is_none());
    assert_eq!(peer.chain_tip().unwrap(), claim);

    // Summaries after a known parent.
    let response = node
        .handle_message(
            &peer,
            Message::GetBlockSummaries {
                parent_signature: chain[4].signature,
                count: 3,
            },
        )
        .unwrap();
    match response {
        Message::BlockSummaries { summaries } => {
            assert_eq!(summaries.len(), 3);
            assert_eq!(summaries[0].height, chain[4].height + 1);
        }
        other => panic!("unexpected response: {}", other.kind()),
    }

    // Unknown parent yields an empty list, not an error.
    let response = node
        .handle_message(
            &peer,
            Message::GetBlockSummaries {
                parent_signature: BlockSignature([0xDD; 64]),
                count: 3,
            },
        )
        .unwrap();
    match response {
        Message::BlockSummaries { summaries } => assert!(summaries.is_empty()),
        other => panic!("unexpected response: {}", other.kind()),
    }

    // Signatures and full blocks by reference.
    let response = node
        .handle_message(
            &peer,
            Message::GetSignatures {
                parent_signature: chain[7].signature,
                count: 10,
            },
        )
        .unwrap();
    match response {
        Message::Signatures { signatures } => {
            assert_eq!(signatures.len(), 2);
            assert_eq!(signatures[0], chain[8].signature);
        }
        other => panic!("unexpected response: {}", other.kind()),
    }

    let response = node
        .handle_message(
            &peer,
            Message::GetBlock {
                signature: chain[3].signature,
            },
        )
        .unwrap();
    match response {
        Message::BlockResponse { block } => {
            assert_eq!(block.unwrap().height, chain[3].height);
        }
        other => panic!("unexpected response: {}", other.kind()),
    }
}

#[tokio::test]
async fn online_accounts_flow_through_the_node() {
    let now = Timestamp::now();
    let our_key = minter_key(34);
    let remote_key = minter_key(35);

    let genesis = genesis_block(now.minus(800));
    let store = store_from_chain(&[genesis]);
    register_minter(&store, &our_key, 2);
    register_minter(&store, &remote_key, 3);
    store.add_minting_key(our_key.public, our_key.private.0);

    let node = Node::new(
        NodeConfig::default(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    let manager = Arc::clone(&node.online_accounts);

    // Self-attestation puts our key online for the current bucket.
    let ours = manager.self_attest(now);
    assert_eq!(ours.len(), 1);
    assert_eq!(manager.count_current(now), 1);

    // A verified remote attestation is imported through the message path.
    let bucket = ours[0].timestamp;
    let remote_entry = forge_types::OnlineAccountEntry {
        timestamp: bucket,
        public_key: remote_key.public,
        signature: forge_crypto::sign_message(
            &forge_types::OnlineAccountEntry::signable_bytes(bucket),
            &remote_key.private,
        ),
    };
    let (peer, _handle) = Peer::new("gossip-peer", REQUEST_TIMEOUT);
    assert!(node
        .handle_message(
            &peer,
            Message::OnlineAccounts {
                entries: vec![remote_entry.clone()],
            },
        )
        .is_none());
    assert_eq!(manager.count_current(now), 2);

    // A forged attestation is rejected.
    let mut forged = remote_entry.clone();
    forged.public_key = minter_key(36).public;
    register_minter(&store, &minter_key(36), 1);
    node.handle_message(&peer, Message::OnlineAccounts { entries: vec![forged] });
    assert_eq!(manager.count_current(now), 2);

    // Serving a request excludes pairs the requester already knows.
    let response = node
        .handle_message(
            &peer,
            Message::GetOnlineAccounts {
                known: vec![(remote_entry.timestamp, remote_entry.public_key)],
            },
        )
        .unwrap();
    match response {
        Message::OnlineAccounts { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].public_key, our_key.public);
        }
        other => panic!("unexpected response: {}", other.kind()),
    }
}

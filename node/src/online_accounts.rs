//! Online-accounts gossip subsystem.
//!
//! Keeps the verified set of currently-online minting keys fresh:
//!
//! - **Self-attestation**: every broadcast interval, sign the current
//!   timestamp bucket with each eligible local minting key and announce
//!   the resulting entries.
//! - **Remote requests**: ask peers for entries we do not hold yet,
//!   excluding already-known (timestamp, key) pairs to bound bandwidth.
//! - **Expiry**: periodically purge entries that stopped refreshing.
//!
//! The set has its own lock, independent of the blockchain lock, and the
//! lock is never held across network or storage I/O: readers snapshot and
//! release, the import path verifies entries *before* taking the lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use forge_consensus::online_accounts::verify_entry;
use forge_consensus::OnlineAccountSet;
use forge_crypto::sign_message;
use forge_messages::{Message, MAX_ONLINE_ACCOUNTS_PER_MESSAGE};
use forge_network::{broadcast_with, PeerManager};
use forge_store::{effective_minter_level, AccountStore};
use forge_types::{OnlineAccountEntry, PublicKey, Timestamp};

use crate::config::NodeConfig;
use crate::shutdown::ShutdownController;

pub struct OnlineAccountsManager {
    set: Mutex<OnlineAccountSet>,
    accounts: Arc<dyn AccountStore>,
    peer_manager: Arc<RwLock<PeerManager>>,
    shutdown: Arc<ShutdownController>,
    config: Arc<NodeConfig>,
}

impl OnlineAccountsManager {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        peer_manager: Arc<RwLock<PeerManager>>,
        shutdown: Arc<ShutdownController>,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self {
            set: Mutex::new(OnlineAccountSet::new(config.online_timestamp_modulus_secs)),
            accounts,
            peer_manager,
            shutdown,
            config,
        }
    }

    /// Spawn the periodic tasks: self-attestation broadcast, remote
    /// requests, and the expiry sweep.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let broadcast_interval = Duration::from_secs(self.config.online_broadcast_interval_secs);
        let expiry_interval = Duration::from_secs(self.config.online_expiry_interval_secs);

        let attest = {
            let manager = Arc::clone(&self);
            let mut shutdown_rx = manager.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(broadcast_interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => manager.attest_and_broadcast().await,
                    }
                }
            })
        };

        let request = {
            let manager = Arc::clone(&self);
            let mut shutdown_rx = manager.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(broadcast_interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => manager.request_remote_accounts().await,
                    }
                }
            })
        };

        let expiry = {
            let manager = Arc::clone(&self);
            let mut shutdown_rx = manager.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(expiry_interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => manager.expire_old_accounts(Timestamp::now()),
                    }
                }
            })
        };

        vec![attest, request, expiry]
    }

    /// Sign the current timestamp bucket with every eligible local minting
    /// key and upsert the entries. Returns the entries that are ours.
    pub fn self_attest(&self, now: Timestamp) -> Vec<OnlineAccountEntry> {
        let minting_accounts = match self.accounts.minting_accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch minting accounts for attestation");
                return Vec::new();
            }
        };

        let bucket = self.lock_set().bucket(now);
        let message = OnlineAccountEntry::signable_bytes(bucket);

        let mut ours = Vec::new();
        for keypair in &minting_accounts {
            let level = effective_minter_level(self.accounts.as_ref(), &keypair.public)
                .unwrap_or(0);
            if level == 0 {
                continue;
            }
            ours.push(OnlineAccountEntry {
                timestamp: bucket,
                public_key: keypair.public,
                signature: sign_message(&message, &keypair.private),
            });
        }

        if !ours.is_empty() {
            let mut set = self.lock_set();
            for entry in &ours {
                set.upsert(entry.clone());
            }
        }
        ours
    }

    async fn attest_and_broadcast(&self) {
        let ours = self.self_attest(Timestamp::now());
        if ours.is_empty() {
            return;
        }
        tracing::trace!(count = ours.len(), "broadcasting own online accounts");

        let peers = self.peer_manager.read().await.handshaked();
        broadcast_with(&peers, |_| {
            Some(Message::OnlineAccounts {
                entries: ours.clone(),
            })
        });
    }

    /// Ask every eligible peer for entries we don't hold yet.
    async fn request_remote_accounts(&self) {
        let known = self.lock_set().known_pairs();
        let peers = self.peer_manager.read().await.handshaked();

        for peer in peers {
            if self.shutdown.is_stopping() {
                return;
            }
            if let Some(entries) = peer.get_online_accounts(known.clone()).await {
                self.import(entries);
            }
        }
    }

    /// Verify and merge a batch of gossiped entries. Verification runs
    /// without the set lock held; only the final upserts take it.
    pub fn import(&self, mut entries: Vec<OnlineAccountEntry>) -> usize {
        entries.truncate(MAX_ONLINE_ACCOUNTS_PER_MESSAGE);
        let now = Timestamp::now();
        let modulus = self.config.online_timestamp_modulus_secs;

        let resolver = |key: &PublicKey| {
            effective_minter_level(self.accounts.as_ref(), key).unwrap_or(0)
        };

        let verified: Vec<OnlineAccountEntry> = entries
            .into_iter()
            .filter(|entry| match verify_entry(modulus, entry, now, &resolver) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::trace!(key = %entry.public_key, %reason, "rejecting online account");
                    false
                }
            })
            .collect();

        if verified.is_empty() {
            return 0;
        }

        let mut set = self.lock_set();
        let mut added = 0;
        for entry in verified {
            if set.upsert(entry) {
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(added, total = set.len(), "merged verified online accounts");
        }
        added
    }

    /// Purge entries past the expiry window.
    pub fn expire_old_accounts(&self, now: Timestamp) {
        let purged = self.lock_set().purge_expired(now);
        if purged > 0 {
            tracing::debug!(purged, "expired stale online accounts");
        }
    }

    /// Snapshot of all live entries (copied under the lock, returned after
    /// release).
    pub fn snapshot(&self) -> Vec<OnlineAccountEntry> {
        self.lock_set().snapshot()
    }

    /// Live entries a requesting peer doesn't already know.
    pub fn entries_excluding(
        &self,
        known: &[(Timestamp, PublicKey)],
    ) -> Vec<OnlineAccountEntry> {
        let mut entries = self.lock_set().entries_excluding(known);
        entries.truncate(MAX_ONLINE_ACCOUNTS_PER_MESSAGE);
        entries
    }

    /// How many keys are attested for the current bucket.
    pub fn count_current(&self, now: Timestamp) -> u32 {
        let set = self.lock_set();
        let bucket = set.bucket(now);
        set.count_at(bucket)
    }

    fn lock_set(&self) -> std::sync::MutexGuard<'_, OnlineAccountSet> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }
}

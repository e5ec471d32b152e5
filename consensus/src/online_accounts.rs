//! Online-account set — verified, expiring minter attestations.
//!
//! Each entry attests that a minting key was online during a timestamp
//! bucket (`floor(now / modulus) * modulus`). The set holds at most one
//! live entry per public key; a strictly newer bucket replaces an older
//! one and ties keep the existing entry. Entries expire after
//! 2×modulus + 60 seconds without refresh.
//!
//! This type is pure state: locking, gossip, and the periodic sweeps live
//! in the node crate.

use std::collections::HashMap;

use thiserror::Error;

use forge_crypto::verify_signature;
use forge_types::{OnlineAccountEntry, PublicKey, Timestamp};

/// Why a remote entry was rejected during import verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum OnlineAccountRejection {
    #[error("timestamp out of range")]
    TimestampOutOfRange,

    #[error("timestamp is not bucket-aligned")]
    NotBucketAligned,

    #[error("signature does not verify")]
    BadSignature,

    #[error("key does not resolve to a mint-eligible account")]
    NotMintEligible,
}

/// Verify a remote entry against the given bucket modulus.
///
/// `resolve_level` maps a share public key to the effective minting level
/// of its underlying account (0 = not eligible). This is a free function
/// so callers can verify *without* holding a lock on the set — resolver
/// calls may hit storage.
pub fn verify_entry(
    modulus_secs: u64,
    entry: &OnlineAccountEntry,
    now: Timestamp,
    resolve_level: impl Fn(&PublicKey) -> u32,
) -> Result<(), OnlineAccountRejection> {
    if entry.timestamp.abs_diff(now) > 2 * modulus_secs {
        return Err(OnlineAccountRejection::TimestampOutOfRange);
    }
    if entry.timestamp.as_secs() % modulus_secs != 0 {
        return Err(OnlineAccountRejection::NotBucketAligned);
    }
    let message = OnlineAccountEntry::signable_bytes(entry.timestamp);
    if !verify_signature(&message, &entry.signature, &entry.public_key) {
        return Err(OnlineAccountRejection::BadSignature);
    }
    if resolve_level(&entry.public_key) == 0 {
        return Err(OnlineAccountRejection::NotMintEligible);
    }
    Ok(())
}

/// The verified set of currently-online minting keys.
pub struct OnlineAccountSet {
    modulus_secs: u64,
    entries: HashMap<PublicKey, OnlineAccountEntry>,
}

impl OnlineAccountSet {
    pub fn new(modulus_secs: u64) -> Self {
        Self {
            modulus_secs,
            entries: HashMap::new(),
        }
    }

    /// The bucket the given instant falls into.
    pub fn bucket(&self, now: Timestamp) -> Timestamp {
        Timestamp::new((now.as_secs() / self.modulus_secs) * self.modulus_secs)
    }

    /// Seconds after which an unrefreshed entry expires.
    pub fn expiry_secs(&self) -> u64 {
        2 * self.modulus_secs + 60
    }

    /// Verify a remote entry before import. See [`verify_entry`].
    pub fn verify_remote(
        &self,
        entry: &OnlineAccountEntry,
        now: Timestamp,
        resolve_level: impl Fn(&PublicKey) -> u32,
    ) -> Result<(), OnlineAccountRejection> {
        verify_entry(self.modulus_secs, entry, now, resolve_level)
    }

    /// Insert or replace the entry for its key.
    ///
    /// Returns `true` if the set changed. An entry only replaces an
    /// existing one when its timestamp is strictly newer; ties favor the
    /// existing entry.
    pub fn upsert(&mut self, entry: OnlineAccountEntry) -> bool {
        match self.entries.get(&entry.public_key) {
            Some(existing) if existing.timestamp >= entry.timestamp => false,
            _ => {
                self.entries.insert(entry.public_key, entry);
                true
            }
        }
    }

    /// Remove entries older than the expiry window. Returns how many were
    /// purged.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let expiry = self.expiry_secs();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.timestamp.has_expired(expiry, now));
        before - self.entries.len()
    }

    /// Copy of all live entries.
    pub fn snapshot(&self) -> Vec<OnlineAccountEntry> {
        self.entries.values().cloned().collect()
    }

    /// The (timestamp, key) pairs we already hold — sent with gossip
    /// requests so peers can skip them.
    pub fn known_pairs(&self) -> Vec<(Timestamp, PublicKey)> {
        self.entries
            .values()
            .map(|e| (e.timestamp, e.public_key))
            .collect()
    }

    /// Live entries not covered by the given known pairs (the serving side
    /// of a gossip request).
    pub fn entries_excluding(
        &self,
        known: &[(Timestamp, PublicKey)],
    ) -> Vec<OnlineAccountEntry> {
        self.entries
            .values()
            .filter(|e| !known.contains(&(e.timestamp, e.public_key)))
            .cloned()
            .collect()
    }

    /// Number of entries attested for the current bucket.
    pub fn count_at(&self, bucket: Timestamp) -> u32 {
        self.entries
            .values()
            .filter(|e| e.timestamp == bucket)
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

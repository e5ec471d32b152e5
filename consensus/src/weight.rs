//! Chain-weight arithmetic.
//!
//! Every block has an arbitrary-precision weight derived from its minter's
//! eligibility level and a keyed pseudo-random distance between the
//! minter's public key and the "ideal" key for the parent block. Summing
//! (with shifts) over a block range gives the cumulative subchain weight
//! used for fork choice.
//!
//! **Lower computed weight is more favorable**, for single candidates and
//! cumulative subchains alike: the level divides the distance, so
//! higher-level minters produce lower, more favorable weights. The values
//! exceed any fixed-width integer within a handful of blocks; `BigUint`
//! is load-bearing, not an abundance of caution.

use num_bigint::{BigInt, BigUint};
use std::sync::OnceLock;

use forge_crypto::sha256_multi;
use forge_types::{BlockSignature, BlockSummary, PublicKey};

/// Number of left-shifts applied to the accumulated weight per block when
/// calculating a chain's cumulative weight.
const CHAIN_WEIGHT_SHIFT: u32 = 8;

/// Largest possible key distance: 2^256 − 1.
fn max_distance() -> &'static BigUint {
    static MAX: OnceLock<BigUint> = OnceLock::new();
    MAX.get_or_init(|| BigUint::from_bytes_be(&[0xFF; 32]))
}

/// The "ideal" minter key for the child of the given parent block.
fn ideal_minter_key(parent_height: u64, parent_signature: &BlockSignature) -> [u8; 32] {
    sha256_multi(&[&parent_height.to_be_bytes(), parent_signature.as_bytes()])
}

/// A minter key perturbed by the height it is minting at.
fn height_perturbed_key(height: u64, public_key: &PublicKey) -> [u8; 32] {
    sha256_multi(&[&height.to_be_bytes(), public_key.as_bytes()])
}

/// Keyed pseudo-random distance of a minter key from the ideal key for the
/// next block after the given parent, scaled down by the minter's level.
///
/// Digest bytes are interpreted as signed (two's-complement) integers; the
/// difference magnitude never exceeds the maximum distance, so the result
/// is non-negative. Level 0 is normalized to 1.
pub fn key_distance(
    parent_height: u64,
    parent_signature: &BlockSignature,
    public_key: &PublicKey,
    minter_level: u32,
) -> BigUint {
    let ideal = BigInt::from_signed_bytes_be(&ideal_minter_key(parent_height, parent_signature));
    let perturbed =
        BigInt::from_signed_bytes_be(&height_perturbed_key(parent_height + 1, public_key));

    let diff = (ideal - perturbed).magnitude().clone();
    (max_distance() - diff) / BigUint::from(minter_level.max(1))
}

/// Weight of a single block summary on top of the given parent.
pub fn block_weight(
    parent_height: u64,
    parent_signature: &BlockSignature,
    summary: &BlockSummary,
) -> BigUint {
    key_distance(
        parent_height,
        parent_signature,
        &summary.minter_public_key,
        summary.minter_level,
    )
}

/// Cumulative weight of a subchain of summaries starting just above the
/// common block, truncated at `max_height`.
///
/// Both sides of a fork-choice comparison must pass the same `max_height`
/// (the highest *mutual* height) so they cover an equal number of blocks.
pub fn chain_weight(
    common_block_height: u64,
    common_block_signature: &BlockSignature,
    summaries: &[BlockSummary],
    max_height: u64,
) -> BigUint {
    let mut cumulative = BigUint::from(0u32);
    let mut parent_height = common_block_height;
    let mut parent_signature = *common_block_signature;

    for summary in summaries {
        if summary.height > max_height {
            break;
        }
        cumulative = (cumulative << CHAIN_WEIGHT_SHIFT)
            + block_weight(parent_height, &parent_signature, summary);
        parent_height = summary.height;
        parent_signature = summary.signature;
    }

    cumulative
}

/// Populate the minter level of each summary through the supplied
/// reward-share resolver.
///
/// A key that no longer resolves (cancelled reward-share, lost minting
/// rights) is weighed at level 1 rather than poisoning the comparison.
pub fn populate_minter_levels(
    summaries: &mut [BlockSummary],
    resolve_level: impl Fn(&PublicKey) -> u32,
) {
    for summary in summaries.iter_mut() {
        let level = resolve_level(&summary.minter_public_key);
        if level == 0 {
            tracing::debug!(
                minter = %summary.minter_public_key,
                height = summary.height,
                "unresolvable minter level, weighing at level 1"
            );
            summary.minter_level = 1;
        } else {
            summary.minter_level = level;
        }
    }
}

// =============================================================================
// MOONWIRE v1.2 - Payment Channel Engine & Routing Node
// =============================================================================
//
// Moonwire forwards conditional value transfers between off-chain payment
// channels anchored to an on-chain adjudicator. Two peers share a channel
// whose state is a sequence of doubly-signed, nonce-ordered updates; a
// routing node maintains one channel per counterparty and relays a transfer
// created on its sender-side channel by creating an equivalent transfer on
// the recipient-side channel.
//
// Module map:
// - types      core data model (channel, transfer, update, queue rows)
// - crypto     keccak/sha256 hashing, eth-style signatures, create2
// - merkle     active-transfer merkle commitment
// - interfaces external collaborator traits (store, lock, messaging, chain)
// - signer     secp256k1 channel signer
// - storage    sled-backed store + in-memory store
// - lock       in-process channel lock service
// - messaging  wire messages + in-process inbox transport
// - chain      transfer-definition registry + deposit ledger
// - events     typed engine event bus
// - validate   update validation and state transitions
// - engine     the two-party update protocol state machine
// - builder    user params -> protocol params conversion
// - router     forwarding engine (swaps, collateral, queued updates)
// - schema     data-driven param validation
// - rpc        chan_* JSON-RPC surface
// - config     node configuration
// - node       top-level wiring
//
// =============================================================================

pub mod types;
pub mod crypto;
pub mod merkle;
pub mod interfaces;
pub mod signer;
pub mod storage;
pub mod lock;
pub mod messaging;
pub mod chain;
pub mod events;
pub mod validate;
pub mod engine;
pub mod builder;
pub mod router;
pub mod schema;
pub mod rpc;
pub mod config;
pub mod node;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::UpdateEngine;
pub use node::RouterNode;
pub use router::ForwardingEngine;

// =============================================================================
// Protocol Constants
// =============================================================================

// --- Channel parameters ---

/// Default channel dispute timeout (seconds)
pub const DEFAULT_CHANNEL_TIMEOUT: u64 = 172_800;

/// Minimum accepted channel timeout (seconds)
pub const MIN_CHANNEL_TIMEOUT: u64 = 3_600;

/// Maximum accepted channel timeout (seconds)
pub const MAX_CHANNEL_TIMEOUT: u64 = 1_209_600;

// --- Transfer parameters ---

/// Default conditional-transfer timeout (seconds)
pub const DEFAULT_TRANSFER_TIMEOUT: u64 = 86_400;

/// Minimum conditional-transfer timeout (seconds)
pub const MIN_TRANSFER_TIMEOUT: u64 = 600;

/// Maximum conditional-transfer timeout (seconds)
pub const MAX_TRANSFER_TIMEOUT: u64 = 604_800;

/// Safety margin subtracted from the sender-side timeout when forwarding,
/// guaranteeing the router can still resolve the sender side after the
/// recipient resolves.
pub const TRANSFER_DECREMENT: u64 = 3_600;

// --- Protocol exchange ---

/// How many times the leader retries a deposit update that failed with
/// `BadSignatures` (the on-chain deposit race).
pub const DEPOSIT_RETRIES: u32 = 3;

/// Timeout for a single outbound protocol exchange (milliseconds)
pub const PROTOCOL_MESSAGE_TIMEOUT_MS: u64 = 15_000;

/// Timeout for withdraw confirmation exchanges (milliseconds)
pub const WITHDRAW_CONFIRMATION_TIMEOUT_MS: u64 = 90_000;

/// Timeout for a liveness probe (milliseconds)
pub const PROBE_TIMEOUT_MS: u64 = 5_000;

/// Timeout waiting on the channel lock (milliseconds)
pub const LOCK_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

/// Timeout waiting for a restore acknowledgment (milliseconds)
pub const RESTORE_ACK_TIMEOUT_MS: u64 = 15_000;

// --- Registered transfer definitions ---

/// Registry name of the hashlock transfer definition
pub const HASHLOCK_TRANSFER_NAME: &str = "HashlockTransfer";

/// Registry name of the withdraw definition
pub const WITHDRAW_TRANSFER_NAME: &str = "Withdraw";

// =============================================================================
// Shared Helpers
// =============================================================================

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

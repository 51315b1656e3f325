// =============================================================================
// MOONWIRE v1.1 - Chain Reader
// =============================================================================
//
// The engine's read-only window onto the chains it is anchored to: the
// transfer-definition registry, deterministic channel-address derivation,
// cumulative deposit totals, and dispute records.
//
// Two definitions ship with the registry:
//
// - HashlockTransfer: locked by sha256(preimage) == lock_hash, optional
//   expiry; the zero preimage is the canonical cancel resolver and returns
//   funds to the initiator.
// - Withdraw: a transfer whose resolution triggers an on-chain payout. The
//   initiator signs the withdrawal commitment at create time, the responder
//   counter-signs to resolve; the resolved balance is zero on both slots
//   because the funds leave the channel.
//
// `MemoryChainReader` simulates the chain in-process for tests and dev
// nodes; its deposit ledger stands in for the multisig's deposit tracking.
//
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::crypto;
use crate::interfaces::{ChainReader, RegisteredTransfer};
use crate::types::{
    Address, Balance, Bytes32, ChannelDispute, EngineError, Signature, Transfer,
};
use crate::{unix_now, HASHLOCK_TRANSFER_NAME, WITHDRAW_TRANSFER_NAME};

// =============================================================================
// Definition Addresses
// =============================================================================

/// Address the hashlock definition is registered under
pub const HASHLOCK_DEFINITION_ADDRESS: Address = Address([0x21; 20]);

/// Address the withdraw definition is registered under
pub const WITHDRAW_DEFINITION_ADDRESS: Address = Address([0x22; 20]);

// =============================================================================
// Hashlock Definition
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashlockState {
    pub lock_hash: Bytes32,
    /// Absolute unix expiry; 0 disables the time bound
    #[serde(default)]
    pub expiry: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashlockResolver {
    pub pre_image: Bytes32,
}

/// Pure resolve semantics of the hashlock definition.
pub fn evaluate_hashlock(
    transfer: &Transfer,
    resolver: &serde_json::Value,
) -> Result<Balance, EngineError> {
    let state: HashlockState = serde_json::from_value(transfer.transfer_state.clone())
        .map_err(|e| EngineError::validation(format!("malformed hashlock state: {}", e)))?;
    let resolver: HashlockResolver = serde_json::from_value(resolver.clone())
        .map_err(|e| EngineError::validation(format!("malformed hashlock resolver: {}", e)))?;

    // the zero preimage cancels, returning funds to the initiator
    if resolver.pre_image.is_zero() {
        return Ok(transfer.balance.clone());
    }

    if state.expiry > 0 && unix_now() > state.expiry {
        return Err(EngineError::validation("hashlock expired; only cancellation is possible")
            .with_transfer(transfer.transfer_id));
    }

    if crypto::sha256(&resolver.pre_image.0) != state.lock_hash {
        return Err(EngineError::validation("preimage does not match lock hash")
            .with_transfer(transfer.transfer_id));
    }

    Ok(Balance {
        to: transfer.balance.to,
        amount: [0, transfer.balance.total()],
    })
}

// =============================================================================
// Withdraw Definition
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawState {
    pub recipient: Address,
    pub nonce: u64,
    #[serde(default, with = "crate::types::serde_amount")]
    pub fee: u128,
    pub initiator_signature: Signature,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawResolver {
    pub responder_signature: Signature,
}

/// The digest both participants sign to authorize an on-chain payout.
pub fn withdraw_commitment_hash(
    channel_address: &Address,
    recipient: &Address,
    asset_id: &Address,
    amount: u128,
    nonce: u64,
) -> Bytes32 {
    let mut data = Vec::with_capacity(20 + 20 + 20 + 16 + 8);
    data.extend_from_slice(&channel_address.0);
    data.extend_from_slice(&recipient.0);
    data.extend_from_slice(&asset_id.0);
    data.extend_from_slice(&amount.to_be_bytes());
    data.extend_from_slice(&nonce.to_be_bytes());
    crypto::keccak256(&data)
}

/// Pure resolve semantics of the withdraw definition.
pub fn evaluate_withdraw(
    transfer: &Transfer,
    resolver: &serde_json::Value,
) -> Result<Balance, EngineError> {
    let state: WithdrawState = serde_json::from_value(transfer.transfer_state.clone())
        .map_err(|e| EngineError::validation(format!("malformed withdraw state: {}", e)))?;
    let resolver: WithdrawResolver = serde_json::from_value(resolver.clone())
        .map_err(|e| EngineError::validation(format!("malformed withdraw resolver: {}", e)))?;

    // the zero signature cancels, returning funds to the initiator
    if resolver.responder_signature.is_zero() {
        return Ok(transfer.balance.clone());
    }

    let commitment = withdraw_commitment_hash(
        &transfer.channel_address,
        &state.recipient,
        &transfer.asset_id,
        transfer.balance.total(),
        state.nonce,
    );
    crypto::verify_signature(&commitment, &resolver.responder_signature, &transfer.responder)
        .map_err(|e| {
            EngineError::validation(format!("withdraw counter-signature invalid: {}", e))
                .with_transfer(transfer.transfer_id)
        })?;
    crypto::verify_signature(&commitment, &state.initiator_signature, &transfer.initiator)
        .map_err(|e| {
            EngineError::validation(format!("withdraw initiator signature invalid: {}", e))
                .with_transfer(transfer.transfer_id)
        })?;

    // funds leave the channel; the adjudicator pays the recipient on-chain
    Ok(Balance {
        to: transfer.balance.to,
        amount: [0, 0],
    })
}

// =============================================================================
// Default Registry
// =============================================================================

/// The registry rows every chain ships in-process.
pub fn default_registry() -> Vec<RegisteredTransfer> {
    vec![
        RegisteredTransfer {
            name: HASHLOCK_TRANSFER_NAME.to_string(),
            definition: HASHLOCK_DEFINITION_ADDRESS,
            state_encoding: "(bytes32 lock_hash, uint64 expiry)".to_string(),
            resolver_encoding: "(bytes32 pre_image)".to_string(),
            cancel_resolver: serde_json::json!({ "pre_image": Bytes32::zero() }),
        },
        RegisteredTransfer {
            name: WITHDRAW_TRANSFER_NAME.to_string(),
            definition: WITHDRAW_DEFINITION_ADDRESS,
            state_encoding:
                "(address recipient, uint64 nonce, uint128 fee, bytes initiator_signature)"
                    .to_string(),
            resolver_encoding: "(bytes responder_signature)".to_string(),
            cancel_resolver: serde_json::json!({ "responder_signature": Signature::zero() }),
        },
    ]
}

// =============================================================================
// In-Process Chain Reader
// =============================================================================

#[derive(Default)]
struct ChainInner {
    /// (channel, chain, asset, alice_side) -> cumulative deposit total
    deposits: HashMap<(Address, u64, Address, bool), u128>,
    disputes: HashMap<(Address, u64), ChannelDispute>,
    syncing: HashSet<u64>,
}

/// Chain reader backed by an in-process ledger. Deterministic derivations
/// (channel address, registry) are computed; deposits and disputes are fed
/// by tests or by the dev deployment's funding path.
pub struct MemoryChainReader {
    registry: Vec<RegisteredTransfer>,
    inner: Mutex<ChainInner>,
}

impl MemoryChainReader {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryChainReader {
            registry: default_registry(),
            inner: Mutex::new(ChainInner::default()),
        })
    }

    /// Record an on-chain deposit for one side of a channel.
    pub fn credit_deposit(
        &self,
        channel: &Address,
        chain_id: u64,
        asset_id: &Address,
        alice_side: bool,
        amount: u128,
    ) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .deposits
            .entry((*channel, chain_id, *asset_id, alice_side))
            .or_insert(0) += amount;
    }

    pub fn set_dispute(&self, chain_id: u64, dispute: ChannelDispute) {
        self.inner
            .lock()
            .unwrap()
            .disputes
            .insert((dispute.channel_address, chain_id), dispute);
    }

    pub fn set_syncing(&self, chain_id: u64, syncing: bool) {
        let mut inner = self.inner.lock().unwrap();
        if syncing {
            inner.syncing.insert(chain_id);
        } else {
            inner.syncing.remove(&chain_id);
        }
    }
}

#[async_trait]
impl ChainReader for MemoryChainReader {
    async fn get_channel_address(
        &self,
        alice: &Address,
        bob: &Address,
        chain_id: u64,
        factory: &Address,
    ) -> Result<Address, EngineError> {
        Ok(crypto::derive_channel_address(alice, bob, chain_id, factory))
    }

    async fn get_registered_transfers(
        &self,
        _registry: &Address,
        _chain_id: u64,
    ) -> Result<Vec<RegisteredTransfer>, EngineError> {
        Ok(self.registry.clone())
    }

    async fn resolve_transfer(
        &self,
        transfer: &Transfer,
        resolver: &serde_json::Value,
    ) -> Result<Balance, EngineError> {
        if transfer.transfer_definition == HASHLOCK_DEFINITION_ADDRESS {
            evaluate_hashlock(transfer, resolver)
        } else if transfer.transfer_definition == WITHDRAW_DEFINITION_ADDRESS {
            evaluate_withdraw(transfer, resolver)
        } else {
            Err(EngineError::invalid_transfer_type(format!(
                "definition {} not registered",
                transfer.transfer_definition
            )))
        }
    }

    async fn get_channel_dispute(
        &self,
        channel: &Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, EngineError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .disputes
            .get(&(*channel, chain_id))
            .cloned())
    }

    async fn latest_deposit_by_asset_id(
        &self,
        channel: &Address,
        chain_id: u64,
        asset_id: &Address,
        alice_side: bool,
    ) -> Result<u128, EngineError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .deposits
            .get(&(*channel, chain_id, *asset_id, alice_side))
            .copied()
            .unwrap_or(0))
    }

    async fn get_syncing(&self, chain_id: u64) -> Result<bool, EngineError> {
        Ok(self.inner.lock().unwrap().syncing.contains(&chain_id))
    }
}

// =============================================================================
// Tests
// =============================================================================

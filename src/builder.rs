// =============================================================================
// MOONWIRE v1.1 - Transfer Builder
// =============================================================================
//
// Converts user-facing transfer intents into protocol update params: the
// transfer definition is resolved against the on-chain registry by name or
// literal address, routing metadata gets a fresh routing id and path, and
// hashlock preimages are derived into lock hashes (and encrypted to the end
// recipient when the payment routes onward).
//
// Withdrawals are modeled as a transfer on the withdraw definition whose
// resolution triggers the on-chain payout.
//
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::chain::{withdraw_commitment_hash, HashlockState, WithdrawState};
use crate::crypto;
use crate::interfaces::{ChainReader, RegisteredTransfer, Signer};
use crate::types::{
    Address, Balance, Bytes32, ChannelState, CreateParams, EngineError, Identifier,
    ResolveParams, RoutingMeta, RoutingPathNode,
};
use crate::{DEFAULT_TRANSFER_TIMEOUT, HASHLOCK_TRANSFER_NAME, WITHDRAW_TRANSFER_NAME};

// =============================================================================
// Inputs
// =============================================================================

/// A user-facing conditional transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConditionalTransferInput {
    pub channel_address: Address,
    /// Registered definition name (e.g. "HashlockTransfer") or its literal
    /// 0x address
    pub transfer_type: String,
    #[serde(with = "crate::types::serde_amount")]
    pub amount: u128,
    pub asset_id: Address,
    /// Condition-specific fields (`lock_hash` or `pre_image`, `expiry`, ...)
    #[serde(default)]
    pub details: serde_json::Value,
    /// End recipient of a routed payment
    #[serde(default)]
    pub recipient: Option<Identifier>,
    #[serde(default)]
    pub recipient_chain_id: Option<u64>,
    #[serde(default)]
    pub recipient_asset_id: Option<Address>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// A user-facing resolve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveConditionInput {
    pub channel_address: Address,
    pub transfer_id: Bytes32,
    pub transfer_resolver: serde_json::Value,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// A user-facing withdrawal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawInput {
    pub channel_address: Address,
    #[serde(with = "crate::types::serde_amount")]
    pub amount: u128,
    pub asset_id: Address,
    /// On-chain payout address
    pub recipient: Address,
    #[serde(default, with = "crate::types::serde_amount_opt")]
    pub fee: Option<u128>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

// =============================================================================
// Definition Lookup
// =============================================================================

/// Resolve a transfer type against the chain registry by registered name or
/// literal address.
pub async fn resolve_transfer_definition(
    chain: &dyn ChainReader,
    channel: &ChannelState,
    transfer_type: &str,
) -> Result<RegisteredTransfer, EngineError> {
    let registered = chain
        .get_registered_transfers(
            &channel.network_context.transfer_registry_address,
            channel.chain_id,
        )
        .await?;
    let by_address = Address::from_hex(transfer_type).ok();
    registered
        .into_iter()
        .find(|r| {
            r.name == transfer_type || by_address.map(|a| a == r.definition).unwrap_or(false)
        })
        .ok_or_else(|| {
            EngineError::invalid_transfer_type(format!(
                "transfer type {:?} is not registered",
                transfer_type
            ))
        })
}

// =============================================================================
// Conversions
// =============================================================================

/// Build protocol `create` params from a conditional transfer intent.
pub async fn convert_conditional_transfer_params(
    input: ConditionalTransferInput,
    signer: &dyn Signer,
    channel: &ChannelState,
    chain: &dyn ChainReader,
) -> Result<CreateParams, EngineError> {
    let definition = resolve_transfer_definition(chain, channel, &input.transfer_type).await?;

    let counterparty = channel
        .counterparty_identifier(&signer.public_identifier())
        .ok_or_else(|| {
            EngineError::validation("signer is not a participant of this channel")
                .with_channel(channel.channel_address)
        })?;
    let our_side = channel
        .side_of(&signer.public_identifier())
        .ok_or_else(|| {
            EngineError::validation("signer is not a participant of this channel")
                .with_channel(channel.channel_address)
        })?;

    // routing metadata: keep an existing routing id, mint one otherwise
    let existing = RoutingMeta::from_value(&input.meta);
    let mut meta_value = input.meta.clone();
    if let Some(recipient) = input.recipient {
        let routing = RoutingMeta {
            routing_id: existing
                .as_ref()
                .map(|m| m.routing_id)
                .unwrap_or_else(|| Bytes32::from_bytes(rand::random())),
            path: vec![RoutingPathNode {
                recipient,
                recipient_asset_id: input.recipient_asset_id,
                recipient_chain_id: input.recipient_chain_id,
            }],
            require_online: existing.as_ref().map(|m| m.require_online).unwrap_or(false),
            sender_identifier: None,
            encrypted_pre_image: None,
        };
        meta_value = routing.to_value();
    }

    // definition-specific initial state
    let initial_state = if definition.name == HASHLOCK_TRANSFER_NAME {
        build_hashlock_state(&input, channel, &counterparty, &mut meta_value)?
    } else {
        input.details.clone()
    };

    Ok(CreateParams {
        channel_address: channel.channel_address,
        balance: Balance::new(
            [
                channel.participant(our_side),
                channel.participant(our_side.other()),
            ],
            [input.amount, 0],
        ),
        asset_id: input.asset_id,
        transfer_definition: definition.definition,
        transfer_initial_state: initial_state,
        timeout: input.timeout.unwrap_or(DEFAULT_TRANSFER_TIMEOUT),
        meta: meta_value,
    })
}

/// The hashlock initial state: a given lock hash, or one derived from a
/// supplied preimage. A supplied preimage never enters the signed state; for
/// routed payments it travels encrypted under the end recipient's
/// identifier.
fn build_hashlock_state(
    input: &ConditionalTransferInput,
    channel: &ChannelState,
    counterparty: &Identifier,
    meta_value: &mut serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
    let expiry = input
        .details
        .get("expiry")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let lock_hash = match input.details.get("lock_hash") {
        Some(value) => {
            let raw = value
                .as_str()
                .ok_or_else(|| EngineError::validation("lock_hash must be a hex string"))?;
            Bytes32::from_hex(raw).map_err(EngineError::validation)?
        }
        None => {
            let raw = input
                .details
                .get("pre_image")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    EngineError::validation("hashlock needs lock_hash or pre_image")
                })?;
            let pre_image = Bytes32::from_hex(raw).map_err(EngineError::validation)?;

            // deliver the secret out-of-band when the payment routes past
            // the direct counterparty
            if let Some(recipient) = input.recipient {
                if recipient != *counterparty {
                    let encrypted =
                        crypto::encrypt_to_identifier(&pre_image.0, &recipient)
                            .map_err(EngineError::external)?;
                    if let Some(mut meta) = RoutingMeta::from_value(meta_value) {
                        meta.encrypted_pre_image = Some(encrypted);
                        *meta_value = meta.to_value();
                    }
                }
            }
            crypto::sha256(&pre_image.0)
        }
    };

    serde_json::to_value(HashlockState { lock_hash, expiry }).map_err(|e| {
        EngineError::validation(format!("unencodable hashlock state: {}", e))
            .with_channel(channel.channel_address)
    })
}

/// Build protocol `resolve` params from a resolve intent.
pub fn convert_resolve_condition_params(input: ResolveConditionInput) -> ResolveParams {
    ResolveParams {
        channel_address: input.channel_address,
        transfer_id: input.transfer_id,
        transfer_resolver: input.transfer_resolver,
        meta: input.meta,
    }
}

/// Build protocol `create` params for a withdrawal: a transfer on the
/// withdraw definition whose initial state carries the initiator's signed
/// payout commitment.
pub async fn convert_withdraw_params(
    input: WithdrawInput,
    signer: &dyn Signer,
    channel: &ChannelState,
    chain: &dyn ChainReader,
) -> Result<CreateParams, EngineError> {
    let definition =
        resolve_transfer_definition(chain, channel, WITHDRAW_TRANSFER_NAME).await?;
    let our_side = channel
        .side_of(&signer.public_identifier())
        .ok_or_else(|| {
            EngineError::validation("signer is not a participant of this channel")
                .with_channel(channel.channel_address)
        })?;

    let fee = input.fee.unwrap_or(0);
    let locked = input
        .amount
        .checked_add(fee)
        .ok_or_else(|| EngineError::validation("withdraw amount overflows"))?;
    let nonce: u64 = rand::random();
    let commitment = withdraw_commitment_hash(
        &channel.channel_address,
        &input.recipient,
        &input.asset_id,
        locked,
        nonce,
    );
    let initiator_signature = signer.sign_commitment(&commitment).await?;

    let state = WithdrawState {
        recipient: input.recipient,
        nonce,
        fee,
        initiator_signature,
    };

    Ok(CreateParams {
        channel_address: channel.channel_address,
        balance: Balance::new(
            [input.recipient, channel.participant(our_side.other())],
            [locked, 0],
        ),
        asset_id: input.asset_id,
        transfer_definition: definition.definition,
        transfer_initial_state: serde_json::to_value(state)
            .map_err(|e| EngineError::validation(format!("unencodable withdraw state: {}", e)))?,
        timeout: input.timeout.unwrap_or(DEFAULT_TRANSFER_TIMEOUT),
        meta: serde_json::Value::Null,
    })
}

// =============================================================================
// Tests
// =============================================================================

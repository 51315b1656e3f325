// =============================================================================
// MOONWIRE v1.2 - Update Validation & State Transitions
// =============================================================================
//
// The pure core of the update protocol. Every update variant has one
// transition function that derives the post-update channel state (and the
// transfer delta) from the previous state plus the update's parameters.
//
// The leader runs a transition to generate the update it signs; the follower
// re-runs the same transition from its own view and compares the claimed
// balance, merkle root and transfer id against what it derived. Any mismatch
// rejects the update; for deposits the mismatch is the on-chain race and is
// reported as `BadSignatures` so the leader retries.
//
// =============================================================================

use crate::crypto;
use crate::interfaces::{ChainReader, TransferDelta};
use crate::merkle;
use crate::types::{
    Address, Balance, Bytes32, ChannelSide, ChannelState, CreateParams, CreateUpdateDetails,
    DepositUpdateDetails, EngineError, Identifier, NetworkContext, ResolveUpdateDetails,
    SetupUpdateDetails, Transfer, Update, UpdateDetails, UpdateParams,
};
use crate::{MAX_CHANNEL_TIMEOUT, MAX_TRANSFER_TIMEOUT, MIN_CHANNEL_TIMEOUT, MIN_TRANSFER_TIMEOUT};

/// A derived post-update state: the new channel (with an unsigned
/// `latest_update` attached) plus what changed in the transfer table.
#[derive(Clone, Debug)]
pub struct Prepared {
    pub channel: ChannelState,
    pub delta: TransferDelta,
}

// =============================================================================
// Identity Derivations
// =============================================================================

/// Canonical encoding of a definition-specific initial state: serde_json
/// with sorted object keys, so both peers hash identical bytes.
pub fn encode_initial_state(state: &serde_json::Value) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(state)
        .map_err(|e| EngineError::validation(format!("unencodable initial state: {}", e)))
}

/// Deterministic transfer id: both peers derive the same id for the same
/// create update, so their merkle roots agree.
pub fn derive_transfer_id(
    channel_address: &Address,
    channel_nonce: u64,
    definition: &Address,
    initial_state_hash: &Bytes32,
) -> Bytes32 {
    let mut data = Vec::with_capacity(20 + 8 + 20 + 32);
    data.extend_from_slice(&channel_address.0);
    data.extend_from_slice(&channel_nonce.to_be_bytes());
    data.extend_from_slice(&definition.0);
    data.extend_from_slice(&initial_state_hash.0);
    crypto::keccak256(&data)
}

// =============================================================================
// Outbound Param Checks
// =============================================================================

/// Contextual validation of user-supplied params before a transition runs.
pub fn validate_params(
    params: &UpdateParams,
    own_identifier: &Identifier,
) -> Result<(), EngineError> {
    match params {
        UpdateParams::Setup(p) => {
            if p.counterparty_identifier == *own_identifier {
                return Err(EngineError::validation("cannot open a channel with self"));
            }
            if p.timeout < MIN_CHANNEL_TIMEOUT || p.timeout > MAX_CHANNEL_TIMEOUT {
                return Err(EngineError::validation(format!(
                    "channel timeout {} outside [{}, {}]",
                    p.timeout, MIN_CHANNEL_TIMEOUT, MAX_CHANNEL_TIMEOUT
                )));
            }
            Ok(())
        }
        UpdateParams::Deposit(_) => Ok(()),
        UpdateParams::Create(p) => {
            if p.balance.total() == 0 {
                return Err(EngineError::validation("cannot create a zero-value transfer"));
            }
            if p.timeout < MIN_TRANSFER_TIMEOUT || p.timeout > MAX_TRANSFER_TIMEOUT {
                return Err(EngineError::validation(format!(
                    "transfer timeout {} outside [{}, {}]",
                    p.timeout, MIN_TRANSFER_TIMEOUT, MAX_TRANSFER_TIMEOUT
                )));
            }
            Ok(())
        }
        UpdateParams::Resolve(_) => Ok(()),
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// Setup: nonce 1, empty balances, empty-tree root. The initiating peer is
/// Bob; the counterparty becomes Alice.
pub fn setup_transition(
    channel_address: Address,
    bob_identifier: &Identifier,
    alice_identifier: &Identifier,
    timeout: u64,
    network_context: &NetworkContext,
) -> Result<Prepared, EngineError> {
    if timeout < MIN_CHANNEL_TIMEOUT || timeout > MAX_CHANNEL_TIMEOUT {
        return Err(EngineError::validation(format!(
            "channel timeout {} outside [{}, {}]",
            timeout, MIN_CHANNEL_TIMEOUT, MAX_CHANNEL_TIMEOUT
        )));
    }
    let alice = crypto::identifier_to_address(alice_identifier)
        .map_err(EngineError::validation)?;
    let bob = crypto::identifier_to_address(bob_identifier).map_err(EngineError::validation)?;
    if alice == bob {
        return Err(EngineError::validation("channel participants must differ"));
    }

    let update = Update {
        channel_address,
        from_identifier: *bob_identifier,
        to_identifier: *alice_identifier,
        nonce: 1,
        balance: Balance::empty([alice, bob]),
        asset_id: Address::zero(),
        details: UpdateDetails::Setup(SetupUpdateDetails {
            timeout,
            network_context: network_context.clone(),
        }),
        alice_signature: None,
        bob_signature: None,
    };

    let channel = ChannelState {
        channel_address,
        alice_identifier: *alice_identifier,
        bob_identifier: *bob_identifier,
        alice,
        bob,
        chain_id: network_context.chain_id,
        network_context: network_context.clone(),
        nonce: 1,
        latest_update: update,
        balances: Vec::new(),
        processed_deposits_alice: Vec::new(),
        processed_deposits_bob: Vec::new(),
        asset_ids: Vec::new(),
        merkle_root: merkle::EMPTY_ROOT,
        timeout,
        in_dispute: false,
    };

    Ok(Prepared {
        channel,
        delta: TransferDelta::none(),
    })
}

/// Deposit: reconcile on-chain cumulative totals against the processed
/// markers; the delta lands in each side's channel balance. A no-op deposit
/// (zero delta on both sides) is still a valid update.
pub async fn deposit_transition(
    channel: &ChannelState,
    from: &Identifier,
    asset_id: Address,
    chain: &dyn ChainReader,
) -> Result<Prepared, EngineError> {
    let to = channel
        .counterparty_identifier(from)
        .ok_or_else(|| EngineError::validation("sender is not a channel participant"))?;

    let total_alice = chain
        .latest_deposit_by_asset_id(&channel.channel_address, channel.chain_id, &asset_id, true)
        .await?;
    let total_bob = chain
        .latest_deposit_by_asset_id(&channel.channel_address, channel.chain_id, &asset_id, false)
        .await?;

    let mut next = channel.clone();
    let index = next.ensure_asset(asset_id);

    let delta_alice = total_alice
        .checked_sub(next.processed_deposits_alice[index])
        .ok_or_else(|| {
            EngineError::external("on-chain deposit total regressed below processed marker")
                .with_channel(channel.channel_address)
        })?;
    let delta_bob = total_bob
        .checked_sub(next.processed_deposits_bob[index])
        .ok_or_else(|| {
            EngineError::external("on-chain deposit total regressed below processed marker")
                .with_channel(channel.channel_address)
        })?;

    next.balances[index].amount[0] += delta_alice;
    next.balances[index].amount[1] += delta_bob;
    next.processed_deposits_alice[index] = total_alice;
    next.processed_deposits_bob[index] = total_bob;
    next.nonce = channel.nonce + 1;

    next.latest_update = Update {
        channel_address: channel.channel_address,
        from_identifier: *from,
        to_identifier: to,
        nonce: next.nonce,
        balance: next.balances[index].clone(),
        asset_id,
        details: UpdateDetails::Deposit(DepositUpdateDetails {
            total_deposits_alice: total_alice,
            total_deposits_bob: total_bob,
        }),
        alice_signature: None,
        bob_signature: None,
    };

    Ok(Prepared {
        channel: next,
        delta: TransferDelta::none(),
    })
}

/// Create: lock a transfer balance out of the channel balance and commit the
/// new transfer into the merkle root.
pub fn create_transition(
    channel: &ChannelState,
    active: &[Transfer],
    from: &Identifier,
    params: &CreateParams,
) -> Result<Prepared, EngineError> {
    let initiator_side = channel
        .side_of(from)
        .ok_or_else(|| EngineError::validation("sender is not a channel participant"))?;
    let to = channel
        .counterparty_identifier(from)
        .ok_or_else(|| EngineError::validation("sender is not a channel participant"))?;

    let encoded_state = encode_initial_state(&params.transfer_initial_state)?;
    let initial_state_hash = crypto::keccak256(&encoded_state);
    let nonce = channel.nonce + 1;
    let transfer_id = derive_transfer_id(
        &channel.channel_address,
        nonce,
        &params.transfer_definition,
        &initial_state_hash,
    );

    let transfer = Transfer {
        transfer_id,
        channel_address: channel.channel_address,
        initiator: channel.participant(initiator_side),
        responder: channel.participant(initiator_side.other()),
        transfer_definition: params.transfer_definition,
        transfer_timeout: params.timeout,
        initial_state_hash,
        transfer_state: params.transfer_initial_state.clone(),
        transfer_resolver: None,
        balance: params.balance.clone(),
        asset_id: params.asset_id,
        chain_id: channel.chain_id,
        meta: params.meta.clone(),
        channel_nonce: nonce,
        in_dispute: false,
    };

    let mut next = channel.clone();
    let index = next.ensure_asset(params.asset_id);

    // slot 0 funds come from the initiator side, slot 1 from the responder
    let sides = [initiator_side, initiator_side.other()];
    for (slot, side) in sides.iter().enumerate() {
        let locked = params.balance.amount[slot];
        let available = next.balances[index].amount[side.index()];
        next.balances[index].amount[side.index()] =
            available.checked_sub(locked).ok_or_else(|| {
                EngineError::validation(format!(
                    "insufficient channel balance: need {}, have {}",
                    locked, available
                ))
                .with_channel(channel.channel_address)
            })?;
    }

    let mut new_active: Vec<Transfer> = active.to_vec();
    new_active.push(transfer.clone());
    let merkle_root = merkle::active_transfer_root(&new_active);
    let merkle_proof_data = merkle::active_transfer_proof(&new_active, &transfer_id)
        .map(|p| p.sibling_hashes())
        .unwrap_or_default();

    next.merkle_root = merkle_root;
    next.nonce = nonce;
    next.latest_update = Update {
        channel_address: channel.channel_address,
        from_identifier: *from,
        to_identifier: to,
        nonce,
        balance: next.balances[index].clone(),
        asset_id: params.asset_id,
        details: UpdateDetails::Create(CreateUpdateDetails {
            transfer_id,
            transfer_definition: params.transfer_definition,
            transfer_timeout: params.timeout,
            transfer_initial_state: params.transfer_initial_state.clone(),
            transfer_encoded_state: encoded_state,
            transfer_balance: params.balance.clone(),
            merkle_root,
            merkle_proof_data,
            meta: params.meta.clone(),
        }),
        alice_signature: None,
        bob_signature: None,
    };

    Ok(Prepared {
        channel: next,
        delta: TransferDelta::created(transfer),
    })
}

/// Resolve: evaluate the definition's resolve semantics, credit the
/// post-resolve balance back into the channel, drop the transfer from the
/// root. The definition may distribute less than was locked (a withdraw pays
/// out on-chain); it can never distribute more.
pub async fn resolve_transition(
    channel: &ChannelState,
    active: &[Transfer],
    from: &Identifier,
    transfer_id: Bytes32,
    resolver: &serde_json::Value,
    meta: &serde_json::Value,
    chain: &dyn ChainReader,
) -> Result<Prepared, EngineError> {
    let to = channel
        .counterparty_identifier(from)
        .ok_or_else(|| EngineError::validation("sender is not a channel participant"))?;
    let transfer = active
        .iter()
        .find(|t| t.transfer_id == transfer_id)
        .ok_or_else(|| EngineError::transfer_not_found(transfer_id))?
        .clone();

    let resolved_balance = chain.resolve_transfer(&transfer, resolver).await?;
    if resolved_balance.total() > transfer.balance.total() {
        return Err(EngineError::validation(format!(
            "resolver distributes {} but only {} was locked",
            resolved_balance.total(),
            transfer.balance.total()
        ))
        .with_transfer(transfer_id));
    }

    let initiator_side = channel
        .side_of_address(&transfer.initiator)
        .ok_or_else(|| EngineError::external("transfer initiator not a channel participant"))?;

    let mut next = channel.clone();
    let index = next.ensure_asset(transfer.asset_id);
    next.balances[index].amount[initiator_side.index()] += resolved_balance.amount[0];
    next.balances[index].amount[initiator_side.other().index()] += resolved_balance.amount[1];

    let new_active: Vec<Transfer> = active
        .iter()
        .filter(|t| t.transfer_id != transfer_id)
        .cloned()
        .collect();
    let merkle_root = merkle::active_transfer_root(&new_active);

    let mut resolved = transfer;
    resolved.transfer_resolver = Some(resolver.clone());

    next.merkle_root = merkle_root;
    next.nonce = channel.nonce + 1;
    next.latest_update = Update {
        channel_address: channel.channel_address,
        from_identifier: *from,
        to_identifier: to,
        nonce: next.nonce,
        balance: next.balances[index].clone(),
        asset_id: resolved.asset_id,
        details: UpdateDetails::Resolve(ResolveUpdateDetails {
            transfer_id,
            transfer_resolver: resolver.clone(),
            merkle_root,
            meta: meta.clone(),
        }),
        alice_signature: None,
        bob_signature: None,
    };

    Ok(Prepared {
        channel: next,
        delta: TransferDelta::resolved(resolved),
    })
}

// =============================================================================
// Inbound Validation
// =============================================================================

/// Re-derive the post-update state from the local view and reject on any
/// mismatch with the claimed update, then verify the leader's signature over
/// the derived commitment. Returns the prepared state carrying the leader's
/// signature, ready for counter-signing.
pub async fn validate_inbound_update(
    local: Option<&ChannelState>,
    active: &[Transfer],
    update: &Update,
    chain: &dyn ChainReader,
) -> Result<Prepared, EngineError> {
    let mut prepared = match &update.details {
        UpdateDetails::Setup(details) => {
            if local.is_some() {
                return Err(EngineError::validation("setup for an existing channel")
                    .with_channel(update.channel_address));
            }
            let alice = crypto::identifier_to_address(&update.to_identifier)
                .map_err(EngineError::validation)?;
            let bob = crypto::identifier_to_address(&update.from_identifier)
                .map_err(EngineError::validation)?;
            let expected = chain
                .get_channel_address(
                    &alice,
                    &bob,
                    details.network_context.chain_id,
                    &details.network_context.channel_factory_address,
                )
                .await?;
            if expected != update.channel_address {
                return Err(EngineError::validation(format!(
                    "channel address {} does not match derivation {}",
                    update.channel_address, expected
                )));
            }
            setup_transition(
                update.channel_address,
                &update.from_identifier,
                &update.to_identifier,
                details.timeout,
                &details.network_context,
            )?
        }
        UpdateDetails::Deposit(details) => {
            let channel = local.ok_or_else(|| {
                EngineError::channel_not_found(update.channel_address)
            })?;
            let prepared =
                deposit_transition(channel, &update.from_identifier, update.asset_id, chain)
                    .await?;
            // an on-chain deposit landing between the leader's reconciliation
            // and ours shows up as a totals mismatch: the race, not fraud
            match &prepared.channel.latest_update.details {
                UpdateDetails::Deposit(derived) => {
                    if derived != details {
                        return Err(EngineError::bad_signatures(format!(
                            "deposit totals diverged: leader signed ({}, {}), derived ({}, {})",
                            details.total_deposits_alice,
                            details.total_deposits_bob,
                            derived.total_deposits_alice,
                            derived.total_deposits_bob
                        ))
                        .with_channel(update.channel_address));
                    }
                }
                _ => unreachable!("deposit transition yields deposit details"),
            }
            prepared
        }
        UpdateDetails::Create(details) => {
            let channel = local.ok_or_else(|| {
                EngineError::channel_not_found(update.channel_address)
            })?;
            let params = CreateParams {
                channel_address: update.channel_address,
                balance: details.transfer_balance.clone(),
                asset_id: update.asset_id,
                transfer_definition: details.transfer_definition,
                transfer_initial_state: details.transfer_initial_state.clone(),
                timeout: details.transfer_timeout,
                meta: details.meta.clone(),
            };
            let prepared = create_transition(channel, active, &update.from_identifier, &params)?;
            match &prepared.channel.latest_update.details {
                UpdateDetails::Create(derived) => {
                    if derived.transfer_id != details.transfer_id {
                        return Err(EngineError::validation(format!(
                            "transfer id mismatch: claimed {}, derived {}",
                            details.transfer_id, derived.transfer_id
                        ))
                        .with_channel(update.channel_address));
                    }
                    if derived.merkle_root != details.merkle_root {
                        return Err(EngineError::validation(format!(
                            "merkle root mismatch: claimed {}, derived {}",
                            details.merkle_root, derived.merkle_root
                        ))
                        .with_channel(update.channel_address));
                    }
                }
                _ => unreachable!("create transition yields create details"),
            }
            prepared
        }
        UpdateDetails::Resolve(details) => {
            let channel = local.ok_or_else(|| {
                EngineError::channel_not_found(update.channel_address)
            })?;
            let prepared = resolve_transition(
                channel,
                active,
                &update.from_identifier,
                details.transfer_id,
                &details.transfer_resolver,
                &details.meta,
                chain,
            )
            .await?;
            if prepared.channel.merkle_root != details.merkle_root {
                return Err(EngineError::validation(format!(
                    "merkle root mismatch: claimed {}, derived {}",
                    details.merkle_root, prepared.channel.merkle_root
                ))
                .with_channel(update.channel_address));
            }
            prepared
        }
    };

    // the derived update must agree with the claimed one on nonce and balance
    if prepared.channel.nonce != update.nonce {
        return Err(EngineError::validation(format!(
            "nonce mismatch: claimed {}, derived {}",
            update.nonce, prepared.channel.nonce
        ))
        .with_channel(update.channel_address));
    }
    if prepared.channel.latest_update.balance != update.balance {
        let err = EngineError::validation("post-update balance mismatch")
            .with_channel(update.channel_address);
        return Err(match update.update_type() {
            crate::types::UpdateType::Deposit => {
                EngineError::bad_signatures("post-update balance diverged under deposit race")
                    .with_channel(update.channel_address)
            }
            _ => err,
        });
    }

    // leader signature over the derived commitment
    let leader_side = prepared
        .channel
        .side_of(&update.from_identifier)
        .ok_or_else(|| EngineError::validation("update sender is not a participant"))?;
    let signature = update
        .signature_for(leader_side)
        .ok_or_else(|| EngineError::bad_signatures("missing leader signature"))?;
    let digest = prepared.channel.commitment_hash();
    crypto::verify_signature(&digest, signature, &prepared.channel.participant(leader_side))
        .map_err(|e| {
            EngineError::bad_signatures(format!("leader signature rejected: {}", e))
                .with_channel(update.channel_address)
        })?;

    // carry the leader's signature into the prepared update
    prepared
        .channel
        .latest_update
        .set_signature(leader_side, *signature);

    Ok(prepared)
}

/// Verify both signatures on a doubly-signed update against a channel's
/// commitment (restore verification, reply verification).
pub fn verify_channel_signatures(channel: &ChannelState) -> Result<(), EngineError> {
    let digest = channel.commitment_hash();
    let update = &channel.latest_update;
    for side in [ChannelSide::Alice, ChannelSide::Bob] {
        let signature = update.signature_for(side).ok_or_else(|| {
            EngineError::bad_signatures(format!("missing {:?} signature", side))
                .with_channel(channel.channel_address)
        })?;
        crypto::verify_signature(&digest, signature, &channel.participant(side)).map_err(|e| {
            EngineError::bad_signatures(format!("{:?} signature rejected: {}", side, e))
                .with_channel(channel.channel_address)
        })?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MemoryChainReader, HASHLOCK_DEFINITION_ADDRESS};
    use crate::interfaces::Signer;
    use crate::signer::KeySigner;
    use crate::testutil::test_network_context;

    struct Pair {
        alice: KeySigner,
        bob: KeySigner,
        channel: ChannelState,
    }

    fn setup_pair() -> Pair {
        let alice = KeySigner::random();
        let bob = KeySigner::random();
        let context = test_network_context();
        let address = crypto::derive_channel_address(
            &alice.address(),
            &bob.address(),
            context.chain_id,
            &context.channel_factory_address,
        );
        let prepared = setup_transition(
            address,
            &bob.public_identifier(),
            &alice.public_identifier(),
            crate::DEFAULT_CHANNEL_TIMEOUT,
            &context,
        )
        .unwrap();
        Pair {
            alice,
            bob,
            channel: prepared.channel,
        }
    }

    fn funded_pair(alice_amount: u128, bob_amount: u128) -> (Pair, Address) {
        let mut pair = setup_pair();
        let asset = Address::zero();
        let index = pair.channel.ensure_asset(asset);
        pair.channel.balances[index].amount = [alice_amount, bob_amount];
        pair.channel.nonce = 2;
        (pair, asset)
    }

    fn create_params(asset: Address, amount: u128, to: [Address; 2]) -> CreateParams {
        CreateParams {
            channel_address: Address::zero(), // filled by caller when relevant
            balance: Balance::new(to, [amount, 0]),
            asset_id: asset,
            transfer_definition: HASHLOCK_DEFINITION_ADDRESS,
            transfer_initial_state: serde_json::json!({
                "lock_hash": crypto::sha256(&[1u8; 32]),
                "expiry": 0,
            }),
            timeout: crate::DEFAULT_TRANSFER_TIMEOUT,
            meta: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_setup_transition_shape() {
        let pair = setup_pair();
        assert_eq!(pair.channel.nonce, 1);
        assert_eq!(pair.channel.merkle_root, merkle::EMPTY_ROOT);
        assert!(pair.channel.balances.is_empty());
        assert_eq!(
            pair.channel.bob_identifier,
            pair.channel.latest_update.from_identifier
        );
    }

    #[test]
    fn test_transfer_id_is_deterministic() {
        let channel_address = Address::from_bytes([7; 20]);
        let definition = Address::from_bytes([8; 20]);
        let state_hash = crypto::keccak256(b"state");

        let a = derive_transfer_id(&channel_address, 5, &definition, &state_hash);
        let b = derive_transfer_id(&channel_address, 5, &definition, &state_hash);
        assert_eq!(a, b);
        assert_ne!(a, derive_transfer_id(&channel_address, 6, &definition, &state_hash));
    }

    #[test]
    fn test_create_locks_initiator_balance() {
        let (pair, asset) = funded_pair(100, 50);
        let params = create_params(
            asset,
            30,
            [pair.channel.bob, pair.channel.alice],
        );

        // bob initiates; bob is slot 1 in the channel balance
        let prepared = create_transition(
            &pair.channel,
            &[],
            &pair.bob.public_identifier(),
            &params,
        )
        .unwrap();

        let balance = prepared.channel.balance_for_asset(&asset).unwrap();
        assert_eq!(balance.amount, [100, 20]);
        assert_eq!(prepared.channel.nonce, 3);
        assert_ne!(prepared.channel.merkle_root, merkle::EMPTY_ROOT);
        let created = prepared.delta.created.unwrap();
        assert_eq!(created.initiator, pair.channel.bob);
        assert_eq!(created.responder, pair.channel.alice);
        assert_eq!(created.channel_nonce, 3);
    }

    #[test]
    fn test_create_rejects_insufficient_funds() {
        let (pair, asset) = funded_pair(100, 10);
        let params = create_params(asset, 30, [pair.channel.bob, pair.channel.alice]);

        let err = create_transition(
            &pair.channel,
            &[],
            &pair.bob.public_identifier(),
            &params,
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_create_then_resolve_conserves_balance() {
        let (pair, asset) = funded_pair(100, 50);
        let pre_image = Bytes32::from_bytes([1; 32]);
        let mut params = create_params(asset, 30, [pair.channel.bob, pair.channel.alice]);
        params.transfer_initial_state = serde_json::json!({
            "lock_hash": crypto::sha256(&pre_image.0),
            "expiry": 0,
        });

        let created = create_transition(
            &pair.channel,
            &[],
            &pair.bob.public_identifier(),
            &params,
        )
        .unwrap();
        let transfer = created.delta.created.clone().unwrap();

        let chain = MemoryChainReader::new();
        let resolved = resolve_transition(
            &created.channel,
            &[transfer.clone()],
            &pair.alice.public_identifier(),
            transfer.transfer_id,
            &serde_json::json!({ "pre_image": pre_image }),
            &serde_json::Value::Null,
            chain.as_ref(),
        )
        .await
        .unwrap();

        // 30 moved from bob to alice; totals conserved
        let balance = resolved.channel.balance_for_asset(&asset).unwrap();
        assert_eq!(balance.amount, [130, 20]);
        assert_eq!(balance.total(), 150);
        assert_eq!(resolved.channel.merkle_root, merkle::EMPTY_ROOT);
        assert!(resolved.delta.resolved.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_deposit_transition_reconciles_totals() {
        let (pair, asset) = funded_pair(0, 0);
        let chain = MemoryChainReader::new();
        chain.credit_deposit(&pair.channel.channel_address, pair.channel.chain_id, &asset, true, 5);
        chain.credit_deposit(&pair.channel.channel_address, pair.channel.chain_id, &asset, false, 3);

        let prepared = deposit_transition(
            &pair.channel,
            &pair.bob.public_identifier(),
            asset,
            chain.as_ref(),
        )
        .await
        .unwrap();

        let index = prepared.channel.asset_index(&asset).unwrap();
        assert_eq!(prepared.channel.balances[index].amount, [5, 3]);
        assert_eq!(prepared.channel.processed_deposits_alice[index], 5);
        assert_eq!(prepared.channel.processed_deposits_bob[index], 3);
    }

    #[tokio::test]
    async fn test_inbound_accepts_signed_create() {
        let (pair, asset) = funded_pair(100, 50);
        let params = create_params(asset, 30, [pair.channel.bob, pair.channel.alice]);

        let mut prepared = create_transition(
            &pair.channel,
            &[],
            &pair.bob.public_identifier(),
            &params,
        )
        .unwrap();
        let digest = prepared.channel.commitment_hash();
        let signature = pair.bob.sign_commitment(&digest).await.unwrap();
        prepared
            .channel
            .latest_update
            .set_signature(ChannelSide::Bob, signature);

        let chain = MemoryChainReader::new();
        let validated = validate_inbound_update(
            Some(&pair.channel),
            &[],
            &prepared.channel.latest_update,
            chain.as_ref(),
        )
        .await
        .unwrap();
        assert_eq!(validated.channel.nonce, prepared.channel.nonce);
        assert_eq!(validated.channel.merkle_root, prepared.channel.merkle_root);
    }

    #[tokio::test]
    async fn test_inbound_rejects_tampered_balance() {
        let (pair, asset) = funded_pair(100, 50);
        let params = create_params(asset, 30, [pair.channel.bob, pair.channel.alice]);

        let mut prepared = create_transition(
            &pair.channel,
            &[],
            &pair.bob.public_identifier(),
            &params,
        )
        .unwrap();
        let digest = prepared.channel.commitment_hash();
        let signature = pair.bob.sign_commitment(&digest).await.unwrap();
        prepared
            .channel
            .latest_update
            .set_signature(ChannelSide::Bob, signature);

        let mut tampered = prepared.channel.latest_update.clone();
        tampered.balance.amount[1] += 5;

        let chain = MemoryChainReader::new();
        let err = validate_inbound_update(Some(&pair.channel), &[], &tampered, chain.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_inbound_deposit_race_is_bad_signatures() {
        let (pair, asset) = funded_pair(0, 0);
        let chain = MemoryChainReader::new();
        chain.credit_deposit(&pair.channel.channel_address, pair.channel.chain_id, &asset, true, 5);

        // leader reconciles {5, 0} and signs
        let mut prepared = deposit_transition(
            &pair.channel,
            &pair.bob.public_identifier(),
            asset,
            chain.as_ref(),
        )
        .await
        .unwrap();
        let digest = prepared.channel.commitment_hash();
        let signature = pair.bob.sign_commitment(&digest).await.unwrap();
        prepared
            .channel
            .latest_update
            .set_signature(ChannelSide::Bob, signature);

        // a second deposit lands before the follower reconciles
        chain.credit_deposit(&pair.channel.channel_address, pair.channel.chain_id, &asset, false, 3);

        let err = validate_inbound_update(
            Some(&pair.channel),
            &[],
            &prepared.channel.latest_update,
            chain.as_ref(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::BadSignatures);
    }

    #[tokio::test]
    async fn test_inbound_rejects_missing_leader_signature() {
        let (pair, asset) = funded_pair(100, 50);
        let params = create_params(asset, 30, [pair.channel.bob, pair.channel.alice]);

        let prepared = create_transition(
            &pair.channel,
            &[],
            &pair.bob.public_identifier(),
            &params,
        )
        .unwrap();

        let chain = MemoryChainReader::new();
        let err = validate_inbound_update(
            Some(&pair.channel),
            &[],
            &prepared.channel.latest_update,
            chain.as_ref(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::BadSignatures);
    }
}

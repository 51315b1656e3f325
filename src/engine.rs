// =============================================================================
// MOONWIRE v1.2 - Update Engine
// =============================================================================
//
// The two-party update protocol state machine. Each update has a leader: the
// peer that generates, signs and sends it. The leader holds the channel lock
// across the whole exchange so the nonce read-modify-write is serial; the
// follower applies inbound updates serially off its message loop.
//
// Leader:  load state -> transition -> sign -> send {update, previousUpdate}
//          -> verify counter-signature -> persist -> emit.
// Follower: nonce window check -> re-derive and compare -> counter-sign ->
//          persist -> reply -> emit.
//
// The follower replies with its own latest update when the leader is behind,
// syncs a single missed update from `previousUpdate`, and demands a restore
// for anything wider. Deposit updates race with on-chain deposits; the
// leader retries a `BadSignatures` rejection up to DEPOSIT_RETRIES times.
//
// =============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{WithdrawResolver, WithdrawState};
use crate::events::{EngineEvent, EventBus};
use crate::interfaces::{
    ChainReader, LockService, Messaging, Signer, Store, Validation,
};
use crate::merkle;
use crate::messaging::{InboundMessage, NodeMessage, ProtocolPayload, RestoreData};
use crate::types::{
    Address, ChannelState, CreateParams, DepositParams, EngineError, Identifier, NetworkContext,
    ResolveParams, SetupParams, Transfer, Update, UpdateParams, UpdateType,
};
use crate::validate::{self, Prepared};
use crate::{
    crypto, DEPOSIT_RETRIES, PROTOCOL_MESSAGE_TIMEOUT_MS, RESTORE_ACK_TIMEOUT_MS,
    WITHDRAW_CONFIRMATION_TIMEOUT_MS, WITHDRAW_TRANSFER_NAME,
};

/// The channel engine: one per node, shared across channels.
pub struct UpdateEngine {
    signer: Arc<dyn Signer>,
    store: Arc<dyn Store>,
    messaging: Arc<dyn Messaging>,
    chain: Arc<dyn ChainReader>,
    locks: Arc<dyn LockService>,
    validation: Arc<dyn Validation>,
    events: Arc<EventBus>,
    /// Chains this node is anchored to
    contexts: Vec<NetworkContext>,
    identifier: Identifier,
    address: Address,
}

impl UpdateEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<dyn Signer>,
        store: Arc<dyn Store>,
        messaging: Arc<dyn Messaging>,
        chain: Arc<dyn ChainReader>,
        locks: Arc<dyn LockService>,
        validation: Arc<dyn Validation>,
        contexts: Vec<NetworkContext>,
    ) -> Arc<Self> {
        let identifier = signer.public_identifier();
        let address = signer.address();
        Arc::new(UpdateEngine {
            signer,
            store,
            messaging,
            chain,
            locks,
            validation,
            events: Arc::new(EventBus::new()),
            contexts,
            identifier,
            address,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn chain(&self) -> &Arc<dyn ChainReader> {
        &self.chain
    }

    pub fn messaging(&self) -> &Arc<dyn Messaging> {
        &self.messaging
    }

    pub fn public_identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn signer_address(&self) -> Address {
        self.address
    }

    pub fn network_context(&self, chain_id: u64) -> Option<&NetworkContext> {
        self.contexts.iter().find(|c| c.chain_id == chain_id)
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    pub async fn setup(&self, params: SetupParams) -> Result<ChannelState, EngineError> {
        self.execute_update(UpdateParams::Setup(params)).await
    }

    pub async fn deposit(&self, params: DepositParams) -> Result<ChannelState, EngineError> {
        self.execute_update(UpdateParams::Deposit(params)).await
    }

    pub async fn create(&self, params: CreateParams) -> Result<ChannelState, EngineError> {
        self.execute_update(UpdateParams::Create(params)).await
    }

    pub async fn resolve(&self, params: ResolveParams) -> Result<ChannelState, EngineError> {
        self.execute_update(UpdateParams::Resolve(params)).await
    }

    /// Drive one update through the outbound protocol. Deposit updates are
    /// retried on `BadSignatures` (the on-chain deposit race).
    pub async fn execute_update(
        &self,
        params: UpdateParams,
    ) -> Result<ChannelState, EngineError> {
        validate::validate_params(&params, &self.identifier)?;

        let attempts = if params.update_type() == UpdateType::Deposit {
            DEPOSIT_RETRIES
        } else {
            1
        };
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.execute_once(&params).await {
                Ok(channel) => return Ok(channel),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    warn!(
                        attempt,
                        error = %err,
                        "deposit exchange rejected, reconciling again"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::external("update failed without an error")))
    }

    /// One attempt: acquire the channel lock, run the exchange, release.
    async fn execute_once(&self, params: &UpdateParams) -> Result<ChannelState, EngineError> {
        let (channel_address, counterparty, is_alice) = self.exchange_target(params).await?;
        let lock_name = channel_address.to_hex();

        let key = self
            .locks
            .acquire_lock(&lock_name, is_alice, &counterparty)
            .await?;
        let result = self.exchange(params, channel_address, counterparty).await;
        if let Err(err) = self
            .locks
            .release_lock(&lock_name, &key, is_alice, &counterparty)
            .await
        {
            warn!(channel = %channel_address, error = %err, "lock release failed");
        }
        result
    }

    /// Resolve who the exchange talks to and which side we are, before
    /// taking the lock.
    async fn exchange_target(
        &self,
        params: &UpdateParams,
    ) -> Result<(Address, Identifier, bool), EngineError> {
        match params {
            UpdateParams::Setup(p) => {
                let alice = crypto::identifier_to_address(&p.counterparty_identifier)
                    .map_err(EngineError::validation)?;
                let address = self
                    .chain
                    .get_channel_address(
                        &alice,
                        &self.address,
                        p.network_context.chain_id,
                        &p.network_context.channel_factory_address,
                    )
                    .await?;
                // the setup initiator is always Bob
                Ok((address, p.counterparty_identifier, false))
            }
            _ => {
                let address = params.channel_address().ok_or_else(|| {
                    EngineError::validation("update params carry no channel address")
                })?;
                let channel = self
                    .store
                    .get_channel_state(&address)
                    .await?
                    .ok_or_else(|| EngineError::channel_not_found(address))?;
                let counterparty = channel
                    .counterparty_identifier(&self.identifier)
                    .ok_or_else(|| {
                        EngineError::validation("this signer is not a channel participant")
                            .with_channel(address)
                    })?;
                let is_alice = channel
                    .side_of(&self.identifier)
                    .map(|s| s.is_alice())
                    .unwrap_or(false);
                Ok((address, counterparty, is_alice))
            }
        }
    }

    /// The outbound exchange proper, run under the channel lock.
    async fn exchange(
        &self,
        params: &UpdateParams,
        channel_address: Address,
        counterparty: Identifier,
    ) -> Result<ChannelState, EngineError> {
        let channel = self.store.get_channel_state(&channel_address).await?;
        if let Some(state) = &channel {
            if state.in_dispute {
                return Err(EngineError::dispute(channel_address));
            }
        }
        let active = self.store.get_active_transfers(&channel_address).await?;

        let mut prepared = match params {
            UpdateParams::Setup(p) => {
                if channel.is_some() {
                    return Err(EngineError::validation("channel already exists")
                        .with_channel(channel_address));
                }
                validate::setup_transition(
                    channel_address,
                    &self.identifier,
                    &p.counterparty_identifier,
                    p.timeout,
                    &p.network_context,
                )?
            }
            UpdateParams::Deposit(p) => {
                let state = channel
                    .as_ref()
                    .ok_or_else(|| EngineError::channel_not_found(channel_address))?;
                validate::deposit_transition(
                    state,
                    &self.identifier,
                    p.asset_id,
                    self.chain.as_ref(),
                )
                .await?
            }
            UpdateParams::Create(p) => {
                let state = channel
                    .as_ref()
                    .ok_or_else(|| EngineError::channel_not_found(channel_address))?;
                validate::create_transition(state, &active, &self.identifier, p)?
            }
            UpdateParams::Resolve(p) => {
                let state = channel
                    .as_ref()
                    .ok_or_else(|| EngineError::channel_not_found(channel_address))?;
                validate::resolve_transition(
                    state,
                    &active,
                    &self.identifier,
                    p.transfer_id,
                    &p.transfer_resolver,
                    &p.meta,
                    self.chain.as_ref(),
                )
                .await?
            }
        };

        self.validation
            .validate_outbound(params, channel.as_ref(), &active)
            .await?;

        // sign as leader
        let our_side = prepared
            .channel
            .side_of(&self.identifier)
            .ok_or_else(|| EngineError::validation("signer absent from derived channel"))?;
        let digest = prepared.channel.commitment_hash();
        let signature = self.signer.sign_commitment(&digest).await?;
        prepared
            .channel
            .latest_update
            .set_signature(our_side, signature);

        let previous_update = channel.as_ref().map(|c| c.latest_update.clone());
        let payload = ProtocolPayload {
            update: prepared.channel.latest_update.clone(),
            previous_update,
        };
        let timeout_ms = self.exchange_timeout(&prepared).await;

        debug!(
            channel = %channel_address,
            nonce = prepared.channel.nonce,
            update_type = %prepared.channel.latest_update.update_type(),
            "sending protocol message"
        );
        let reply = self
            .messaging
            .send_protocol_message(&self.identifier, &counterparty, payload, timeout_ms)
            .await?;

        // the counterparty is expected to echo the doubly-signed update; a
        // different nonce means it answered with its own latest state
        if reply.update.nonce != prepared.channel.nonce {
            return Err(EngineError::stale_update(format!(
                "counterparty replied with nonce {} (ours {})",
                reply.update.nonce, prepared.channel.nonce
            ))
            .with_channel(channel_address));
        }
        let their_side = our_side.other();
        let their_signature = reply
            .update
            .signature_for(their_side)
            .ok_or_else(|| {
                EngineError::bad_signatures("reply lacks counterparty signature")
                    .with_channel(channel_address)
            })?;
        crypto::verify_signature(
            &digest,
            their_signature,
            &prepared.channel.participant(their_side),
        )
        .map_err(|e| {
            EngineError::bad_signatures(format!("counterparty signature rejected: {}", e))
                .with_channel(channel_address)
        })?;
        prepared
            .channel
            .latest_update
            .set_signature(their_side, *their_signature);

        self.store
            .save_channel_state_and_transfers(&prepared.channel, &prepared.delta)
            .await?;
        info!(
            channel = %channel_address,
            nonce = prepared.channel.nonce,
            update_type = %prepared.channel.latest_update.update_type(),
            "update applied"
        );
        self.emit_update_events(&prepared).await;
        Ok(prepared.channel)
    }

    /// Withdraw exchanges get the longer confirmation window.
    async fn exchange_timeout(&self, prepared: &Prepared) -> u64 {
        let definition = match (&prepared.delta.created, &prepared.delta.resolved) {
            (Some(t), _) => Some(t.transfer_definition),
            (_, Some(t)) => Some(t.transfer_definition),
            _ => None,
        };
        match definition {
            Some(definition)
                if self
                    .is_withdraw_definition(&prepared.channel, &definition)
                    .await =>
            {
                WITHDRAW_CONFIRMATION_TIMEOUT_MS
            }
            _ => PROTOCOL_MESSAGE_TIMEOUT_MS,
        }
    }

    async fn is_withdraw_definition(
        &self,
        channel: &ChannelState,
        definition: &Address,
    ) -> bool {
        match self
            .chain
            .get_registered_transfers(
                &channel.network_context.transfer_registry_address,
                channel.chain_id,
            )
            .await
        {
            Ok(rows) => rows
                .iter()
                .any(|r| r.definition == *definition && r.name == WITHDRAW_TRANSFER_NAME),
            Err(_) => false,
        }
    }

    async fn emit_update_events(&self, prepared: &Prepared) {
        self.events.publish(EngineEvent::ChannelUpdated {
            channel: prepared.channel.clone(),
            update: prepared.channel.latest_update.clone(),
        });
        if let Some(created) = &prepared.delta.created {
            if !self
                .is_withdraw_definition(&prepared.channel, &created.transfer_definition)
                .await
            {
                self.events.publish(EngineEvent::ConditionalTransferCreated {
                    channel: prepared.channel.clone(),
                    transfer: created.clone(),
                });
            }
        }
        if let Some(resolved) = &prepared.delta.resolved {
            if self
                .is_withdraw_definition(&prepared.channel, &resolved.transfer_definition)
                .await
            {
                self.emit_withdrawal_reconciled(resolved);
            } else {
                self.events.publish(EngineEvent::ConditionalTransferResolved {
                    channel: prepared.channel.clone(),
                    transfer: resolved.clone(),
                });
            }
        }
    }

    fn emit_withdrawal_reconciled(&self, resolved: &Transfer) {
        // a cancelled withdraw returned the funds; nothing reconciled
        let cancelled = resolved
            .transfer_resolver
            .as_ref()
            .and_then(|r| serde_json::from_value::<WithdrawResolver>(r.clone()).ok())
            .map(|r| r.responder_signature.is_zero())
            .unwrap_or(true);
        if cancelled {
            return;
        }
        if let Ok(state) =
            serde_json::from_value::<WithdrawState>(resolved.transfer_state.clone())
        {
            self.events.publish(EngineEvent::WithdrawalReconciled {
                channel_address: resolved.channel_address,
                transfer_id: resolved.transfer_id,
                recipient: state.recipient,
                asset_id: resolved.asset_id,
                amount: resolved.balance.total(),
            });
        }
    }

    // =========================================================================
    // Restore (requester side)
    // =========================================================================

    /// Fetch valid state from the counterparty and overwrite local state
    /// after verifying it. Used after storage loss or an unsyncable gap.
    pub async fn request_restore(
        &self,
        counterparty: Identifier,
        chain_id: u64,
    ) -> Result<ChannelState, EngineError> {
        let data = self
            .messaging
            .send_restore_state_message(
                &self.identifier,
                &counterparty,
                chain_id,
                PROTOCOL_MESSAGE_TIMEOUT_MS,
            )
            .await?;

        let verified = self.verify_restore_data(&data, &counterparty, chain_id).await;
        match verified {
            Ok(()) => {
                self.store
                    .save_restored_channel(&data.channel, &data.active_transfers)
                    .await?;
                self.messaging
                    .respond(&data.ack_inbox, Ok(NodeMessage::Ack))
                    .await?;
                info!(
                    channel = %data.channel.channel_address,
                    nonce = data.channel.nonce,
                    "state restored from counterparty"
                );
                self.events.publish(EngineEvent::RestoreState {
                    channel: data.channel.clone(),
                });
                Ok(data.channel)
            }
            Err(err) => {
                // tell the holder so it releases the channel lock
                let _ = self
                    .messaging
                    .respond(&data.ack_inbox, Err(err.clone()))
                    .await;
                Err(err)
            }
        }
    }

    async fn verify_restore_data(
        &self,
        data: &RestoreData,
        counterparty: &Identifier,
        chain_id: u64,
    ) -> Result<(), EngineError> {
        let channel = &data.channel;
        if channel.chain_id != chain_id {
            return Err(EngineError::validation("restored channel is on another chain"));
        }
        if channel.side_of(&self.identifier).is_none()
            || channel.side_of(counterparty).is_none()
        {
            return Err(EngineError::validation(
                "restored channel does not belong to this pair",
            ));
        }

        // (i) the address must be the create2 derivation from participants
        let derived = self
            .chain
            .get_channel_address(
                &channel.alice,
                &channel.bob,
                channel.chain_id,
                &channel.network_context.channel_factory_address,
            )
            .await?;
        if derived != channel.channel_address {
            return Err(EngineError::validation(format!(
                "restored address {} does not match derivation {}",
                channel.channel_address, derived
            )));
        }

        // (ii) both signatures on the latest update must verify
        validate::verify_channel_signatures(channel)?;

        // (iii) the merkle root must commit to the restored transfer set
        let root = merkle::active_transfer_root(&data.active_transfers);
        if root != channel.merkle_root {
            return Err(EngineError::validation(format!(
                "restored merkle root {} does not match transfers ({})",
                channel.merkle_root, root
            )));
        }

        // (iv) the gap must not be syncable by the normal protocol; an
        // identical nonce is the idempotent re-application case
        if let Some(local) = self
            .store
            .get_channel_state(&channel.channel_address)
            .await?
        {
            if channel.nonce != local.nonce && channel.nonce <= local.nonce + 1 {
                return Err(EngineError::validation(format!(
                    "nonce {} is reachable from local {} by normal sync",
                    channel.nonce, local.nonce
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Check-In
    // =========================================================================

    /// Signal liveness for every stored channel (startup, reconnect).
    pub async fn broadcast_check_in(&self) {
        let channels = match self.store.get_channel_states().await {
            Ok(channels) => channels,
            Err(err) => {
                warn!(error = %err, "check-in scan failed");
                return;
            }
        };
        for channel in channels {
            let Some(counterparty) = channel.counterparty_identifier(&self.identifier) else {
                continue;
            };
            if let Err(err) = self
                .messaging
                .send_is_alive_message(
                    &self.identifier,
                    &counterparty,
                    channel.channel_address,
                    false,
                )
                .await
            {
                debug!(
                    channel = %channel.channel_address,
                    error = %err,
                    "check-in not delivered"
                );
            }
        }
    }

    // =========================================================================
    // Dispute Bookkeeping
    // =========================================================================

    /// Pull the on-chain dispute record for a channel, persist it, and mark
    /// the channel terminal for the protocol.
    pub async fn record_dispute(
        &self,
        channel_address: &Address,
    ) -> Result<bool, EngineError> {
        let mut channel = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or_else(|| EngineError::channel_not_found(*channel_address))?;
        let Some(dispute) = self
            .chain
            .get_channel_dispute(channel_address, channel.chain_id)
            .await?
        else {
            return Ok(false);
        };

        self.store.save_channel_dispute(&dispute).await?;
        if !channel.in_dispute {
            channel.in_dispute = true;
            self.store
                .save_channel_state_and_transfers(&channel, &Default::default())
                .await?;
        }
        warn!(channel = %channel_address, nonce = dispute.nonce, "channel disputed on-chain");
        Ok(true)
    }

    // =========================================================================
    // Message Loop (follower side)
    // =========================================================================

    /// Subscribe to the transport and drain inbound traffic serially. One
    /// loop per node keeps inbound application ordered per channel.
    pub async fn spawn_message_loop(
        self: &Arc<Self>,
    ) -> Result<tokio::task::JoinHandle<()>, EngineError> {
        let mut rx = self.messaging.subscribe(&self.identifier).await?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                engine.handle_inbound(inbound).await;
            }
        }))
    }

    async fn handle_inbound(&self, inbound: InboundMessage) {
        let InboundMessage {
            from,
            reply_inbox,
            message,
        } = inbound;

        // drop self-sent loops without replying
        if from == self.identifier {
            debug!("dropping self-addressed message");
            return;
        }

        match message {
            NodeMessage::Protocol(payload) => {
                self.handle_protocol_message(payload, &from, &reply_inbox).await;
            }
            NodeMessage::RestoreRequest { chain_id } => {
                self.handle_restore_request(chain_id, &from, &reply_inbox).await;
            }
            NodeMessage::SetupRequest { chain_id, timeout } => {
                self.handle_setup_request(chain_id, timeout, &from, &reply_inbox)
                    .await;
            }
            NodeMessage::IsAlive {
                channel_address,
                skip_check_in,
            } => {
                self.events.publish(EngineEvent::IsAlive {
                    channel_address,
                    from,
                    skip_check_in,
                });
                let _ = self
                    .messaging
                    .respond(&reply_inbox, Ok(NodeMessage::Ack))
                    .await;
            }
            NodeMessage::RequestCollateral {
                channel_address,
                asset_id,
                amount,
            } => {
                self.events.publish(EngineEvent::CollateralRequested {
                    channel_address,
                    asset_id,
                    amount,
                    from,
                });
                let _ = self
                    .messaging
                    .respond(&reply_inbox, Ok(NodeMessage::Ack))
                    .await;
            }
            NodeMessage::Probe => {
                let _ = self
                    .messaging
                    .respond(&reply_inbox, Ok(NodeMessage::Ack))
                    .await;
            }
            other => {
                // replies travel through inboxes, not the subscription
                debug!(message = ?other, "ignoring unexpected inbound message");
            }
        }
    }

    /// Inbound protocol exchange: the follower half of the update protocol.
    async fn handle_protocol_message(
        &self,
        payload: ProtocolPayload,
        from: &Identifier,
        reply_inbox: &str,
    ) {
        if payload.update.from_identifier == self.identifier {
            debug!("dropping looped protocol message");
            return;
        }
        let result = self.apply_inbound(payload, from).await;
        match result {
            Ok(reply) => {
                let _ = self
                    .messaging
                    .respond(reply_inbox, Ok(NodeMessage::Protocol(reply)))
                    .await;
            }
            Err(err) => {
                debug!(error = %err, "inbound update rejected");
                let _ = self.messaging.respond(reply_inbox, Err(err)).await;
            }
        }
    }

    async fn apply_inbound(
        &self,
        payload: ProtocolPayload,
        _from: &Identifier,
    ) -> Result<ProtocolPayload, EngineError> {
        let update = payload.update;
        let channel_address = update.channel_address;

        let mut local = self.store.get_channel_state(&channel_address).await?;
        if let Some(state) = &local {
            if state.in_dispute {
                return Err(EngineError::dispute(channel_address));
            }
        }
        let local_nonce = local.as_ref().map(|c| c.nonce).unwrap_or(0);

        // the counterparty is behind (or re-delivering): answer with our
        // latest doubly-signed update, do not apply
        if update.nonce <= local_nonce {
            let state = local.ok_or_else(|| {
                EngineError::stale_update("update nonce below an empty channel")
            })?;
            debug!(
                channel = %channel_address,
                theirs = update.nonce,
                ours = state.nonce,
                "counterparty behind; replying with latest"
            );
            return Ok(ProtocolPayload {
                update: state.latest_update.clone(),
                previous_update: None,
            });
        }

        // single-step sync from the attached previous update
        if update.nonce == local_nonce + 2 {
            let previous = payload.previous_update.as_ref().ok_or_else(|| {
                EngineError::restore_needed("two updates ahead with no previous update attached")
                    .with_channel(channel_address)
            })?;
            if previous.nonce != local_nonce + 1 {
                return Err(EngineError::restore_needed(format!(
                    "unsyncable gap: local {}, previous {}",
                    local_nonce, previous.nonce
                ))
                .with_channel(channel_address));
            }
            let synced = self.apply_synced_update(local.as_ref(), previous).await?;
            local = Some(synced);
        } else if update.nonce > local_nonce + 2 {
            return Err(EngineError::restore_needed(format!(
                "local nonce {} too far behind update {}",
                local_nonce, update.nonce
            ))
            .with_channel(channel_address));
        }

        // normal forward step
        let active = self.store.get_active_transfers(&channel_address).await?;
        let mut prepared =
            validate::validate_inbound_update(local.as_ref(), &active, &update, self.chain.as_ref())
                .await?;
        self.validation
            .validate_inbound(&update, local.as_ref(), &active)
            .await?;

        let our_side = prepared
            .channel
            .side_of(&self.identifier)
            .ok_or_else(|| EngineError::validation("we are not a participant of this update"))?;
        let digest = prepared.channel.commitment_hash();
        let signature = self.signer.sign_commitment(&digest).await?;
        prepared
            .channel
            .latest_update
            .set_signature(our_side, signature);

        self.store
            .save_channel_state_and_transfers(&prepared.channel, &prepared.delta)
            .await?;
        info!(
            channel = %channel_address,
            nonce = prepared.channel.nonce,
            update_type = %update.update_type(),
            "inbound update applied"
        );
        self.emit_update_events(&prepared).await;

        Ok(ProtocolPayload {
            update: prepared.channel.latest_update.clone(),
            previous_update: None,
        })
    }

    /// Apply a missed, already doubly-signed update during sync.
    async fn apply_synced_update(
        &self,
        local: Option<&ChannelState>,
        previous: &Update,
    ) -> Result<ChannelState, EngineError> {
        let active = self
            .store
            .get_active_transfers(&previous.channel_address)
            .await?;
        let mut prepared =
            validate::validate_inbound_update(local, &active, previous, self.chain.as_ref())
                .await?;

        // both signatures already exist; verify the pair before persisting
        prepared.channel.latest_update.alice_signature = previous.alice_signature;
        prepared.channel.latest_update.bob_signature = previous.bob_signature;
        validate::verify_channel_signatures(&prepared.channel)?;

        self.store
            .save_channel_state_and_transfers(&prepared.channel, &prepared.delta)
            .await?;
        info!(
            channel = %previous.channel_address,
            nonce = prepared.channel.nonce,
            "missed update synced"
        );
        self.emit_update_events(&prepared).await;
        Ok(prepared.channel)
    }

    /// Holder side of the restore procedure: transmit state under the
    /// channel lock, release only once the requester acknowledged.
    async fn handle_restore_request(
        &self,
        chain_id: u64,
        from: &Identifier,
        reply_inbox: &str,
    ) {
        let channel = match self
            .store
            .get_channel_state_by_participants(&self.identifier, from, chain_id)
            .await
        {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                let _ = self
                    .messaging
                    .respond(
                        reply_inbox,
                        Err(EngineError::channel_not_found(Address::zero())
                            .with_context("peer", format!("{}", from))),
                    )
                    .await;
                return;
            }
            Err(err) => {
                let _ = self.messaging.respond(reply_inbox, Err(err)).await;
                return;
            }
        };

        let active = match self
            .store
            .get_active_transfers(&channel.channel_address)
            .await
        {
            Ok(active) => active,
            Err(err) => {
                let _ = self.messaging.respond(reply_inbox, Err(err)).await;
                return;
            }
        };

        let lock_name = channel.channel_address.to_hex();
        let is_alice = channel
            .side_of(&self.identifier)
            .map(|s| s.is_alice())
            .unwrap_or(false);
        let key = match self.locks.acquire_lock(&lock_name, is_alice, from).await {
            Ok(key) => key,
            Err(err) => {
                let _ = self.messaging.respond(reply_inbox, Err(err)).await;
                return;
            }
        };

        let ack_inbox = match self.messaging.open_inbox().await {
            Ok(inbox) => inbox,
            Err(err) => {
                let _ = self.messaging.respond(reply_inbox, Err(err)).await;
                let _ = self
                    .locks
                    .release_lock(&lock_name, &key, is_alice, from)
                    .await;
                return;
            }
        };

        let _ = self
            .messaging
            .respond(
                reply_inbox,
                Ok(NodeMessage::RestoreReply(RestoreData {
                    channel: channel.clone(),
                    active_transfers: active,
                    ack_inbox: ack_inbox.clone(),
                })),
            )
            .await;

        // hold the lock until the requester acknowledges (or errors out)
        match self
            .messaging
            .await_inbox(&ack_inbox, RESTORE_ACK_TIMEOUT_MS)
            .await
        {
            Ok(_) => {
                debug!(channel = %channel.channel_address, "restore acknowledged");
            }
            Err(err) => {
                warn!(
                    channel = %channel.channel_address,
                    error = %err,
                    "restore not acknowledged"
                );
            }
        }
        let _ = self
            .locks
            .release_lock(&lock_name, &key, is_alice, from)
            .await;
    }

    /// A peer without a channel asked us to run setup as leader.
    async fn handle_setup_request(
        &self,
        chain_id: u64,
        timeout: u64,
        from: &Identifier,
        reply_inbox: &str,
    ) {
        let Some(context) = self.network_context(chain_id).cloned() else {
            let _ = self
                .messaging
                .respond(
                    reply_inbox,
                    Err(EngineError::validation(format!(
                        "chain {} not configured",
                        chain_id
                    ))),
                )
                .await;
            return;
        };

        let result = self
            .setup(SetupParams {
                counterparty_identifier: *from,
                timeout,
                network_context: context,
            })
            .await;
        match result {
            Ok(channel) => {
                let _ = self
                    .messaging
                    .respond(
                        reply_inbox,
                        Ok(NodeMessage::SetupOk {
                            channel_address: channel.channel_address,
                        }),
                    )
                    .await;
            }
            Err(err) => {
                let _ = self.messaging.respond(reply_inbox, Err(err)).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

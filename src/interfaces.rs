// =============================================================================
// MOONWIRE v1.1 - External Service Interfaces
// =============================================================================
//
// The engine consumes its collaborators through these seams: durable storage,
// the distributed lock service, the message transport, the on-chain reader,
// and the signer. In-process implementations live in storage.rs, lock.rs,
// messaging.rs, chain.rs and signer.rs; production deployments swap in
// networked ones without touching the engine.
//
// =============================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messaging::{InboundMessage, NodeMessage, ProtocolPayload, RestoreData};
use crate::types::{
    Address, Bytes32, Balance, ChannelDispute, ChannelState, EngineError, Identifier,
    QueuedPayload, QueuedUpdate, QueuedUpdateKind, QueuedUpdateStatus, Signature, Transfer,
    Update, UpdateParams,
};
use crate::{PROBE_TIMEOUT_MS, PROTOCOL_MESSAGE_TIMEOUT_MS};

// =============================================================================
// Store
// =============================================================================

/// What a `create` or `resolve` update changed in the transfer table. Saved
/// atomically with the channel state.
#[derive(Clone, Debug, Default)]
pub struct TransferDelta {
    /// Newly active transfer
    pub created: Option<Transfer>,
    /// Transfer leaving the active set, with its resolver attached
    pub resolved: Option<Transfer>,
}

impl TransferDelta {
    pub fn none() -> Self {
        TransferDelta::default()
    }

    pub fn created(transfer: Transfer) -> Self {
        TransferDelta {
            created: Some(transfer),
            resolved: None,
        }
    }

    pub fn resolved(transfer: Transfer) -> Self {
        TransferDelta {
            created: None,
            resolved: Some(transfer),
        }
    }
}

/// Durable channel, transfer, queue and dispute state.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_channel_state(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelState>, EngineError>;

    async fn get_channel_state_by_participants(
        &self,
        alice: &Identifier,
        bob: &Identifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, EngineError>;

    /// Every stored channel (startup check-in, diagnostics)
    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, EngineError>;

    async fn get_active_transfers(
        &self,
        channel: &Address,
    ) -> Result<Vec<Transfer>, EngineError>;

    async fn get_transfer_state(
        &self,
        transfer_id: &Bytes32,
    ) -> Result<Option<Transfer>, EngineError>;

    async fn get_transfers_by_routing_id(
        &self,
        routing_id: &Bytes32,
    ) -> Result<Vec<Transfer>, EngineError>;

    /// Persist a channel state and its transfer delta in one transaction.
    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        delta: &TransferDelta,
    ) -> Result<(), EngineError>;

    /// Overwrite a channel and its entire active-transfer set (restore).
    async fn save_restored_channel(
        &self,
        channel: &ChannelState,
        active_transfers: &[Transfer],
    ) -> Result<(), EngineError>;

    async fn queue_update(
        &self,
        channel: &Address,
        kind: QueuedUpdateKind,
        payload: QueuedPayload,
    ) -> Result<QueuedUpdate, EngineError>;

    async fn get_queued_updates(
        &self,
        channel: &Address,
        statuses: &[QueuedUpdateStatus],
    ) -> Result<Vec<QueuedUpdate>, EngineError>;

    async fn set_update_status(
        &self,
        id: u64,
        status: QueuedUpdateStatus,
        failure_reason: Option<String>,
    ) -> Result<(), EngineError>;

    /// Compare-and-swap status transition; returns false if the row was not
    /// in `expected`.
    async fn set_update_status_if(
        &self,
        id: u64,
        expected: QueuedUpdateStatus,
        status: QueuedUpdateStatus,
        failure_reason: Option<String>,
    ) -> Result<bool, EngineError>;

    async fn save_channel_dispute(&self, dispute: &ChannelDispute) -> Result<(), EngineError>;

    async fn get_channel_dispute(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelDispute>, EngineError>;
}

// =============================================================================
// Lock Service
// =============================================================================

/// Named mutual exclusion across process boundaries, keyed by channel
/// address. `acquire_lock` blocks until the lock is granted (bounded) and
/// returns the release key; `release_lock` frees it for the next holder.
/// Globally mutually exclusive by name, reentrant per (name, key).
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire_lock(
        &self,
        name: &str,
        is_alice: bool,
        counterparty: &Identifier,
    ) -> Result<String, EngineError>;

    async fn release_lock(
        &self,
        name: &str,
        key: &str,
        is_alice: bool,
        counterparty: &Identifier,
    ) -> Result<(), EngineError>;
}

// =============================================================================
// Messaging
// =============================================================================

/// Request/response transport with named reply inboxes. Implementations
/// deliver inbound traffic through the subscription channel; the engine
/// drains it with a serial per-node loop.
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Register for inbound messages addressed to `identifier`.
    async fn subscribe(
        &self,
        identifier: &Identifier,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, EngineError>;

    /// Send a message and await the counterparty's reply. A remote error
    /// envelope surfaces as `Err`.
    async fn request(
        &self,
        from: &Identifier,
        to: &Identifier,
        message: NodeMessage,
        timeout_ms: u64,
    ) -> Result<NodeMessage, EngineError>;

    /// Deliver a reply into a named inbox. Best-effort: the requester may
    /// have timed out already.
    async fn respond(
        &self,
        reply_inbox: &str,
        response: Result<NodeMessage, EngineError>,
    ) -> Result<(), EngineError>;

    /// Open a fresh named inbox this node can later await (the restore-ack
    /// handshake). Returns the inbox name to hand to the peer.
    async fn open_inbox(&self) -> Result<String, EngineError>;

    /// Await a single message delivered into an inbox opened with
    /// [`Messaging::open_inbox`].
    async fn await_inbox(
        &self,
        inbox: &str,
        timeout_ms: u64,
    ) -> Result<NodeMessage, EngineError>;

    /// One outbound protocol exchange: `{update, previousUpdate}` out, the
    /// counter-signed update (or the peer's latest, if we are behind) back.
    async fn send_protocol_message(
        &self,
        from: &Identifier,
        to: &Identifier,
        payload: ProtocolPayload,
        timeout_ms: u64,
    ) -> Result<ProtocolPayload, EngineError> {
        match self
            .request(from, to, NodeMessage::Protocol(payload), timeout_ms)
            .await?
        {
            NodeMessage::Protocol(reply) => Ok(reply),
            other => Err(EngineError::external(format!(
                "unexpected protocol reply: {:?}",
                other
            ))),
        }
    }

    /// Publish a liveness signal for a channel.
    async fn send_is_alive_message(
        &self,
        from: &Identifier,
        to: &Identifier,
        channel_address: Address,
        skip_check_in: bool,
    ) -> Result<(), EngineError> {
        self.request(
            from,
            to,
            NodeMessage::IsAlive {
                channel_address,
                skip_check_in,
            },
            PROTOCOL_MESSAGE_TIMEOUT_MS,
        )
        .await
        .map(|_| ())
    }

    /// Ask the peer holding valid state for a restore payload.
    async fn send_restore_state_message(
        &self,
        from: &Identifier,
        to: &Identifier,
        chain_id: u64,
        timeout_ms: u64,
    ) -> Result<RestoreData, EngineError> {
        match self
            .request(from, to, NodeMessage::RestoreRequest { chain_id }, timeout_ms)
            .await?
        {
            NodeMessage::RestoreReply(data) => Ok(data),
            other => Err(EngineError::external(format!(
                "unexpected restore reply: {:?}",
                other
            ))),
        }
    }

    /// Ask the counterparty to run channel setup as leader.
    async fn send_setup_message(
        &self,
        from: &Identifier,
        to: &Identifier,
        chain_id: u64,
        timeout: u64,
        timeout_ms: u64,
    ) -> Result<Address, EngineError> {
        match self
            .request(
                from,
                to,
                NodeMessage::SetupRequest { chain_id, timeout },
                timeout_ms,
            )
            .await?
        {
            NodeMessage::SetupOk { channel_address } => Ok(channel_address),
            other => Err(EngineError::external(format!(
                "unexpected setup reply: {:?}",
                other
            ))),
        }
    }

    /// Ask a router to collateralize a channel.
    async fn send_request_collateral_message(
        &self,
        from: &Identifier,
        to: &Identifier,
        channel_address: Address,
        asset_id: Address,
        amount: Option<u128>,
    ) -> Result<(), EngineError> {
        self.request(
            from,
            to,
            NodeMessage::RequestCollateral {
                channel_address,
                asset_id,
                amount,
            },
            PROTOCOL_MESSAGE_TIMEOUT_MS,
        )
        .await
        .map(|_| ())
    }

    /// Liveness probe: true iff the peer answered in time.
    async fn probe(&self, from: &Identifier, to: &Identifier) -> bool {
        self.request(from, to, NodeMessage::Probe, PROBE_TIMEOUT_MS)
            .await
            .is_ok()
    }
}

// =============================================================================
// Chain Reader
// =============================================================================

/// A transfer definition registered on-chain: the predicate contract plus
/// the shape of its state and resolver.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegisteredTransfer {
    pub name: String,
    pub definition: Address,
    pub state_encoding: String,
    pub resolver_encoding: String,
    /// The canonical "zero-out" resolver returning funds to the initiator
    pub cancel_resolver: serde_json::Value,
}

/// Read-only view of the chains the node is anchored to.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Deterministic channel address for a participant pair.
    async fn get_channel_address(
        &self,
        alice: &Address,
        bob: &Address,
        chain_id: u64,
        factory: &Address,
    ) -> Result<Address, EngineError>;

    async fn get_registered_transfers(
        &self,
        registry: &Address,
        chain_id: u64,
    ) -> Result<Vec<RegisteredTransfer>, EngineError>;

    /// Evaluate a definition's resolve semantics: a pure function of the
    /// transfer's initial state and the resolver, yielding the post-resolve
    /// balance (slot 0 initiator, slot 1 responder).
    async fn resolve_transfer(
        &self,
        transfer: &Transfer,
        resolver: &serde_json::Value,
    ) -> Result<Balance, EngineError>;

    async fn get_channel_dispute(
        &self,
        channel: &Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, EngineError>;

    /// Cumulative on-chain deposit total for one side of a channel.
    async fn latest_deposit_by_asset_id(
        &self,
        channel: &Address,
        chain_id: u64,
        asset_id: &Address,
        alice_side: bool,
    ) -> Result<u128, EngineError>;

    async fn get_syncing(&self, chain_id: u64) -> Result<bool, EngineError>;
}

// =============================================================================
// Signer
// =============================================================================

/// Produces channel-commitment signatures and decrypts payloads addressed to
/// this node's identifier.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    fn public_identifier(&self) -> Identifier;

    /// Sign a 32-byte commitment digest (EIP-191 style).
    async fn sign_commitment(&self, digest: &Bytes32) -> Result<Signature, EngineError>;

    /// Decrypt a payload encrypted under this node's identifier.
    async fn decrypt(&self, payload: &str) -> Result<Vec<u8>, EngineError>;
}

// =============================================================================
// Validation Hook
// =============================================================================

/// External validation invoked before an outbound update is signed and
/// before an inbound update is counter-signed. The default admits all.
#[async_trait]
pub trait Validation: Send + Sync {
    async fn validate_outbound(
        &self,
        _params: &UpdateParams,
        _channel: Option<&ChannelState>,
        _active: &[Transfer],
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn validate_inbound(
        &self,
        _update: &Update,
        _channel: Option<&ChannelState>,
        _active: &[Transfer],
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Admit-everything validation.
pub struct NoopValidation;

#[async_trait]
impl Validation for NoopValidation {}

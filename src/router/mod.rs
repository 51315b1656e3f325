// =============================================================================
// MOONWIRE v1.2 - Forwarding Engine
// =============================================================================
//
// The router half of the node: translate a conditional transfer created on a
// sender-side channel into the correct action on the recipient-side channel.
//
// Decision ladder, per created transfer addressed to this router:
//
//   1. routing meta present and well-formed, else InvalidForwardingInfo
//      (no cancellation; the context to cancel is absent)
//   2. sender channel loaded, else SenderChannelNotFound (no cancellation)
//   3. swap the amount when the recipient leg differs in asset or chain
//   4. recipient channel resolved by (router, recipient, chain)
//   5. outgoing params: copied condition fields, decremented timeout,
//      meta augmented with the sender identifier
//   6. collateralize, probe liveness (queue when offline and permitted),
//      submit the create through the update protocol
//
// Failures that leave sender funds safe surface without cancellation (the
// sender side times out on-chain); failures that would strand the payment
// cancel the sender transfer with the definition's canonical cancel
// resolver. Resolutions are never cancelled: once the recipient reveals the
// resolver, the router resolves the sender side or queues the resolution
// for retry.
//
// =============================================================================

pub mod collateral;
pub mod queue;
pub mod swap;

pub use collateral::{ChainSender, MemoryChainSender};

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AllowedSwap, RebalanceProfile};
use crate::engine::UpdateEngine;
use crate::events::EngineEvent;
use crate::interfaces::{ChainReader, Messaging, Store};
use crate::types::{
    Address, Balance, Bytes32, ChannelState, CreateParams, EngineError, Identifier,
    QueuedPayload, QueuedUpdateKind, ResolveParams, RoutingMeta, Transfer,
};
use crate::{MIN_TRANSFER_TIMEOUT, TRANSFER_DECREMENT};

// =============================================================================
// Outcomes & Errors
// =============================================================================

/// What forwarding a created transfer produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The outgoing transfer landed on the recipient channel
    Routed {
        recipient_channel: Address,
        transfer_id: Bytes32,
    },
    /// The recipient is offline; the creation is queued for check-in
    Queued {
        recipient_channel: Address,
        queued_update_id: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardErrorKind {
    InvalidForwardingInfo,
    SenderChannelNotFound,
    UnableToCalculateSwap,
    RecipientChannelNotFound,
    ReceiverOffline,
    ForwardingFailed,
}

impl fmt::Display for ForwardErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForwardErrorKind::InvalidForwardingInfo => "invalid forwarding info",
            ForwardErrorKind::SenderChannelNotFound => "sender channel not found",
            ForwardErrorKind::UnableToCalculateSwap => "unable to calculate swap",
            ForwardErrorKind::RecipientChannelNotFound => "recipient channel not found",
            ForwardErrorKind::ReceiverOffline => "receiver offline",
            ForwardErrorKind::ForwardingFailed => "forwarding failed",
        };
        write!(f, "{}", s)
    }
}

/// How the sender-side cancellation went, when one was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancellationOutcome {
    Executed,
    Enqueued,
}

/// A forwarding failure, carrying whether the sender transfer should be
/// (and was) cancelled.
#[derive(Clone, Debug)]
pub struct ForwardError {
    pub kind: ForwardErrorKind,
    pub message: String,
    pub routing_id: Option<Bytes32>,
    pub should_cancel_sender: bool,
    pub sender_transfer_cancellation: Option<CancellationOutcome>,
}

impl ForwardError {
    fn new(kind: ForwardErrorKind, message: impl Into<String>, should_cancel: bool) -> Self {
        ForwardError {
            kind,
            message: message.into(),
            routing_id: None,
            should_cancel_sender: should_cancel,
            sender_transfer_cancellation: None,
        }
    }

    fn with_routing(mut self, routing_id: Bytes32) -> Self {
        self.routing_id = Some(routing_id);
        self
    }
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(routing_id) = &self.routing_id {
            write!(f, " (routing {})", routing_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ForwardError {}

// =============================================================================
// Forwarding Engine
// =============================================================================

pub struct ForwardingEngine {
    pub(crate) engine: Arc<UpdateEngine>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) messaging: Arc<dyn Messaging>,
    pub(crate) chain: Arc<dyn ChainReader>,
    pub(crate) chain_sender: Arc<dyn ChainSender>,
    pub(crate) allowed_swaps: Vec<AllowedSwap>,
    pub(crate) rebalance_profiles: Vec<RebalanceProfile>,
    pub(crate) skip_check_in: bool,
    pub(crate) identifier: Identifier,
    pub(crate) address: Address,
}

impl ForwardingEngine {
    pub fn new(
        engine: Arc<UpdateEngine>,
        chain_sender: Arc<dyn ChainSender>,
        allowed_swaps: Vec<AllowedSwap>,
        rebalance_profiles: Vec<RebalanceProfile>,
        skip_check_in: bool,
    ) -> Arc<Self> {
        Arc::new(ForwardingEngine {
            store: engine.store().clone(),
            messaging: engine.messaging().clone(),
            chain: engine.chain().clone(),
            identifier: engine.public_identifier(),
            address: engine.signer_address(),
            engine,
            chain_sender,
            allowed_swaps,
            rebalance_profiles,
            skip_check_in,
        })
    }

    /// Consume the engine's event stream: forward creations, relay
    /// resolutions, drain queues on liveness, serve collateral requests.
    pub async fn spawn_event_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.engine.events().subscribe();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                router.handle_event(event).await;
            }
        })
    }

    async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::ConditionalTransferCreated { channel, transfer } => {
                match self.process_transfer_created(&channel, &transfer).await {
                    Some(Ok(outcome)) => {
                        info!(transfer = %transfer.transfer_id, ?outcome, "transfer forwarded");
                    }
                    Some(Err(err)) => {
                        warn!(transfer = %transfer.transfer_id, error = %err, "forwarding failed");
                    }
                    None => {}
                }
            }
            EngineEvent::ConditionalTransferResolved { channel, transfer } => {
                match self.process_transfer_resolved(&channel, &transfer).await {
                    Some(Err(err)) => {
                        warn!(
                            transfer = %transfer.transfer_id,
                            error = %err,
                            "sender-side resolution deferred"
                        );
                    }
                    _ => {}
                }
            }
            EngineEvent::IsAlive {
                channel_address,
                skip_check_in,
                ..
            } => {
                if !skip_check_in && !self.skip_check_in {
                    if let Err(err) = self.drain_queued_updates(&channel_address).await {
                        warn!(channel = %channel_address, error = %err, "queue drain failed");
                    }
                }
            }
            EngineEvent::CollateralRequested {
                channel_address,
                asset_id,
                amount,
                ..
            } => {
                if let Err(err) = self
                    .handle_collateral_request(channel_address, asset_id, amount)
                    .await
                {
                    warn!(channel = %channel_address, error = %err, "collateral request failed");
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Created Transfers
    // =========================================================================

    /// Forwarding entry point for one created transfer. Returns `None` when
    /// the transfer is not the router's to forward (we initiated it, or we
    /// are the payment's end recipient); otherwise the forwarding result,
    /// with sender-side cancellation already carried out where required.
    pub async fn process_transfer_created(
        &self,
        channel: &ChannelState,
        transfer: &Transfer,
    ) -> Option<Result<ForwardOutcome, ForwardError>> {
        if transfer.responder != self.address {
            return None;
        }
        if let Some(meta) = transfer.routing_meta() {
            if meta
                .path
                .first()
                .map(|hop| hop.recipient == self.identifier)
                .unwrap_or(false)
            {
                debug!(transfer = %transfer.transfer_id, "transfer terminates here");
                return None;
            }
        }

        let mut result = self.forward_transfer(channel, transfer).await;
        if let Err(err) = &mut result {
            if err.should_cancel_sender {
                err.sender_transfer_cancellation =
                    self.cancel_sender_transfer(transfer).await;
            }
        }
        Some(result)
    }

    /// The forwarding decision ladder, without cancellation handling.
    pub async fn forward_transfer(
        &self,
        _channel: &ChannelState,
        transfer: &Transfer,
    ) -> Result<ForwardOutcome, ForwardError> {
        let meta = transfer.routing_meta().ok_or_else(|| {
            ForwardError::new(
                ForwardErrorKind::InvalidForwardingInfo,
                "transfer meta lacks routing fields",
                false,
            )
        })?;
        let hop = meta.path.first().ok_or_else(|| {
            ForwardError::new(
                ForwardErrorKind::InvalidForwardingInfo,
                "routing path is empty",
                false,
            )
            .with_routing(meta.routing_id)
        })?;

        let sender_channel = self
            .store
            .get_channel_state(&transfer.channel_address)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                ForwardError::new(
                    ForwardErrorKind::SenderChannelNotFound,
                    format!("no state for sender channel {}", transfer.channel_address),
                    false,
                )
                .with_routing(meta.routing_id)
            })?;

        // recipient leg defaults to the sender leg's asset and chain
        let recipient = hop.recipient;
        let recipient_chain_id = hop.recipient_chain_id.unwrap_or(sender_channel.chain_id);
        let recipient_asset_id = hop.recipient_asset_id.unwrap_or(transfer.asset_id);
        let sender_amount = transfer.balance.total();

        let recipient_amount = swap::swapped_amount(
            sender_amount,
            &transfer.asset_id,
            sender_channel.chain_id,
            &recipient_asset_id,
            recipient_chain_id,
            &self.allowed_swaps,
        )
        .map_err(|err| {
            ForwardError::new(ForwardErrorKind::UnableToCalculateSwap, err.to_string(), true)
                .with_routing(meta.routing_id)
        })?;

        let recipient_channel = self
            .store
            .get_channel_state_by_participants(&self.identifier, &recipient, recipient_chain_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                ForwardError::new(
                    ForwardErrorKind::RecipientChannelNotFound,
                    format!(
                        "no channel with {} on chain {}",
                        recipient, recipient_chain_id
                    ),
                    true,
                )
                .with_routing(meta.routing_id)
            })?;

        // the router must keep enough margin to resolve the sender side
        // after the recipient resolves
        let timeout = transfer
            .transfer_timeout
            .checked_sub(TRANSFER_DECREMENT)
            .filter(|t| *t >= MIN_TRANSFER_TIMEOUT)
            .ok_or_else(|| {
                ForwardError::new(
                    ForwardErrorKind::ForwardingFailed,
                    format!(
                        "sender timeout {} leaves no forwarding margin",
                        transfer.transfer_timeout
                    ),
                    true,
                )
                .with_routing(meta.routing_id)
            })?;

        let my_side = recipient_channel.side_of(&self.identifier).ok_or_else(|| {
            ForwardError::new(
                ForwardErrorKind::ForwardingFailed,
                "router absent from recipient channel",
                true,
            )
            .with_routing(meta.routing_id)
        })?;
        let recipient_address = recipient_channel.participant(my_side.other());
        let original_sender = sender_channel
            .counterparty_identifier(&self.identifier)
            .ok_or_else(|| {
                ForwardError::new(
                    ForwardErrorKind::ForwardingFailed,
                    "router absent from sender channel",
                    false,
                )
                .with_routing(meta.routing_id)
            })?;

        let out_meta = RoutingMeta {
            routing_id: meta.routing_id,
            path: meta.path.clone(),
            require_online: meta.require_online,
            sender_identifier: Some(original_sender),
            encrypted_pre_image: meta.encrypted_pre_image.clone(),
        };
        let params = CreateParams {
            channel_address: recipient_channel.channel_address,
            balance: Balance::new([self.address, recipient_address], [recipient_amount, 0]),
            asset_id: recipient_asset_id,
            transfer_definition: transfer.transfer_definition,
            transfer_initial_state: transfer.transfer_state.clone(),
            timeout,
            meta: out_meta.to_value(),
        };

        // collateral first: the create must not bounce on router balance
        let recipient_channel = self
            .ensure_collateral(&recipient_channel, recipient_asset_id, recipient_amount)
            .await
            .map_err(|err| {
                ForwardError::new(ForwardErrorKind::ForwardingFailed, err.to_string(), true)
                    .with_routing(meta.routing_id)
            })?;

        // liveness probe
        if !self.messaging.probe(&self.identifier, &recipient).await {
            if meta.require_online {
                return Err(ForwardError::new(
                    ForwardErrorKind::ReceiverOffline,
                    format!("{} offline and transfer requires online", recipient),
                    true,
                )
                .with_routing(meta.routing_id));
            }
            let row = self
                .store
                .queue_update(
                    &recipient_channel.channel_address,
                    QueuedUpdateKind::TransferCreation,
                    QueuedPayload::Create(params),
                )
                .await
                .map_err(|err| {
                    ForwardError::new(ForwardErrorKind::ForwardingFailed, err.to_string(), false)
                        .with_routing(meta.routing_id)
                })?;
            info!(
                routing = %meta.routing_id,
                recipient_channel = %recipient_channel.channel_address,
                queued = row.id,
                "recipient offline; transfer creation queued"
            );
            return Ok(ForwardOutcome::Queued {
                recipient_channel: recipient_channel.channel_address,
                queued_update_id: row.id,
            });
        }

        // submit through the update protocol
        match self.engine.create(params).await {
            Ok(updated) => {
                let transfer_id = match &updated.latest_update.details {
                    crate::types::UpdateDetails::Create(d) => d.transfer_id,
                    _ => Bytes32::zero(),
                };
                Ok(ForwardOutcome::Routed {
                    recipient_channel: updated.channel_address,
                    transfer_id,
                })
            }
            Err(err) => {
                // a timeout leaves the sender side to expire on-chain;
                // anything else strands the payment and cancels it
                let should_cancel = !err.is_timeout();
                Err(ForwardError::new(
                    ForwardErrorKind::ForwardingFailed,
                    err.to_string(),
                    should_cancel,
                )
                .with_routing(meta.routing_id))
            }
        }
    }

    /// Cancel = resolve the sender-side transfer with the definition's
    /// canonical zero-out resolver, returning the sender's funds.
    async fn cancel_sender_transfer(&self, transfer: &Transfer) -> Option<CancellationOutcome> {
        let channel = match self.store.get_channel_state(&transfer.channel_address).await {
            Ok(Some(channel)) => channel,
            _ => {
                warn!(transfer = %transfer.transfer_id, "cannot cancel: sender channel missing");
                return None;
            }
        };
        let registered = match self
            .chain
            .get_registered_transfers(
                &channel.network_context.transfer_registry_address,
                channel.chain_id,
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "cannot cancel: registry unavailable");
                return None;
            }
        };
        let Some(row) = registered
            .iter()
            .find(|r| r.definition == transfer.transfer_definition)
        else {
            warn!(
                definition = %transfer.transfer_definition,
                "cannot cancel: definition not registered"
            );
            return None;
        };

        let params = ResolveParams {
            channel_address: transfer.channel_address,
            transfer_id: transfer.transfer_id,
            transfer_resolver: row.cancel_resolver.clone(),
            meta: serde_json::Value::Null,
        };
        match self.engine.resolve(params.clone()).await {
            Ok(_) => {
                info!(transfer = %transfer.transfer_id, "sender transfer cancelled");
                Some(CancellationOutcome::Executed)
            }
            Err(err) => {
                warn!(
                    transfer = %transfer.transfer_id,
                    error = %err,
                    "cancellation failed; enqueueing"
                );
                match self
                    .store
                    .queue_update(
                        &transfer.channel_address,
                        QueuedUpdateKind::TransferResolution,
                        QueuedPayload::Resolve(params),
                    )
                    .await
                {
                    Ok(_) => Some(CancellationOutcome::Enqueued),
                    Err(queue_err) => {
                        warn!(error = %queue_err, "cancellation could not be enqueued");
                        None
                    }
                }
            }
        }
    }

    // =========================================================================
    // Resolved Transfers
    // =========================================================================

    /// The recipient resolved our outgoing transfer: resolve the sender-side
    /// transfer with the same resolver. Never cancelled; the resolver is
    /// public once revealed, so failure only ever defers.
    pub async fn process_transfer_resolved(
        &self,
        _channel: &ChannelState,
        transfer: &Transfer,
    ) -> Option<Result<(), EngineError>> {
        if transfer.initiator != self.address {
            return None;
        }
        let meta = transfer.routing_meta()?;
        let resolver = transfer.transfer_resolver.clone()?;

        let related = match self.store.get_transfers_by_routing_id(&meta.routing_id).await {
            Ok(related) => related,
            Err(err) => return Some(Err(err)),
        };
        // the sender-side leg is the one where this router responds
        let Some(sender_side) = related
            .iter()
            .find(|t| t.responder == self.address && t.transfer_id != transfer.transfer_id)
        else {
            return Some(Err(EngineError::transfer_not_found(transfer.transfer_id)
                .with_context("routing_id", meta.routing_id.to_hex())));
        };
        if sender_side.is_resolved() {
            return None;
        }

        let params = ResolveParams {
            channel_address: sender_side.channel_address,
            transfer_id: sender_side.transfer_id,
            transfer_resolver: resolver,
            meta: serde_json::Value::Null,
        };
        match self.engine.resolve(params.clone()).await {
            Ok(_) => {
                info!(
                    routing = %meta.routing_id,
                    sender_transfer = %sender_side.transfer_id,
                    "sender side resolved"
                );
                Some(Ok(()))
            }
            Err(err) => {
                let queued = self
                    .store
                    .queue_update(
                        &sender_side.channel_address,
                        QueuedUpdateKind::TransferResolution,
                        QueuedPayload::Resolve(params),
                    )
                    .await;
                if let Err(queue_err) = queued {
                    warn!(error = %queue_err, "resolution could not be enqueued");
                }
                Some(Err(err))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowedSwap;
    use crate::testutil::{TestHarness, TestNode};
    use crate::types::{DepositParams, QueuedUpdateStatus, RoutingPathNode};
    use std::future::Future;
    use std::time::Duration;

    const USDC: Address = Address([0x05; 20]);

    async fn wait_until<F, Fut>(what: &str, check: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn routed_meta(
        routing_id: Bytes32,
        recipient: &TestNode,
        recipient_asset_id: Option<Address>,
        require_online: bool,
    ) -> serde_json::Value {
        RoutingMeta {
            routing_id,
            path: vec![RoutingPathNode {
                recipient: recipient.identifier(),
                recipient_asset_id,
                recipient_chain_id: None,
            }],
            require_online,
            sender_identifier: None,
            encrypted_pre_image: None,
        }
        .to_value()
    }

    fn router_over(
        harness: &TestHarness,
        node: &TestNode,
        swaps: Vec<AllowedSwap>,
        profiles: Vec<crate::config::RebalanceProfile>,
    ) -> Arc<ForwardingEngine> {
        ForwardingEngine::new(
            node.engine.clone(),
            MemoryChainSender::new(harness.chain.clone()),
            swaps,
            profiles,
            false,
        )
    }

    #[tokio::test]
    async fn test_routed_hashlock_both_online() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;
        let recipient = harness.node().await;

        let sender_channel = harness.funded_channel(&sender, &router_node, 100, 0).await;
        let recipient_channel = harness
            .funded_channel(&router_node, &recipient, 100, 0)
            .await;

        let router = router_over(&harness, &router_node, vec![], vec![]);
        let _loop = router.spawn_event_loop().await;

        let pre_image = Bytes32::from_bytes([0x42; 32]);
        let routing_id = Bytes32::from_bytes([0x77; 32]);
        let mut params =
            harness.hashlock_create(&sender_channel, Address::zero(), 100, pre_image);
        params.meta = routed_meta(routing_id, &recipient, None, false);
        sender.engine.create(params).await.unwrap();

        // the router forwards onto the recipient channel
        wait_until("outgoing transfer at recipient", || async {
            !recipient
                .store
                .get_active_transfers(&recipient_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;
        let outgoing = recipient
            .store
            .get_active_transfers(&recipient_channel.channel_address)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(outgoing.balance.total(), 100);
        assert_eq!(
            outgoing.routing_meta().unwrap().sender_identifier,
            Some(sender.identifier())
        );
        assert_eq!(
            outgoing.transfer_timeout,
            crate::DEFAULT_TRANSFER_TIMEOUT - TRANSFER_DECREMENT
        );

        // the recipient reveals the preimage; the router claims sender-side
        recipient
            .engine
            .resolve(ResolveParams {
                channel_address: recipient_channel.channel_address,
                transfer_id: outgoing.transfer_id,
                transfer_resolver: serde_json::json!({ "pre_image": pre_image }),
                meta: serde_json::Value::Null,
            })
            .await
            .unwrap();

        wait_until("sender-side transfer resolved", || async {
            sender
                .store
                .get_active_transfers(&sender_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;

        // sender -100, router +-0, recipient +100
        let sender_side = sender
            .store
            .get_channel_state(&sender_channel.channel_address)
            .await
            .unwrap()
            .unwrap();
        let balance = sender_side.balance_for_asset(&Address::zero()).unwrap();
        assert_eq!(balance.amount, [100, 0]); // alice = router

        let recipient_side = recipient
            .store
            .get_channel_state(&recipient_channel.channel_address)
            .await
            .unwrap()
            .unwrap();
        let balance = recipient_side.balance_for_asset(&Address::zero()).unwrap();
        assert_eq!(balance.amount, [100, 0]); // alice = recipient
    }

    #[tokio::test]
    async fn test_swap_with_offline_recipient_queues_then_drains() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;
        let recipient = harness.node().await;

        let sender_channel = harness
            .funded_channel(&sender, &router_node, 100_000_000, 0)
            .await;
        let recipient_channel = harness.funded_channel(&router_node, &recipient, 0, 0).await;

        // fund the router's side of the recipient channel in USDC
        harness.chain.credit_deposit(
            &recipient_channel.channel_address,
            recipient_channel.chain_id,
            &USDC,
            false,
            200_000_000,
        );
        router_node
            .engine
            .deposit(DepositParams {
                channel_address: recipient_channel.channel_address,
                asset_id: USDC,
            })
            .await
            .unwrap();

        let swaps = vec![AllowedSwap {
            from_asset_id: Address::zero(),
            from_chain_id: 1,
            to_asset_id: USDC,
            to_chain_id: 1,
            price_numerator: 1005,
            price_denominator: 1000,
        }];
        let router = router_over(&harness, &router_node, swaps, vec![]);
        let _loop = router.spawn_event_loop().await;

        // recipient goes offline before the sender pays
        harness.hub.set_offline(&recipient.identifier(), true);

        let pre_image = Bytes32::from_bytes([0x52; 32]);
        let routing_id = Bytes32::from_bytes([0x88; 32]);
        let mut params = harness.hashlock_create(
            &sender_channel,
            Address::zero(),
            100_000_000,
            pre_image,
        );
        params.meta = routed_meta(routing_id, &recipient, Some(USDC), false);
        sender.engine.create(params).await.unwrap();

        // the creation is queued pending check-in
        wait_until("queued creation row", || async {
            !router_node
                .store
                .get_queued_updates(
                    &recipient_channel.channel_address,
                    &[QueuedUpdateStatus::Pending],
                )
                .await
                .unwrap()
                .is_empty()
        })
        .await;

        // the recipient reconnects and signals liveness
        harness.hub.set_offline(&recipient.identifier(), false);
        recipient
            .engine
            .messaging()
            .send_is_alive_message(
                &recipient.identifier(),
                &router_node.identifier(),
                recipient_channel.channel_address,
                false,
            )
            .await
            .unwrap();

        wait_until("queued creation drained", || async {
            !recipient
                .store
                .get_active_transfers(&recipient_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;

        let outgoing = recipient
            .store
            .get_active_transfers(&recipient_channel.channel_address)
            .await
            .unwrap()
            .remove(0);
        // 100 USDC at 1.005 across the swap
        assert_eq!(outgoing.balance.total(), 100_500_000);
        assert_eq!(outgoing.asset_id, USDC);

        // the recipient resolves; the router claims the sender side
        recipient
            .engine
            .resolve(ResolveParams {
                channel_address: recipient_channel.channel_address,
                transfer_id: outgoing.transfer_id,
                transfer_resolver: serde_json::json!({ "pre_image": pre_image }),
                meta: serde_json::Value::Null,
            })
            .await
            .unwrap();
        wait_until("sender side resolved", || async {
            sender
                .store
                .get_active_transfers(&sender_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;

        let row = router_node
            .store
            .get_queued_updates(
                &recipient_channel.channel_address,
                &[QueuedUpdateStatus::Complete],
            )
            .await
            .unwrap();
        assert_eq!(row.len(), 1);
    }

    #[tokio::test]
    async fn test_collateralizes_before_forwarding() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;
        let recipient = harness.node().await;

        let sender_channel = harness.funded_channel(&sender, &router_node, 100, 0).await;
        let recipient_channel = harness
            .funded_channel(&router_node, &recipient, 50, 0)
            .await;

        let profiles = vec![crate::config::RebalanceProfile {
            chain_id: 1,
            asset_id: Address::zero(),
            reclaim_threshold: 200,
            target: 120,
            collateralize_threshold: 100,
        }];
        let router = router_over(&harness, &router_node, vec![], profiles);
        let _loop = router.spawn_event_loop().await;

        let pre_image = Bytes32::from_bytes([0x61; 32]);
        let mut params = harness.hashlock_create(&sender_channel, Address::zero(), 100, pre_image);
        params.meta = routed_meta(Bytes32::from_bytes([0x99; 32]), &recipient, None, false);
        sender.engine.create(params).await.unwrap();

        wait_until("forwarded after collateralization", || async {
            !recipient
                .store
                .get_active_transfers(&recipient_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;

        // topped up to the 120 target, then locked 100 into the transfer
        let state = router_node
            .store
            .get_channel_state(&recipient_channel.channel_address)
            .await
            .unwrap()
            .unwrap();
        let balance = state.balance_for_asset(&Address::zero()).unwrap();
        assert_eq!(balance.amount, [0, 20]);
    }

    #[tokio::test]
    async fn test_missing_recipient_channel_cancels_sender() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;

        let sender_channel = harness.funded_channel(&sender, &router_node, 100, 0).await;
        let router = router_over(&harness, &router_node, vec![], vec![]);

        let mut params = harness.hashlock_create(
            &sender_channel,
            Address::zero(),
            40,
            Bytes32::from_bytes([0x31; 32]),
        );
        params.meta = serde_json::to_value(RoutingMeta {
            routing_id: Bytes32::from_bytes([0x13; 32]),
            path: vec![RoutingPathNode {
                recipient: Identifier::from_bytes([0x09; 33]),
                recipient_asset_id: None,
                recipient_chain_id: None,
            }],
            require_online: false,
            sender_identifier: None,
            encrypted_pre_image: None,
        })
        .unwrap();
        sender.engine.create(params).await.unwrap();

        let created = router_node
            .store
            .get_active_transfers(&sender_channel.channel_address)
            .await
            .unwrap()
            .remove(0);
        let channel = router_node
            .store
            .get_channel_state(&sender_channel.channel_address)
            .await
            .unwrap()
            .unwrap();

        let err = router
            .process_transfer_created(&channel, &created)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ForwardErrorKind::RecipientChannelNotFound);
        assert_eq!(
            err.sender_transfer_cancellation,
            Some(CancellationOutcome::Executed)
        );

        // the sender's funds came back
        let state = sender
            .store
            .get_channel_state(&sender_channel.channel_address)
            .await
            .unwrap()
            .unwrap();
        let balance = state.balance_for_asset(&Address::zero()).unwrap();
        assert_eq!(balance.amount, [0, 100]);
        assert!(sender
            .store
            .get_active_transfers(&sender_channel.channel_address)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_routing_info_does_not_cancel() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;

        let sender_channel = harness.funded_channel(&sender, &router_node, 100, 0).await;
        let router = router_over(&harness, &router_node, vec![], vec![]);

        // no routing meta at all
        let params = harness.hashlock_create(
            &sender_channel,
            Address::zero(),
            40,
            Bytes32::from_bytes([0x32; 32]),
        );
        sender.engine.create(params).await.unwrap();

        let created = router_node
            .store
            .get_active_transfers(&sender_channel.channel_address)
            .await
            .unwrap()
            .remove(0);
        let channel = router_node
            .store
            .get_channel_state(&sender_channel.channel_address)
            .await
            .unwrap()
            .unwrap();

        let err = router
            .process_transfer_created(&channel, &created)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ForwardErrorKind::InvalidForwardingInfo);
        assert_eq!(err.sender_transfer_cancellation, None);

        // the transfer stays active; the sender side will time out on-chain
        assert_eq!(
            router_node
                .store
                .get_active_transfers(&sender_channel.channel_address)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_require_online_cancels_when_offline() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;
        let recipient = harness.node().await;

        let sender_channel = harness.funded_channel(&sender, &router_node, 100, 0).await;
        harness.funded_channel(&router_node, &recipient, 100, 0).await;

        let router = router_over(&harness, &router_node, vec![], vec![]);
        harness.hub.set_offline(&recipient.identifier(), true);

        let mut params = harness.hashlock_create(
            &sender_channel,
            Address::zero(),
            40,
            Bytes32::from_bytes([0x33; 32]),
        );
        params.meta = routed_meta(Bytes32::from_bytes([0x14; 32]), &recipient, None, true);
        sender.engine.create(params).await.unwrap();

        let created = router_node
            .store
            .get_active_transfers(&sender_channel.channel_address)
            .await
            .unwrap()
            .remove(0);
        let channel = router_node
            .store
            .get_channel_state(&sender_channel.channel_address)
            .await
            .unwrap()
            .unwrap();

        let err = router
            .process_transfer_created(&channel, &created)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ForwardErrorKind::ReceiverOffline);
        assert_eq!(
            err.sender_transfer_cancellation,
            Some(CancellationOutcome::Executed)
        );
    }

    #[tokio::test]
    async fn test_failed_sender_resolution_is_enqueued_and_drained() {
        let harness = TestHarness::new().await;
        let sender = harness.node().await;
        let router_node = harness.node().await;
        let recipient = harness.node().await;

        let sender_channel = harness.funded_channel(&sender, &router_node, 100, 0).await;
        let recipient_channel = harness
            .funded_channel(&router_node, &recipient, 100, 0)
            .await;

        let router = router_over(&harness, &router_node, vec![], vec![]);
        let _loop = router.spawn_event_loop().await;

        let pre_image = Bytes32::from_bytes([0x43; 32]);
        let mut params = harness.hashlock_create(&sender_channel, Address::zero(), 60, pre_image);
        params.meta = routed_meta(Bytes32::from_bytes([0x15; 32]), &recipient, None, false);
        sender.engine.create(params).await.unwrap();

        wait_until("outgoing transfer", || async {
            !recipient
                .store
                .get_active_transfers(&recipient_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;
        let outgoing = recipient
            .store
            .get_active_transfers(&recipient_channel.channel_address)
            .await
            .unwrap()
            .remove(0);

        // the sender drops off before the recipient reveals the preimage
        harness.hub.set_offline(&sender.identifier(), true);
        recipient
            .engine
            .resolve(ResolveParams {
                channel_address: recipient_channel.channel_address,
                transfer_id: outgoing.transfer_id,
                transfer_resolver: serde_json::json!({ "pre_image": pre_image }),
                meta: serde_json::Value::Null,
            })
            .await
            .unwrap();

        // the sender-side resolution lands in the queue
        wait_until("queued resolution row", || async {
            !router_node
                .store
                .get_queued_updates(
                    &sender_channel.channel_address,
                    &[QueuedUpdateStatus::Pending],
                )
                .await
                .unwrap()
                .is_empty()
        })
        .await;

        // the sender reconnects and checks in; the resolution drains
        harness.hub.set_offline(&sender.identifier(), false);
        sender
            .engine
            .messaging()
            .send_is_alive_message(
                &sender.identifier(),
                &router_node.identifier(),
                sender_channel.channel_address,
                false,
            )
            .await
            .unwrap();

        wait_until("sender side resolved after drain", || async {
            sender
                .store
                .get_active_transfers(&sender_channel.channel_address)
                .await
                .unwrap()
                .is_empty()
        })
        .await;
    }
}

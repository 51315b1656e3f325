// =============================================================================
// MOONWIRE v1.2 - Router Node
// =============================================================================
//
// Wires the pieces into a running node: the update engine with its inbound
// message loop, the forwarding engine consuming the engine's events, and the
// startup check-in broadcast that lets counterparties drain work queued for
// this node while it was away.
//
// The RPC surface fronts the methods on this type; embedders can also drive
// it directly.
//
// =============================================================================

use std::sync::Arc;
use tracing::info;

use crate::builder::{
    convert_conditional_transfer_params, convert_resolve_condition_params,
    convert_withdraw_params, ConditionalTransferInput, ResolveConditionInput, WithdrawInput,
};
use crate::config::NodeConfig;
use crate::engine::UpdateEngine;
use crate::interfaces::{
    ChainReader, LockService, Messaging, NoopValidation, Signer, Store,
};
use crate::router::{ChainSender, ForwardingEngine};
use crate::types::{
    Address, ChannelState, DepositParams, EngineError, Identifier, QueuedUpdate,
    QueuedUpdateStatus, SetupParams, Transfer,
};
use crate::{DEFAULT_CHANNEL_TIMEOUT, PROTOCOL_MESSAGE_TIMEOUT_MS};

/// A running channel node: engine, forwarding engine, and their loops.
pub struct RouterNode {
    pub config: NodeConfig,
    pub engine: Arc<UpdateEngine>,
    pub router: Arc<ForwardingEngine>,
    store: Arc<dyn Store>,
    signer: Arc<dyn Signer>,
    messaging: Arc<dyn Messaging>,
    _engine_loop: tokio::task::JoinHandle<()>,
    _router_loop: tokio::task::JoinHandle<()>,
}

impl RouterNode {
    /// Boot a node over the given collaborators. Spawns the engine message
    /// loop and the forwarding event loop, then broadcasts a check-in unless
    /// the configuration skips it.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: NodeConfig,
        signer: Arc<dyn Signer>,
        store: Arc<dyn Store>,
        messaging: Arc<dyn Messaging>,
        chain: Arc<dyn ChainReader>,
        chain_sender: Arc<dyn ChainSender>,
        locks: Arc<dyn LockService>,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;

        let engine = UpdateEngine::new(
            signer.clone(),
            store.clone(),
            messaging.clone(),
            chain,
            locks,
            Arc::new(NoopValidation),
            config.network_contexts(),
        );
        let engine_loop = engine.spawn_message_loop().await?;

        let router = ForwardingEngine::new(
            engine.clone(),
            chain_sender,
            config.allowed_swaps.clone(),
            config.rebalance_profiles.clone(),
            config.skip_check_in,
        );
        let router_loop = router.spawn_event_loop().await;

        if !config.skip_check_in {
            engine.broadcast_check_in().await;
        }
        info!(
            identifier = %engine.public_identifier(),
            address = %engine.signer_address(),
            "node started"
        );

        Ok(Arc::new(RouterNode {
            config,
            engine,
            router,
            store,
            signer,
            messaging,
            _engine_loop: engine_loop,
            _router_loop: router_loop,
        }))
    }

    pub fn public_identifier(&self) -> Identifier {
        self.signer.public_identifier()
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_channel_state(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelState>, EngineError> {
        self.store.get_channel_state(channel).await
    }

    pub async fn get_channel_state_by_participants(
        &self,
        counterparty: &Identifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, EngineError> {
        self.store
            .get_channel_state_by_participants(&self.public_identifier(), counterparty, chain_id)
            .await
    }

    pub async fn get_active_transfers(
        &self,
        channel: &Address,
    ) -> Result<Vec<Transfer>, EngineError> {
        self.store.get_active_transfers(channel).await
    }

    pub async fn get_transfer_state(
        &self,
        transfer_id: &crate::types::Bytes32,
    ) -> Result<Option<Transfer>, EngineError> {
        self.store.get_transfer_state(transfer_id).await
    }

    pub async fn get_transfers_by_routing_id(
        &self,
        routing_id: &crate::types::Bytes32,
    ) -> Result<Vec<Transfer>, EngineError> {
        self.store.get_transfers_by_routing_id(routing_id).await
    }

    pub async fn get_queued_updates(
        &self,
        channel: &Address,
        statuses: &[QueuedUpdateStatus],
    ) -> Result<Vec<QueuedUpdate>, EngineError> {
        self.store.get_queued_updates(channel, statuses).await
    }

    // =========================================================================
    // Channel Operations
    // =========================================================================

    /// Run setup as leader; the counterparty becomes Alice.
    pub async fn setup(
        &self,
        counterparty: Identifier,
        chain_id: u64,
        timeout: Option<u64>,
    ) -> Result<ChannelState, EngineError> {
        let context = self
            .engine
            .network_context(chain_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::validation(format!("chain {} not configured", chain_id))
            })?;
        self.engine
            .setup(SetupParams {
                counterparty_identifier: counterparty,
                timeout: timeout.unwrap_or(DEFAULT_CHANNEL_TIMEOUT),
                network_context: context,
            })
            .await
    }

    /// Ask the counterparty to run setup as leader (this node becomes
    /// Alice).
    pub async fn request_setup(
        &self,
        counterparty: Identifier,
        chain_id: u64,
        timeout: Option<u64>,
    ) -> Result<Address, EngineError> {
        self.messaging
            .send_setup_message(
                &self.public_identifier(),
                &counterparty,
                chain_id,
                timeout.unwrap_or(DEFAULT_CHANNEL_TIMEOUT),
                PROTOCOL_MESSAGE_TIMEOUT_MS,
            )
            .await
    }

    pub async fn deposit(
        &self,
        channel_address: Address,
        asset_id: Address,
    ) -> Result<ChannelState, EngineError> {
        self.engine
            .deposit(DepositParams {
                channel_address,
                asset_id,
            })
            .await
    }

    pub async fn create_transfer(
        &self,
        input: ConditionalTransferInput,
    ) -> Result<ChannelState, EngineError> {
        let channel = self
            .store
            .get_channel_state(&input.channel_address)
            .await?
            .ok_or_else(|| EngineError::channel_not_found(input.channel_address))?;
        let params = convert_conditional_transfer_params(
            input,
            self.signer.as_ref(),
            &channel,
            self.engine.chain().as_ref(),
        )
        .await?;
        self.engine.create(params).await
    }

    pub async fn resolve_transfer(
        &self,
        input: ResolveConditionInput,
    ) -> Result<ChannelState, EngineError> {
        let params = convert_resolve_condition_params(input);
        self.engine.resolve(params).await
    }

    pub async fn withdraw(&self, input: WithdrawInput) -> Result<ChannelState, EngineError> {
        let channel = self
            .store
            .get_channel_state(&input.channel_address)
            .await?
            .ok_or_else(|| EngineError::channel_not_found(input.channel_address))?;
        let params = convert_withdraw_params(
            input,
            self.signer.as_ref(),
            &channel,
            self.engine.chain().as_ref(),
        )
        .await?;
        self.engine.create(params).await
    }

    pub async fn restore_state(
        &self,
        counterparty: Identifier,
        chain_id: u64,
    ) -> Result<ChannelState, EngineError> {
        self.engine.request_restore(counterparty, chain_id).await
    }

    pub async fn send_is_alive(
        &self,
        channel_address: Address,
        skip_check_in: bool,
    ) -> Result<(), EngineError> {
        let channel = self
            .store
            .get_channel_state(&channel_address)
            .await?
            .ok_or_else(|| EngineError::channel_not_found(channel_address))?;
        let counterparty = channel
            .counterparty_identifier(&self.public_identifier())
            .ok_or_else(|| {
                EngineError::validation("this node is not a participant")
                    .with_channel(channel_address)
            })?;
        self.messaging
            .send_is_alive_message(
                &self.public_identifier(),
                &counterparty,
                channel_address,
                skip_check_in,
            )
            .await
    }

    /// Node status summary for the RPC surface.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "public_identifier": self.public_identifier(),
            "signer_address": self.signer_address(),
            "chains": self.config.chain_providers.keys().copied().collect::<Vec<_>>(),
            "skip_check_in": self.config.skip_check_in,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChainReader;
    use crate::lock::MemoryLockService;
    use crate::messaging::{MemoryMessaging, MessagingHub};
    use crate::router::MemoryChainSender;
    use crate::signer::KeySigner;
    use crate::storage::MemoryStore;
    use crate::types::Bytes32;

    struct Fixture {
        hub: Arc<MessagingHub>,
        chain: Arc<MemoryChainReader>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                hub: MessagingHub::new(),
                chain: MemoryChainReader::new(),
            }
        }

        async fn boot(&self) -> Arc<RouterNode> {
            let config = NodeConfig {
                skip_check_in: true,
                ..NodeConfig::default()
            };
            RouterNode::start(
                config,
                Arc::new(KeySigner::random()),
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryMessaging::new(self.hub.clone())),
                self.chain.clone(),
                MemoryChainSender::new(self.chain.clone()),
                MemoryLockService::new(),
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_request_setup_creates_channel_on_both_sides() {
        let fixture = Fixture::new();
        let a = fixture.boot().await;
        let b = fixture.boot().await;

        // a asks b to lead; a becomes Alice
        let channel_address = a
            .request_setup(b.public_identifier(), 1, None)
            .await
            .unwrap();

        let at_a = a.get_channel_state(&channel_address).await.unwrap().unwrap();
        let at_b = b.get_channel_state(&channel_address).await.unwrap().unwrap();
        assert_eq!(at_a, at_b);
        assert_eq!(at_a.alice_identifier, a.public_identifier());
    }

    #[tokio::test]
    async fn test_direct_transfer_through_node_api() {
        let fixture = Fixture::new();
        let a = fixture.boot().await;
        let b = fixture.boot().await;

        let channel_address = b
            .request_setup(a.public_identifier(), 1, None)
            .await
            .unwrap();

        // fund a's side (a leads setup requests from b, so a is Bob here)
        fixture
            .chain
            .credit_deposit(&channel_address, 1, &Address::zero(), false, 500);
        a.deposit(channel_address, Address::zero()).await.unwrap();

        let pre_image = Bytes32::from_bytes([0x21; 32]);
        let updated = a
            .create_transfer(ConditionalTransferInput {
                channel_address,
                transfer_type: crate::HASHLOCK_TRANSFER_NAME.to_string(),
                amount: 200,
                asset_id: Address::zero(),
                details: serde_json::json!({ "pre_image": pre_image }),
                recipient: None,
                recipient_chain_id: None,
                recipient_asset_id: None,
                timeout: None,
                meta: serde_json::Value::Null,
            })
            .await
            .unwrap();
        assert_eq!(updated.nonce, 3);

        let active = b.get_active_transfers(&channel_address).await.unwrap();
        assert_eq!(active.len(), 1);

        // b resolves with the preimage
        let resolved = b
            .resolve_transfer(ResolveConditionInput {
                channel_address,
                transfer_id: active[0].transfer_id,
                transfer_resolver: serde_json::json!({ "pre_image": pre_image }),
                meta: serde_json::Value::Null,
            })
            .await
            .unwrap();
        let balance = resolved.balance_for_asset(&Address::zero()).unwrap();
        assert_eq!(balance.amount, [200, 300]);
    }

    #[tokio::test]
    async fn test_withdraw_through_node_api() {
        let fixture = Fixture::new();
        let a = fixture.boot().await;
        let b = fixture.boot().await;

        let channel_address = b
            .request_setup(a.public_identifier(), 1, None)
            .await
            .unwrap();
        fixture
            .chain
            .credit_deposit(&channel_address, 1, &Address::zero(), false, 500);
        a.deposit(channel_address, Address::zero()).await.unwrap();

        let updated = a
            .withdraw(WithdrawInput {
                channel_address,
                amount: 100,
                asset_id: Address::zero(),
                recipient: Address::from_bytes([0xEE; 20]),
                fee: None,
                timeout: None,
            })
            .await
            .unwrap();

        // the withdraw transfer locked 100 out of a's side
        let balance = updated.balance_for_asset(&Address::zero()).unwrap();
        assert_eq!(balance.amount, [0, 400]);
        let active = a.get_active_transfers(&channel_address).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_send_is_alive_requires_channel() {
        let fixture = Fixture::new();
        let a = fixture.boot().await;
        let err = a
            .send_is_alive(Address::from_bytes([9; 20]), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::ChannelNotFound);
    }

    #[tokio::test]
    async fn test_status_shape() {
        let fixture = Fixture::new();
        let a = fixture.boot().await;
        let status = a.status();
        assert!(status["public_identifier"].is_string());
        assert!(status["signer_address"].is_string());
        assert_eq!(status["skip_check_in"], serde_json::json!(true));
    }
}

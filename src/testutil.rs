// =============================================================================
// MOONWIRE v1.2 - Test Harness
// =============================================================================
//
// Shared fixtures: standalone dummy records for the storage and merkle
// tests, and a two-node in-process harness (hub transport + simulated chain)
// for the protocol, router and rpc tests.
//
// =============================================================================

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::chain::{
    withdraw_commitment_hash, MemoryChainReader, WithdrawState, HASHLOCK_DEFINITION_ADDRESS,
    WITHDRAW_DEFINITION_ADDRESS,
};
use crate::crypto;
use crate::engine::UpdateEngine;
use crate::interfaces::{
    ChainReader, NoopValidation, RegisteredTransfer, Signer, Store,
};
use crate::lock::MemoryLockService;
use crate::messaging::{MemoryMessaging, MessagingHub};
use crate::signer::KeySigner;
use crate::storage::MemoryStore;
use crate::types::{
    Address, Balance, Bytes32, ChannelDispute, ChannelState, CreateParams, DepositParams,
    EngineError, Identifier, NetworkContext, RoutingMeta, RoutingPathNode, SetupParams,
    Signature, Transfer, Update, UpdateDetails,
};
use crate::{DEFAULT_CHANNEL_TIMEOUT, DEFAULT_TRANSFER_TIMEOUT};

// =============================================================================
// Standalone Dummies
// =============================================================================

pub fn test_network_context() -> NetworkContext {
    NetworkContext {
        chain_id: 1,
        channel_factory_address: Address::from_bytes([0xFA; 20]),
        transfer_registry_address: Address::from_bytes([0xFB; 20]),
        provider_url: "http://localhost:8545".to_string(),
    }
}

/// A syntactically complete channel for store-level tests. Identifiers are
/// fabricated, so signature checks will not pass on it.
pub fn dummy_channel(byte: u8) -> ChannelState {
    let alice_identifier = Identifier::from_bytes([byte; 33]);
    let bob_identifier = Identifier::from_bytes([byte.wrapping_add(1); 33]);
    let alice = Address::from_bytes([byte; 20]);
    let bob = Address::from_bytes([byte.wrapping_add(1); 20]);
    let channel_address = Address::from_bytes([byte.wrapping_add(2); 20]);
    let context = test_network_context();

    let update = Update {
        channel_address,
        from_identifier: bob_identifier,
        to_identifier: alice_identifier,
        nonce: 1,
        balance: Balance::empty([alice, bob]),
        asset_id: Address::zero(),
        details: UpdateDetails::Setup(crate::types::SetupUpdateDetails {
            timeout: DEFAULT_CHANNEL_TIMEOUT,
            network_context: context.clone(),
        }),
        alice_signature: None,
        bob_signature: None,
    };

    ChannelState {
        channel_address,
        alice_identifier,
        bob_identifier,
        alice,
        bob,
        chain_id: context.chain_id,
        network_context: context,
        nonce: 1,
        latest_update: update,
        balances: Vec::new(),
        processed_deposits_alice: Vec::new(),
        processed_deposits_bob: Vec::new(),
        asset_ids: Vec::new(),
        merkle_root: crate::merkle::EMPTY_ROOT,
        timeout: DEFAULT_CHANNEL_TIMEOUT,
        in_dispute: false,
    }
}

/// A transfer on `channel` carrying routing metadata.
pub fn dummy_transfer(channel: &ChannelState, byte: u8) -> Transfer {
    let meta = RoutingMeta {
        routing_id: Bytes32::from_bytes([byte; 32]),
        path: vec![RoutingPathNode {
            recipient: Identifier::from_bytes([byte.wrapping_add(7); 33]),
            recipient_asset_id: None,
            recipient_chain_id: None,
        }],
        require_online: false,
        sender_identifier: None,
        encrypted_pre_image: None,
    };
    Transfer {
        transfer_id: Bytes32::from_bytes([byte.wrapping_add(100); 32]),
        channel_address: channel.channel_address,
        initiator: channel.bob,
        responder: channel.alice,
        transfer_definition: HASHLOCK_DEFINITION_ADDRESS,
        transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        initial_state_hash: crypto::keccak256(&[byte]),
        transfer_state: serde_json::json!({
            "lock_hash": crypto::sha256(&[byte]),
            "expiry": 0,
        }),
        transfer_resolver: None,
        balance: Balance::new([channel.bob, channel.alice], [100, 0]),
        asset_id: Address::zero(),
        chain_id: channel.chain_id,
        meta: meta.to_value(),
        channel_nonce: channel.nonce + 1,
        in_dispute: false,
    }
}

// =============================================================================
// Racy Chain (deposit-race instrumentation)
// =============================================================================

type DepositHook = Box<dyn FnOnce(&MemoryChainReader) + Send>;

/// Delegates to the shared in-process chain, firing a one-shot hook after a
/// configured number of deposit reads (to land an on-chain deposit in the
/// middle of a protocol exchange).
pub struct RacyChain {
    inner: Arc<MemoryChainReader>,
    hook: Mutex<Option<(u32, DepositHook)>>,
}

impl RacyChain {
    pub fn new(inner: Arc<MemoryChainReader>) -> Arc<Self> {
        Arc::new(RacyChain {
            inner,
            hook: Mutex::new(None),
        })
    }

    pub fn inject_after_deposit_reads(&self, reads: u32, hook: DepositHook) {
        *self.hook.lock().unwrap() = Some((reads, hook));
    }

    fn tick_deposit_read(&self) {
        let mut slot = self.hook.lock().unwrap();
        if let Some((remaining, _)) = slot.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                let (_, hook) = slot.take().unwrap();
                hook(&self.inner);
            }
        }
    }
}

#[async_trait]
impl ChainReader for RacyChain {
    async fn get_channel_address(
        &self,
        alice: &Address,
        bob: &Address,
        chain_id: u64,
        factory: &Address,
    ) -> Result<Address, EngineError> {
        self.inner
            .get_channel_address(alice, bob, chain_id, factory)
            .await
    }

    async fn get_registered_transfers(
        &self,
        registry: &Address,
        chain_id: u64,
    ) -> Result<Vec<RegisteredTransfer>, EngineError> {
        self.inner.get_registered_transfers(registry, chain_id).await
    }

    async fn resolve_transfer(
        &self,
        transfer: &Transfer,
        resolver: &serde_json::Value,
    ) -> Result<Balance, EngineError> {
        self.inner.resolve_transfer(transfer, resolver).await
    }

    async fn get_channel_dispute(
        &self,
        channel: &Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, EngineError> {
        self.inner.get_channel_dispute(channel, chain_id).await
    }

    async fn latest_deposit_by_asset_id(
        &self,
        channel: &Address,
        chain_id: u64,
        asset_id: &Address,
        alice_side: bool,
    ) -> Result<u128, EngineError> {
        let value = self
            .inner
            .latest_deposit_by_asset_id(channel, chain_id, asset_id, alice_side)
            .await;
        self.tick_deposit_read();
        value
    }

    async fn get_syncing(&self, chain_id: u64) -> Result<bool, EngineError> {
        self.inner.get_syncing(chain_id).await
    }
}

// =============================================================================
// Two-Node Harness
// =============================================================================

pub struct TestHarness {
    pub hub: Arc<MessagingHub>,
    pub chain: Arc<MemoryChainReader>,
    racy: Arc<RacyChain>,
    context: NetworkContext,
}

pub struct TestNode {
    pub engine: Arc<UpdateEngine>,
    pub signer: Arc<KeySigner>,
    pub store: Arc<MemoryStore>,
    context: NetworkContext,
    _message_loop: tokio::task::JoinHandle<()>,
}

pub struct ChannelSnapshot {
    channel: ChannelState,
    active: Vec<Transfer>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let chain = MemoryChainReader::new();
        TestHarness {
            hub: MessagingHub::new(),
            racy: RacyChain::new(chain.clone()),
            chain,
            context: test_network_context(),
        }
    }

    pub fn network_context(&self) -> NetworkContext {
        self.context.clone()
    }

    pub fn inject_after_deposit_reads(
        &self,
        reads: u32,
        hook: impl FnOnce(&MemoryChainReader) + Send + 'static,
    ) {
        self.racy.inject_after_deposit_reads(reads, Box::new(hook));
    }

    pub async fn node(&self) -> TestNode {
        let signer = Arc::new(KeySigner::random());
        let store = Arc::new(MemoryStore::new());
        let messaging = Arc::new(MemoryMessaging::new(self.hub.clone()));
        let locks = MemoryLockService::new();

        let engine = UpdateEngine::new(
            signer.clone(),
            store.clone(),
            messaging,
            self.racy.clone(),
            locks,
            Arc::new(NoopValidation),
            vec![self.context.clone()],
        );
        let message_loop = engine.spawn_message_loop().await.unwrap();

        TestNode {
            engine,
            signer,
            store,
            context: self.context.clone(),
            _message_loop: message_loop,
        }
    }

    pub async fn two_nodes(&self) -> (TestNode, TestNode) {
        (self.node().await, self.node().await)
    }

    /// Set up a channel led by `leader` (who becomes Bob) and fund both
    /// sides of the zero asset through a reconciled deposit update.
    pub async fn funded_channel(
        &self,
        leader: &TestNode,
        counterparty: &TestNode,
        leader_funds: u128,
        counterparty_funds: u128,
    ) -> ChannelState {
        let channel = leader
            .engine
            .setup(SetupParams {
                counterparty_identifier: counterparty.identifier(),
                timeout: DEFAULT_CHANNEL_TIMEOUT,
                network_context: self.context.clone(),
            })
            .await
            .unwrap();

        let asset = Address::zero();
        if counterparty_funds > 0 {
            self.chain.credit_deposit(
                &channel.channel_address,
                channel.chain_id,
                &asset,
                true,
                counterparty_funds,
            );
        }
        if leader_funds > 0 {
            self.chain.credit_deposit(
                &channel.channel_address,
                channel.chain_id,
                &asset,
                false,
                leader_funds,
            );
        }
        leader
            .engine
            .deposit(DepositParams {
                channel_address: channel.channel_address,
                asset_id: asset,
            })
            .await
            .unwrap()
    }

    /// Hashlock create params, initiated by the channel's Bob.
    pub fn hashlock_create(
        &self,
        channel: &ChannelState,
        asset: Address,
        amount: u128,
        pre_image: Bytes32,
    ) -> CreateParams {
        CreateParams {
            channel_address: channel.channel_address,
            balance: Balance::new([channel.bob, channel.alice], [amount, 0]),
            asset_id: asset,
            transfer_definition: HASHLOCK_DEFINITION_ADDRESS,
            transfer_initial_state: serde_json::json!({
                "lock_hash": crypto::sha256(&pre_image.0),
                "expiry": 0,
            }),
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            meta: serde_json::Value::Null,
        }
    }

    /// Withdraw create params with a signed commitment, initiated by `initiator`
    /// (the channel's Bob in these tests). Returns the commitment digest the
    /// responder must counter-sign.
    pub async fn withdraw_create(
        &self,
        initiator: &TestNode,
        channel: &ChannelState,
        asset: Address,
        amount: u128,
        recipient: Address,
    ) -> (CreateParams, Bytes32) {
        let nonce: u64 = rand::random();
        let commitment =
            withdraw_commitment_hash(&channel.channel_address, &recipient, &asset, amount, nonce);
        let initiator_signature = initiator.sign(&commitment).await;
        let state = WithdrawState {
            recipient,
            nonce,
            fee: 0,
            initiator_signature,
        };
        let params = CreateParams {
            channel_address: channel.channel_address,
            balance: Balance::new([recipient, channel.alice], [amount, 0]),
            asset_id: asset,
            transfer_definition: WITHDRAW_DEFINITION_ADDRESS,
            transfer_initial_state: serde_json::to_value(state).unwrap(),
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            meta: serde_json::Value::Null,
        };
        (params, commitment)
    }
}

impl TestNode {
    pub fn identifier(&self) -> Identifier {
        self.signer.public_identifier()
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn network_context(&self) -> NetworkContext {
        self.context.clone()
    }

    pub async fn sign(&self, digest: &Bytes32) -> Signature {
        self.signer.sign_commitment(digest).await.unwrap()
    }

    pub async fn snapshot_channel(&self, address: &Address) -> ChannelSnapshot {
        let channel = self
            .store
            .get_channel_state(address)
            .await
            .unwrap()
            .unwrap();
        let active = self.store.get_active_transfers(address).await.unwrap();
        ChannelSnapshot { channel, active }
    }

    pub async fn restore_snapshot(&self, snapshot: ChannelSnapshot) {
        self.store
            .save_restored_channel(&snapshot.channel, &snapshot.active)
            .await
            .unwrap();
    }

    pub async fn wipe_store(&self) {
        self.store.clear();
    }
}

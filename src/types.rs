// =============================================================================
// MOONWIRE v1.2 - Core Types
// =============================================================================
//
// Data model for the channel engine:
//
// - Channel: two-party off-chain state machine, a sequence of doubly-signed
//   nonce-ordered updates anchored by an on-chain multisig.
// - Transfer: a conditional payment locked by a registered predicate; active
//   transfers are committed into every channel update via a merkle root.
// - Update: one signed state transition (setup | deposit | create | resolve).
// - QueuedUpdate: a router-side row for work deferred until the counterparty
//   signals liveness.
//
// =============================================================================

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Fixed-Size Byte Newtypes
// =============================================================================

macro_rules! hex_bytes_type {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            pub fn zero() -> Self {
                $name([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// 0x-prefixed lowercase hex
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Parse from hex, with or without the 0x prefix
            pub fn from_hex(s: &str) -> Result<Self, String> {
                let stripped = s.strip_prefix("0x").unwrap_or(s);
                let raw = hex::decode(stripped)
                    .map_err(|e| format!("invalid hex: {}", e))?;
                if raw.len() != $len {
                    return Err(format!(
                        "expected {} bytes, got {}",
                        $len,
                        raw.len()
                    ));
                }
                let mut bytes = [0u8; $len];
                bytes.copy_from_slice(&raw);
                Ok($name(bytes))
            }

            /// Short display (first 4 bytes)
            pub fn short(&self) -> String {
                format!("0x{}", hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.short())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                $name::from_hex(&s).map_err(DeError::custom)
            }
        }
    };
}

hex_bytes_type!(Address, 20, "An EVM-style 20-byte account or contract address");
hex_bytes_type!(Bytes32, 32, "A 32-byte hash or identifier");
hex_bytes_type!(Signature, 65, "A 65-byte recoverable ECDSA signature (r || s || v)");
hex_bytes_type!(Identifier, 33, "A peer identifier: the compressed secp256k1 public key used for messaging and signature recovery");

// =============================================================================
// Amount Serialization
// =============================================================================
//
// Token amounts are u128 but travel as decimal strings: JSON numbers top out
// at u64 and both peers must hash identical commitment bytes.

pub(crate) mod serde_amount {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse::<u128>()
            .map_err(|e| DeError::custom(format!("invalid amount {:?}: {}", s, e)))
    }
}

pub(crate) mod serde_amount_array {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(amount: &[u128; 2], s: S) -> Result<S::Ok, S::Error> {
        [amount[0].to_string(), amount[1].to_string()].serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u128; 2], D::Error> {
        let raw: [String; 2] = Deserialize::deserialize(d)?;
        let mut out = [0u128; 2];
        for (i, s) in raw.iter().enumerate() {
            out[i] = s
                .parse::<u128>()
                .map_err(|e| DeError::custom(format!("invalid amount {:?}: {}", s, e)))?;
        }
        Ok(out)
    }
}

pub(crate) mod serde_amount_vec {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(amounts: &Vec<u128>, s: S) -> Result<S::Ok, S::Error> {
        amounts
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u128>, D::Error> {
        let raw: Vec<String> = Deserialize::deserialize(d)?;
        raw.iter()
            .map(|s| {
                s.parse::<u128>()
                    .map_err(|e| DeError::custom(format!("invalid amount {:?}: {}", s, e)))
            })
            .collect()
    }
}

pub(crate) mod serde_amount_opt {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(amount: &Option<u128>, s: S) -> Result<S::Ok, S::Error> {
        amount.map(|a| a.to_string()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u128>, D::Error> {
        let raw: Option<String> = Deserialize::deserialize(d)?;
        raw.map(|s| {
            s.parse::<u128>()
                .map_err(|e| DeError::custom(format!("invalid amount {:?}: {}", s, e)))
        })
        .transpose()
    }
}

// =============================================================================
// Channel Side
// =============================================================================

/// Which participant of a channel. Alice is the channel's first participant
/// (the collateral-bearing side for router channels); Bob the second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSide {
    Alice,
    Bob,
}

impl ChannelSide {
    pub fn other(&self) -> Self {
        match self {
            ChannelSide::Alice => ChannelSide::Bob,
            ChannelSide::Bob => ChannelSide::Alice,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ChannelSide::Alice => 0,
            ChannelSide::Bob => 1,
        }
    }

    pub fn is_alice(&self) -> bool {
        matches!(self, ChannelSide::Alice)
    }
}

// =============================================================================
// Balance
// =============================================================================

/// A two-slot balance vector. For channel balances slot 0 is Alice and slot 1
/// is Bob. For transfer balances slot 0 is the initiator side and slot 1 the
/// responder side; `to` holds the payout addresses the adjudicator honors
/// (these may be external, e.g. a withdrawal recipient).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub to: [Address; 2],
    #[serde(with = "serde_amount_array")]
    pub amount: [u128; 2],
}

impl Balance {
    pub fn new(to: [Address; 2], amount: [u128; 2]) -> Self {
        Balance { to, amount }
    }

    pub fn empty(to: [Address; 2]) -> Self {
        Balance { to, amount: [0, 0] }
    }

    /// Sum of both slots
    pub fn total(&self) -> u128 {
        self.amount[0] + self.amount[1]
    }
}

// =============================================================================
// Network Context
// =============================================================================

/// On-chain anchoring for a channel: the factory that derives the channel
/// address, the registry of transfer definitions, and the provider endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub channel_factory_address: Address,
    pub transfer_registry_address: Address,
    pub provider_url: String,
}

// =============================================================================
// Channel State
// =============================================================================

/// Full off-chain channel state. `nonce` strictly increases by 1 per applied
/// update (setup initializes to 1), both signatures on `latest_update` verify
/// against `alice`/`bob`, and `merkle_root` commits to the set of currently
/// active transfers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_address: Address,
    pub alice_identifier: Identifier,
    pub bob_identifier: Identifier,
    pub alice: Address,
    pub bob: Address,
    pub chain_id: u64,
    pub network_context: NetworkContext,
    pub nonce: u64,
    pub latest_update: Update,
    /// Per-asset two-party balances, indexed like `asset_ids`
    pub balances: Vec<Balance>,
    /// Per-asset cumulative reconciled deposits, indexed like `asset_ids`
    #[serde(with = "serde_amount_vec")]
    pub processed_deposits_alice: Vec<u128>,
    #[serde(with = "serde_amount_vec")]
    pub processed_deposits_bob: Vec<u128>,
    pub asset_ids: Vec<Address>,
    pub merkle_root: Bytes32,
    pub timeout: u64,
    pub in_dispute: bool,
}

impl ChannelState {
    /// Which side of the channel an identifier is, if a participant.
    pub fn side_of(&self, identifier: &Identifier) -> Option<ChannelSide> {
        if *identifier == self.alice_identifier {
            Some(ChannelSide::Alice)
        } else if *identifier == self.bob_identifier {
            Some(ChannelSide::Bob)
        } else {
            None
        }
    }

    /// Which side a signer address is, if a participant.
    pub fn side_of_address(&self, address: &Address) -> Option<ChannelSide> {
        if *address == self.alice {
            Some(ChannelSide::Alice)
        } else if *address == self.bob {
            Some(ChannelSide::Bob)
        } else {
            None
        }
    }

    pub fn participant(&self, side: ChannelSide) -> Address {
        match side {
            ChannelSide::Alice => self.alice,
            ChannelSide::Bob => self.bob,
        }
    }

    pub fn identifier(&self, side: ChannelSide) -> Identifier {
        match side {
            ChannelSide::Alice => self.alice_identifier,
            ChannelSide::Bob => self.bob_identifier,
        }
    }

    pub fn counterparty_identifier(&self, own: &Identifier) -> Option<Identifier> {
        match self.side_of(own)? {
            ChannelSide::Alice => Some(self.bob_identifier),
            ChannelSide::Bob => Some(self.alice_identifier),
        }
    }

    pub fn asset_index(&self, asset_id: &Address) -> Option<usize> {
        self.asset_ids.iter().position(|a| a == asset_id)
    }

    pub fn balance_for_asset(&self, asset_id: &Address) -> Option<&Balance> {
        self.asset_index(asset_id).map(|i| &self.balances[i])
    }

    /// Register an asset with an empty balance if it is not tracked yet;
    /// returns its index.
    pub fn ensure_asset(&mut self, asset_id: Address) -> usize {
        if let Some(i) = self.asset_index(&asset_id) {
            return i;
        }
        self.asset_ids.push(asset_id);
        self.balances.push(Balance::empty([self.alice, self.bob]));
        self.processed_deposits_alice.push(0);
        self.processed_deposits_bob.push(0);
        self.asset_ids.len() - 1
    }

    /// The digest both peers sign for this state. Covers the core channel
    /// fields; excludes `latest_update` (signatures cannot cover themselves)
    /// and `in_dispute` (local bookkeeping).
    pub fn commitment_hash(&self) -> Bytes32 {
        #[derive(Serialize)]
        struct Core<'a> {
            channel_address: &'a Address,
            alice_identifier: &'a Identifier,
            bob_identifier: &'a Identifier,
            alice: &'a Address,
            bob: &'a Address,
            chain_id: u64,
            nonce: u64,
            balances: &'a [Balance],
            #[serde(with = "serde_amount_vec")]
            processed_deposits_alice: Vec<u128>,
            #[serde(with = "serde_amount_vec")]
            processed_deposits_bob: Vec<u128>,
            asset_ids: &'a [Address],
            merkle_root: &'a Bytes32,
            timeout: u64,
        }
        let core = Core {
            channel_address: &self.channel_address,
            alice_identifier: &self.alice_identifier,
            bob_identifier: &self.bob_identifier,
            alice: &self.alice,
            bob: &self.bob,
            chain_id: self.chain_id,
            nonce: self.nonce,
            balances: &self.balances,
            processed_deposits_alice: self.processed_deposits_alice.clone(),
            processed_deposits_bob: self.processed_deposits_bob.clone(),
            asset_ids: &self.asset_ids,
            merkle_root: &self.merkle_root,
            timeout: self.timeout,
        };
        let encoded = serde_json::to_vec(&core).unwrap_or_default();
        crate::crypto::keccak256(&encoded)
    }
}

// =============================================================================
// Transfer
// =============================================================================

/// A conditional payment. Created by a `create` update, active until a
/// `resolve` update attaches `transfer_resolver`, never mutated otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: Bytes32,
    pub channel_address: Address,
    /// Signer address of the peer that created the transfer
    pub initiator: Address,
    /// Signer address of the peer that received the transfer
    pub responder: Address,
    /// Address of the predicate contract encoding create/resolve semantics
    pub transfer_definition: Address,
    pub transfer_timeout: u64,
    /// keccak256 of the canonical initial-state encoding
    pub initial_state_hash: Bytes32,
    /// The definition-specific initial state (e.g. lock hash + expiry)
    pub transfer_state: serde_json::Value,
    /// Present iff the transfer has been resolved
    pub transfer_resolver: Option<serde_json::Value>,
    /// Slot 0 = initiator side, slot 1 = responder side
    pub balance: Balance,
    pub asset_id: Address,
    pub chain_id: u64,
    /// Opaque map; carries routing metadata for forwarded transfers
    pub meta: serde_json::Value,
    /// Channel nonce at creation; part of the transfer-id derivation
    pub channel_nonce: u64,
    pub in_dispute: bool,
}

impl Transfer {
    pub fn is_resolved(&self) -> bool {
        self.transfer_resolver.is_some()
    }

    /// The merkle leaf committing this transfer into the channel root.
    pub fn leaf_hash(&self) -> Bytes32 {
        #[derive(Serialize)]
        struct Leaf<'a> {
            transfer_id: &'a Bytes32,
            channel_address: &'a Address,
            initiator: &'a Address,
            responder: &'a Address,
            transfer_definition: &'a Address,
            transfer_timeout: u64,
            initial_state_hash: &'a Bytes32,
            balance: &'a Balance,
            asset_id: &'a Address,
            chain_id: u64,
            channel_nonce: u64,
        }
        let leaf = Leaf {
            transfer_id: &self.transfer_id,
            channel_address: &self.channel_address,
            initiator: &self.initiator,
            responder: &self.responder,
            transfer_definition: &self.transfer_definition,
            transfer_timeout: self.transfer_timeout,
            initial_state_hash: &self.initial_state_hash,
            balance: &self.balance,
            asset_id: &self.asset_id,
            chain_id: self.chain_id,
            channel_nonce: self.channel_nonce,
        };
        let encoded = serde_json::to_vec(&leaf).unwrap_or_default();
        crate::crypto::keccak256(&encoded)
    }

    /// Routing metadata, if the transfer carries any.
    pub fn routing_meta(&self) -> Option<RoutingMeta> {
        RoutingMeta::from_value(&self.meta)
    }
}

// =============================================================================
// Updates
// =============================================================================

/// Discriminant of an update variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    Setup,
    Deposit,
    Create,
    Resolve,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateType::Setup => "setup",
            UpdateType::Deposit => "deposit",
            UpdateType::Create => "create",
            UpdateType::Resolve => "resolve",
        };
        write!(f, "{}", s)
    }
}

/// Variant-specific payload of an update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UpdateDetails {
    Setup(SetupUpdateDetails),
    Deposit(DepositUpdateDetails),
    Create(CreateUpdateDetails),
    Resolve(ResolveUpdateDetails),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetupUpdateDetails {
    pub timeout: u64,
    pub network_context: NetworkContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositUpdateDetails {
    /// Cumulative on-chain deposits reconciled for Alice, this asset
    #[serde(with = "serde_amount")]
    pub total_deposits_alice: u128,
    /// Cumulative on-chain deposits reconciled for Bob, this asset
    #[serde(with = "serde_amount")]
    pub total_deposits_bob: u128,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateUpdateDetails {
    pub transfer_id: Bytes32,
    pub transfer_definition: Address,
    pub transfer_timeout: u64,
    pub transfer_initial_state: serde_json::Value,
    /// Canonical encoding of the initial state (what `initial_state_hash`
    /// commits to, and what the adjudicator decodes)
    pub transfer_encoded_state: Vec<u8>,
    /// The transfer's own locked balance (slot 0 initiator, slot 1 responder)
    pub transfer_balance: Balance,
    /// Channel merkle root with the new transfer included
    pub merkle_root: Bytes32,
    /// Inclusion proof for the new leaf, as the adjudicator requires
    pub merkle_proof_data: Vec<Bytes32>,
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveUpdateDetails {
    pub transfer_id: Bytes32,
    pub transfer_resolver: serde_json::Value,
    /// Channel merkle root with the resolved transfer removed
    pub merkle_root: Bytes32,
    pub meta: serde_json::Value,
}

impl UpdateDetails {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateDetails::Setup(_) => UpdateType::Setup,
            UpdateDetails::Deposit(_) => UpdateType::Deposit,
            UpdateDetails::Create(_) => UpdateType::Create,
            UpdateDetails::Resolve(_) => UpdateType::Resolve,
        }
    }
}

/// One signed state transition on a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub channel_address: Address,
    pub from_identifier: Identifier,
    pub to_identifier: Identifier,
    pub nonce: u64,
    /// Post-update channel balance for `asset_id`
    pub balance: Balance,
    pub asset_id: Address,
    pub details: UpdateDetails,
    pub alice_signature: Option<Signature>,
    pub bob_signature: Option<Signature>,
}

impl Update {
    pub fn update_type(&self) -> UpdateType {
        self.details.update_type()
    }

    pub fn signature_for(&self, side: ChannelSide) -> Option<&Signature> {
        match side {
            ChannelSide::Alice => self.alice_signature.as_ref(),
            ChannelSide::Bob => self.bob_signature.as_ref(),
        }
    }

    pub fn set_signature(&mut self, side: ChannelSide, signature: Signature) {
        match side {
            ChannelSide::Alice => self.alice_signature = Some(signature),
            ChannelSide::Bob => self.bob_signature = Some(signature),
        }
    }

    pub fn is_doubly_signed(&self) -> bool {
        self.alice_signature.is_some() && self.bob_signature.is_some()
    }
}

// =============================================================================
// Update Params (engine inputs)
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UpdateParams {
    Setup(SetupParams),
    Deposit(DepositParams),
    Create(CreateParams),
    Resolve(ResolveParams),
}

impl UpdateParams {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateParams::Setup(_) => UpdateType::Setup,
            UpdateParams::Deposit(_) => UpdateType::Deposit,
            UpdateParams::Create(_) => UpdateType::Create,
            UpdateParams::Resolve(_) => UpdateType::Resolve,
        }
    }

    /// Channel address the params target; `None` for setup (derived later).
    pub fn channel_address(&self) -> Option<Address> {
        match self {
            UpdateParams::Setup(_) => None,
            UpdateParams::Deposit(p) => Some(p.channel_address),
            UpdateParams::Create(p) => Some(p.channel_address),
            UpdateParams::Resolve(p) => Some(p.channel_address),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupParams {
    /// The counterparty becomes Alice; the initiating peer is Bob.
    pub counterparty_identifier: Identifier,
    pub timeout: u64,
    pub network_context: NetworkContext,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositParams {
    pub channel_address: Address,
    pub asset_id: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateParams {
    pub channel_address: Address,
    /// The transfer's locked balance (slot 0 initiator, slot 1 responder)
    pub balance: Balance,
    pub asset_id: Address,
    pub transfer_definition: Address,
    pub transfer_initial_state: serde_json::Value,
    pub timeout: u64,
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveParams {
    pub channel_address: Address,
    pub transfer_id: Bytes32,
    pub transfer_resolver: serde_json::Value,
    pub meta: serde_json::Value,
}

// =============================================================================
// Routing Meta
// =============================================================================

/// One hop of a routed payment's path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingPathNode {
    pub recipient: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_asset_id: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_chain_id: Option<u64>,
}

/// Routing metadata carried in a transfer's `meta` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingMeta {
    /// Globally unique id linking the sender-side and recipient-side
    /// transfers of a routed payment
    pub routing_id: Bytes32,
    pub path: Vec<RoutingPathNode>,
    #[serde(default)]
    pub require_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_identifier: Option<Identifier>,
    /// Preimage encrypted under the end recipient's identifier, when the
    /// definition requires out-of-band secret delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_pre_image: Option<String>,
}

impl RoutingMeta {
    pub fn from_value(meta: &serde_json::Value) -> Option<RoutingMeta> {
        serde_json::from_value(meta.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Queued Router Updates
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuedUpdateKind {
    TransferCreation,
    TransferResolution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuedUpdateStatus {
    Pending,
    Processing,
    Complete,
    Failed,
    Unverified,
}

impl fmt::Display for QueuedUpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueuedUpdateStatus::Pending => "pending",
            QueuedUpdateStatus::Processing => "processing",
            QueuedUpdateStatus::Complete => "complete",
            QueuedUpdateStatus::Failed => "failed",
            QueuedUpdateStatus::Unverified => "unverified",
        };
        write!(f, "{}", s)
    }
}

/// The exact transfer parameters of a deferred router action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueuedPayload {
    Create(CreateParams),
    Resolve(ResolveParams),
}

/// A router action deferred until the counterparty is reachable. At most one
/// row per channel is `Processing` at any moment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedUpdate {
    pub id: u64,
    pub channel_address: Address,
    pub kind: QueuedUpdateKind,
    pub payload: QueuedPayload,
    pub status: QueuedUpdateStatus,
    pub created_at: u64,
    pub last_failure_reason: Option<String>,
}

// =============================================================================
// Dispute Record
// =============================================================================

/// On-chain dispute bookkeeping for a channel. A disputed channel is terminal
/// for the protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelDispute {
    pub channel_address: Address,
    pub channel_state_hash: Bytes32,
    pub nonce: u64,
    pub merkle_root: Bytes32,
    pub consensus_expiry: u64,
    pub defund_expiry: u64,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure taxonomy for the engine and its collaborators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Params failed schema or contextual checks; never retried
    Validation,
    ChannelNotFound,
    TransferNotFound,
    /// The remote is out of sync; it replied with its latest update
    StaleUpdate,
    /// The gap is not syncable; a restore procedure must follow
    RestoreNeeded,
    /// Signature recovery mismatch (deposit race); retryable
    BadSignatures,
    /// Network or counterparty unresponsive
    Timeout,
    /// Transfer definition not registered; non-retryable
    InvalidTransferType,
    /// Recipient offline; converted to a queued success when allowed
    ReceiverOffline,
    /// Channel is disputed; protocol updates rejected
    Dispute,
    /// Wrapped error from signer, chain, or store
    External,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ChannelNotFound => "channel not found",
            ErrorKind::TransferNotFound => "transfer not found",
            ErrorKind::StaleUpdate => "stale update",
            ErrorKind::RestoreNeeded => "restore needed",
            ErrorKind::BadSignatures => "bad signatures",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidTransferType => "invalid transfer type",
            ErrorKind::ReceiverOffline => "receiver offline",
            ErrorKind::Dispute => "channel in dispute",
            ErrorKind::External => "external",
        };
        write!(f, "{}", s)
    }
}

/// Structured engine error: a kind plus the context needed to act on it.
/// Serialized over the wire as `{message, context}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub channel_address: Option<Address>,
    pub transfer_id: Option<Bytes32>,
    /// Extra context fields (node error, method, etc.)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError {
            kind,
            message: message.into(),
            channel_address: None,
            transfer_id: None,
            context: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn channel_not_found(channel: Address) -> Self {
        Self::new(ErrorKind::ChannelNotFound, "no state for channel")
            .with_channel(channel)
    }

    pub fn transfer_not_found(transfer_id: Bytes32) -> Self {
        Self::new(ErrorKind::TransferNotFound, "no state for transfer")
            .with_transfer(transfer_id)
    }

    pub fn stale_update(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StaleUpdate, message)
    }

    pub fn restore_needed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RestoreNeeded, message)
    }

    pub fn bad_signatures(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadSignatures, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn invalid_transfer_type(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransferType, message)
    }

    pub fn receiver_offline(identifier: &Identifier) -> Self {
        Self::new(
            ErrorKind::ReceiverOffline,
            format!("receiver {} offline", identifier),
        )
    }

    pub fn dispute(channel: Address) -> Self {
        Self::new(ErrorKind::Dispute, "channel is in dispute").with_channel(channel)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::External, message)
    }

    pub fn with_channel(mut self, channel: Address) -> Self {
        self.channel_address = Some(channel);
        self
    }

    pub fn with_transfer(mut self, transfer_id: Bytes32) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    /// Whether the outbound layer may retry (the deposit race)
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::BadSignatures
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(channel) = &self.channel_address {
            write!(f, " (channel {})", channel)?;
        }
        if let Some(transfer) = &self.transfer_id {
            write!(f, " (transfer {})", transfer)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let addr = Address::from_bytes([0xAB; 20]);
        let parsed = Address::from_hex(&addr.to_hex()).unwrap();
        assert_eq!(addr, parsed);

        // 0x prefix is optional
        let bare = hex::encode([0xCD; 32]);
        let b = Bytes32::from_hex(&bare).unwrap();
        assert_eq!(b.0, [0xCD; 32]);
    }

    #[test]
    fn test_hex_rejects_bad_length() {
        assert!(Address::from_hex("0x1234").is_err());
        assert!(Bytes32::from_hex("0xzz").is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let b = Bytes32::from_bytes([0x11; 32]);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, format!("\"0x{}\"", hex::encode([0x11; 32])));
        let back: Bytes32 = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }

    #[test]
    fn test_balance_total() {
        let b = Balance::new(
            [Address::zero(), Address::zero()],
            [70, 30],
        );
        assert_eq!(b.total(), 100);
    }

    #[test]
    fn test_routing_meta_roundtrip() {
        let meta = RoutingMeta {
            routing_id: Bytes32::from_bytes([7; 32]),
            path: vec![RoutingPathNode {
                recipient: Identifier::from_bytes([2; 33]),
                recipient_asset_id: None,
                recipient_chain_id: Some(137),
            }],
            require_online: false,
            sender_identifier: None,
            encrypted_pre_image: None,
        };
        let value = meta.to_value();
        let back = RoutingMeta::from_value(&value).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn test_routing_meta_missing_fields() {
        let value = serde_json::json!({ "hello": "world" });
        assert!(RoutingMeta::from_value(&value).is_none());
    }

    #[test]
    fn test_error_display_with_context() {
        let err = EngineError::validation("bad amount")
            .with_channel(Address::from_bytes([1; 20]));
        let text = format!("{}", err);
        assert!(text.contains("validation"));
        assert!(text.contains("bad amount"));
        assert!(err.channel_address.is_some());
    }

    #[test]
    fn test_error_retryability() {
        assert!(EngineError::bad_signatures("race").is_retryable());
        assert!(!EngineError::validation("no").is_retryable());
        assert!(EngineError::timeout("slow").is_timeout());
    }
}

// =============================================================================
// MOONWIRE v1.1 - Storage Engine (Sled Database)
// =============================================================================
//
// Durable state behind the `Store` trait:
//
//   channels        channel_address          -> ChannelState
//   transfers  t:   transfer_id              -> Transfer
//              a:   channel ++ transfer_id   -> ()   (active marker)
//              r:   routing_id ++ transfer_id-> ()   (routing index)
//   queue           queue id (be bytes)      -> QueuedUpdate
//   disputes        channel_address          -> ChannelDispute
//
// Channel state and its transfer delta commit in one sled transaction; a
// crash never leaves a signed channel state without its transfer rows.
// Values are stored as canonical JSON, the same encoding the wire and the
// commitment hashing use.
//
// `MemoryStore` offers the same contract for tests and throwaway nodes.
//
// =============================================================================

use async_trait::async_trait;
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::interfaces::{Store, TransferDelta};
use crate::types::{
    Address, Bytes32, ChannelDispute, ChannelState, EngineError, Identifier, QueuedPayload,
    QueuedUpdate, QueuedUpdateKind, QueuedUpdateStatus, Transfer,
};
use crate::unix_now;

const TRANSFER_PREFIX: u8 = b't';
const ACTIVE_PREFIX: u8 = b'a';
const ROUTING_PREFIX: u8 = b'r';

fn transfer_key(transfer_id: &Bytes32) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(TRANSFER_PREFIX);
    key.push(b':');
    key.extend_from_slice(&transfer_id.0);
    key
}

fn active_key(channel: &Address, transfer_id: &Bytes32) -> Vec<u8> {
    let mut key = Vec::with_capacity(54);
    key.push(ACTIVE_PREFIX);
    key.push(b':');
    key.extend_from_slice(&channel.0);
    key.extend_from_slice(&transfer_id.0);
    key
}

fn active_scan_prefix(channel: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(22);
    key.push(ACTIVE_PREFIX);
    key.push(b':');
    key.extend_from_slice(&channel.0);
    key
}

fn routing_key(routing_id: &Bytes32, transfer_id: &Bytes32) -> Vec<u8> {
    let mut key = Vec::with_capacity(66);
    key.push(ROUTING_PREFIX);
    key.push(b':');
    key.extend_from_slice(&routing_id.0);
    key.extend_from_slice(&transfer_id.0);
    key
}

fn routing_scan_prefix(routing_id: &Bytes32) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.push(ROUTING_PREFIX);
    key.push(b':');
    key.extend_from_slice(&routing_id.0);
    key
}

fn routing_id_of(transfer: &Transfer) -> Option<Bytes32> {
    transfer.routing_meta().map(|m| m.routing_id)
}

fn store_err(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::external(format!("store: {}: {}", context, err))
}

// =============================================================================
// Sled Store
// =============================================================================

/// Persistent store over a sled database.
pub struct SledStore {
    _db: Db,
    channels: Tree,
    transfers: Tree,
    queue: Tree,
    disputes: Tree,
}

impl SledStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let db = sled::open(path).map_err(|e| store_err("open", e))?;
        let channels = db
            .open_tree("channels")
            .map_err(|e| store_err("open channels tree", e))?;
        let transfers = db
            .open_tree("transfers")
            .map_err(|e| store_err("open transfers tree", e))?;
        let queue = db
            .open_tree("queue")
            .map_err(|e| store_err("open queue tree", e))?;
        let disputes = db
            .open_tree("disputes")
            .map_err(|e| store_err("open disputes tree", e))?;
        Ok(SledStore {
            _db: db,
            channels,
            transfers,
            queue,
            disputes,
        })
    }

    fn decode_channel(bytes: &[u8]) -> Result<ChannelState, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| store_err("decode channel", e))
    }

    fn decode_transfer(bytes: &[u8]) -> Result<Transfer, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| store_err("decode transfer", e))
    }

    fn decode_queued(bytes: &[u8]) -> Result<QueuedUpdate, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| store_err("decode queued update", e))
    }

    fn transfer_by_id(&self, transfer_id: &Bytes32) -> Result<Option<Transfer>, EngineError> {
        match self
            .transfers
            .get(transfer_key(transfer_id))
            .map_err(|e| store_err("get transfer", e))?
        {
            Some(bytes) => Ok(Some(Self::decode_transfer(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Store for SledStore {
    async fn get_channel_state(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelState>, EngineError> {
        match self
            .channels
            .get(channel.0)
            .map_err(|e| store_err("get channel", e))?
        {
            Some(bytes) => Ok(Some(Self::decode_channel(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_channel_state_by_participants(
        &self,
        alice: &Identifier,
        bob: &Identifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, EngineError> {
        for item in self.channels.iter() {
            let (_, bytes) = item.map_err(|e| store_err("scan channels", e))?;
            let channel = Self::decode_channel(&bytes)?;
            let same_pair = (channel.alice_identifier == *alice
                && channel.bob_identifier == *bob)
                || (channel.alice_identifier == *bob && channel.bob_identifier == *alice);
            if same_pair && channel.chain_id == chain_id {
                return Ok(Some(channel));
            }
        }
        Ok(None)
    }

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, EngineError> {
        let mut out = Vec::new();
        for item in self.channels.iter() {
            let (_, bytes) = item.map_err(|e| store_err("scan channels", e))?;
            out.push(Self::decode_channel(&bytes)?);
        }
        Ok(out)
    }

    async fn get_active_transfers(
        &self,
        channel: &Address,
    ) -> Result<Vec<Transfer>, EngineError> {
        let mut out = Vec::new();
        for item in self.transfers.scan_prefix(active_scan_prefix(channel)) {
            let (key, _) = item.map_err(|e| store_err("scan active", e))?;
            let mut id = [0u8; 32];
            id.copy_from_slice(&key[key.len() - 32..]);
            if let Some(transfer) = self.transfer_by_id(&Bytes32(id))? {
                out.push(transfer);
            }
        }
        Ok(out)
    }

    async fn get_transfer_state(
        &self,
        transfer_id: &Bytes32,
    ) -> Result<Option<Transfer>, EngineError> {
        self.transfer_by_id(transfer_id)
    }

    async fn get_transfers_by_routing_id(
        &self,
        routing_id: &Bytes32,
    ) -> Result<Vec<Transfer>, EngineError> {
        let mut out = Vec::new();
        for item in self.transfers.scan_prefix(routing_scan_prefix(routing_id)) {
            let (key, _) = item.map_err(|e| store_err("scan routing", e))?;
            let mut id = [0u8; 32];
            id.copy_from_slice(&key[key.len() - 32..]);
            if let Some(transfer) = self.transfer_by_id(&Bytes32(id))? {
                out.push(transfer);
            }
        }
        Ok(out)
    }

    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        delta: &TransferDelta,
    ) -> Result<(), EngineError> {
        let channel_bytes =
            serde_json::to_vec(channel).map_err(|e| store_err("encode channel", e))?;

        let created = match &delta.created {
            Some(t) => Some((
                transfer_key(&t.transfer_id),
                active_key(&channel.channel_address, &t.transfer_id),
                routing_id_of(t).map(|r| routing_key(&r, &t.transfer_id)),
                serde_json::to_vec(t).map_err(|e| store_err("encode transfer", e))?,
            )),
            None => None,
        };
        let resolved = match &delta.resolved {
            Some(t) => Some((
                transfer_key(&t.transfer_id),
                active_key(&channel.channel_address, &t.transfer_id),
                serde_json::to_vec(t).map_err(|e| store_err("encode transfer", e))?,
            )),
            None => None,
        };

        let result: Result<(), TransactionError<()>> = (&self.channels, &self.transfers)
            .transaction(|(channels, transfers)| {
                channels.insert(&channel.channel_address.0[..], channel_bytes.as_slice())?;
                if let Some((t_key, a_key, r_key, bytes)) = &created {
                    transfers.insert(t_key.as_slice(), bytes.as_slice())?;
                    transfers.insert(a_key.as_slice(), &[1u8][..])?;
                    if let Some(r_key) = r_key {
                        transfers.insert(r_key.as_slice(), &[1u8][..])?;
                    }
                }
                if let Some((t_key, a_key, bytes)) = &resolved {
                    transfers.insert(t_key.as_slice(), bytes.as_slice())?;
                    transfers.remove(a_key.as_slice())?;
                }
                Ok(())
            });
        result.map_err(|e| EngineError::external(format!("store: save channel: {:?}", e)))
    }

    async fn save_restored_channel(
        &self,
        channel: &ChannelState,
        active_transfers: &[Transfer],
    ) -> Result<(), EngineError> {
        // wipe stale active markers, then write the restored set
        let stale: Vec<Vec<u8>> = self
            .transfers
            .scan_prefix(active_scan_prefix(&channel.channel_address))
            .filter_map(|item| item.ok().map(|(key, _)| key.to_vec()))
            .collect();

        let channel_bytes =
            serde_json::to_vec(channel).map_err(|e| store_err("encode channel", e))?;
        let mut rows = Vec::with_capacity(active_transfers.len());
        for t in active_transfers {
            rows.push((
                transfer_key(&t.transfer_id),
                active_key(&channel.channel_address, &t.transfer_id),
                routing_id_of(t).map(|r| routing_key(&r, &t.transfer_id)),
                serde_json::to_vec(t).map_err(|e| store_err("encode transfer", e))?,
            ));
        }

        let result: Result<(), TransactionError<()>> = (&self.channels, &self.transfers)
            .transaction(|(channels, transfers)| {
                channels.insert(&channel.channel_address.0[..], channel_bytes.as_slice())?;
                for key in &stale {
                    transfers.remove(key.as_slice())?;
                }
                for (t_key, a_key, r_key, bytes) in &rows {
                    transfers.insert(t_key.as_slice(), bytes.as_slice())?;
                    transfers.insert(a_key.as_slice(), &[1u8][..])?;
                    if let Some(r_key) = r_key {
                        transfers.insert(r_key.as_slice(), &[1u8][..])?;
                    }
                }
                Ok(())
            });
        result.map_err(|e| {
            EngineError::external(format!("store: save restored channel: {:?}", e))
        })
    }

    async fn queue_update(
        &self,
        channel: &Address,
        kind: QueuedUpdateKind,
        payload: QueuedPayload,
    ) -> Result<QueuedUpdate, EngineError> {
        let id = self
            ._db
            .generate_id()
            .map_err(|e| store_err("generate queue id", e))?;
        let row = QueuedUpdate {
            id,
            channel_address: *channel,
            kind,
            payload,
            status: QueuedUpdateStatus::Pending,
            created_at: unix_now(),
            last_failure_reason: None,
        };
        let bytes = serde_json::to_vec(&row).map_err(|e| store_err("encode queued", e))?;
        self.queue
            .insert(id.to_be_bytes(), bytes)
            .map_err(|e| store_err("insert queued", e))?;
        Ok(row)
    }

    async fn get_queued_updates(
        &self,
        channel: &Address,
        statuses: &[QueuedUpdateStatus],
    ) -> Result<Vec<QueuedUpdate>, EngineError> {
        let mut out = Vec::new();
        for item in self.queue.iter() {
            let (_, bytes) = item.map_err(|e| store_err("scan queue", e))?;
            let row = Self::decode_queued(&bytes)?;
            if row.channel_address == *channel && statuses.contains(&row.status) {
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn set_update_status(
        &self,
        id: u64,
        status: QueuedUpdateStatus,
        failure_reason: Option<String>,
    ) -> Result<(), EngineError> {
        let key = id.to_be_bytes();
        let bytes = self
            .queue
            .get(key)
            .map_err(|e| store_err("get queued", e))?
            .ok_or_else(|| EngineError::external(format!("queued update {} missing", id)))?;
        let mut row = Self::decode_queued(&bytes)?;
        row.status = status;
        if failure_reason.is_some() {
            row.last_failure_reason = failure_reason;
        }
        let encoded = serde_json::to_vec(&row).map_err(|e| store_err("encode queued", e))?;
        self.queue
            .insert(key, encoded)
            .map_err(|e| store_err("insert queued", e))?;
        Ok(())
    }

    async fn set_update_status_if(
        &self,
        id: u64,
        expected: QueuedUpdateStatus,
        status: QueuedUpdateStatus,
        failure_reason: Option<String>,
    ) -> Result<bool, EngineError> {
        let key = id.to_be_bytes();
        let old_bytes = match self.queue.get(key).map_err(|e| store_err("get queued", e))? {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        let mut row = Self::decode_queued(&old_bytes)?;
        if row.status != expected {
            return Ok(false);
        }
        row.status = status;
        if failure_reason.is_some() {
            row.last_failure_reason = failure_reason;
        }
        let new_bytes = serde_json::to_vec(&row).map_err(|e| store_err("encode queued", e))?;
        let swapped = self
            .queue
            .compare_and_swap(key, Some(old_bytes), Some(new_bytes))
            .map_err(|e| store_err("cas queued", e))?;
        Ok(swapped.is_ok())
    }

    async fn save_channel_dispute(&self, dispute: &ChannelDispute) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec(dispute).map_err(|e| store_err("encode dispute", e))?;
        self.disputes
            .insert(dispute.channel_address.0, bytes)
            .map_err(|e| store_err("insert dispute", e))?;
        Ok(())
    }

    async fn get_channel_dispute(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelDispute>, EngineError> {
        match self
            .disputes
            .get(channel.0)
            .map_err(|e| store_err("get dispute", e))?
        {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| store_err("decode dispute", e))?,
            )),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    channels: HashMap<Address, ChannelState>,
    transfers: HashMap<Bytes32, Transfer>,
    active: HashMap<Address, Vec<Bytes32>>,
    routing: HashMap<Bytes32, Vec<Bytes32>>,
    queue: BTreeMap<u64, QueuedUpdate>,
    next_queue_id: u64,
    disputes: HashMap<Address, ChannelDispute>,
}

/// In-memory store for tests and throwaway nodes. A single mutex makes
/// every save trivially atomic.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Drop everything (simulated storage loss).
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = MemoryInner::default();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_channel_state(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelState>, EngineError> {
        Ok(self.inner.lock().unwrap().channels.get(channel).cloned())
    }

    async fn get_channel_state_by_participants(
        &self,
        alice: &Identifier,
        bob: &Identifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .channels
            .values()
            .find(|c| {
                let same_pair = (c.alice_identifier == *alice && c.bob_identifier == *bob)
                    || (c.alice_identifier == *bob && c.bob_identifier == *alice);
                same_pair && c.chain_id == chain_id
            })
            .cloned())
    }

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, EngineError> {
        Ok(self.inner.lock().unwrap().channels.values().cloned().collect())
    }

    async fn get_active_transfers(
        &self,
        channel: &Address,
    ) -> Result<Vec<Transfer>, EngineError> {
        let inner = self.inner.lock().unwrap();
        let ids = inner.active.get(channel).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.transfers.get(id).cloned())
            .collect())
    }

    async fn get_transfer_state(
        &self,
        transfer_id: &Bytes32,
    ) -> Result<Option<Transfer>, EngineError> {
        Ok(self.inner.lock().unwrap().transfers.get(transfer_id).cloned())
    }

    async fn get_transfers_by_routing_id(
        &self,
        routing_id: &Bytes32,
    ) -> Result<Vec<Transfer>, EngineError> {
        let inner = self.inner.lock().unwrap();
        let ids = inner.routing.get(routing_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.transfers.get(id).cloned())
            .collect())
    }

    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        delta: &TransferDelta,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .channels
            .insert(channel.channel_address, channel.clone());

        if let Some(created) = &delta.created {
            inner
                .transfers
                .insert(created.transfer_id, created.clone());
            let active = inner
                .active
                .entry(channel.channel_address)
                .or_default();
            if !active.contains(&created.transfer_id) {
                active.push(created.transfer_id);
            }
            if let Some(routing_id) = routing_id_of(created) {
                let index = inner.routing.entry(routing_id).or_default();
                if !index.contains(&created.transfer_id) {
                    index.push(created.transfer_id);
                }
            }
        }
        if let Some(resolved) = &delta.resolved {
            inner
                .transfers
                .insert(resolved.transfer_id, resolved.clone());
            if let Some(active) = inner.active.get_mut(&channel.channel_address) {
                active.retain(|id| *id != resolved.transfer_id);
            }
        }
        Ok(())
    }

    async fn save_restored_channel(
        &self,
        channel: &ChannelState,
        active_transfers: &[Transfer],
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .channels
            .insert(channel.channel_address, channel.clone());
        let ids: Vec<Bytes32> = active_transfers.iter().map(|t| t.transfer_id).collect();
        inner.active.insert(channel.channel_address, ids);
        for t in active_transfers {
            inner.transfers.insert(t.transfer_id, t.clone());
            if let Some(routing_id) = routing_id_of(t) {
                let index = inner.routing.entry(routing_id).or_default();
                if !index.contains(&t.transfer_id) {
                    index.push(t.transfer_id);
                }
            }
        }
        Ok(())
    }

    async fn queue_update(
        &self,
        channel: &Address,
        kind: QueuedUpdateKind,
        payload: QueuedPayload,
    ) -> Result<QueuedUpdate, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_queue_id;
        inner.next_queue_id += 1;
        let row = QueuedUpdate {
            id,
            channel_address: *channel,
            kind,
            payload,
            status: QueuedUpdateStatus::Pending,
            created_at: unix_now(),
            last_failure_reason: None,
        };
        inner.queue.insert(id, row.clone());
        Ok(row)
    }

    async fn get_queued_updates(
        &self,
        channel: &Address,
        statuses: &[QueuedUpdateStatus],
    ) -> Result<Vec<QueuedUpdate>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .queue
            .values()
            .filter(|row| row.channel_address == *channel && statuses.contains(&row.status))
            .cloned()
            .collect())
    }

    async fn set_update_status(
        &self,
        id: u64,
        status: QueuedUpdateStatus,
        failure_reason: Option<String>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .queue
            .get_mut(&id)
            .ok_or_else(|| EngineError::external(format!("queued update {} missing", id)))?;
        row.status = status;
        if failure_reason.is_some() {
            row.last_failure_reason = failure_reason;
        }
        Ok(())
    }

    async fn set_update_status_if(
        &self,
        id: u64,
        expected: QueuedUpdateStatus,
        status: QueuedUpdateStatus,
        failure_reason: Option<String>,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.get_mut(&id) {
            Some(row) if row.status == expected => {
                row.status = status;
                if failure_reason.is_some() {
                    row.last_failure_reason = failure_reason;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_channel_dispute(&self, dispute: &ChannelDispute) -> Result<(), EngineError> {
        self.inner
            .lock()
            .unwrap()
            .disputes
            .insert(dispute.channel_address, dispute.clone());
        Ok(())
    }

    async fn get_channel_dispute(
        &self,
        channel: &Address,
    ) -> Result<Option<ChannelDispute>, EngineError> {
        Ok(self.inner.lock().unwrap().disputes.get(channel).cloned())
    }
}

// =============================================================================
// Tests
// =============================================================================

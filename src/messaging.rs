// =============================================================================
// MOONWIRE v1.1 - Messaging
// =============================================================================
//
// Wire messages exchanged between peers, and an in-process transport used by
// tests and single-process deployments. The transport contract is
// request/response with named reply inboxes: a sender registers a one-shot
// inbox, the receiver handles the message and responds into that inbox (or
// never does, and the sender times out).
//
// Production deployments implement the `Messaging` trait over a broker; the
// engine only sees the subscription channel and the request/respond calls.
//
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use async_trait::async_trait;

use crate::interfaces::Messaging;
use crate::types::{Address, ChannelState, EngineError, Identifier, Transfer, Update};

// =============================================================================
// Wire Messages
// =============================================================================

/// One protocol exchange payload: the new update plus the sender's previous
/// latest update (for single-step sync on the receiving side).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolPayload {
    pub update: Update,
    pub previous_update: Option<Update>,
}

/// Restore payload sent by the peer holding valid state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreData {
    pub channel: ChannelState,
    pub active_transfers: Vec<Transfer>,
    /// Inbox the requester acknowledges into; the holder releases the
    /// channel lock when the ack (or an error) arrives
    pub ack_inbox: String,
}

/// Everything that travels between nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeMessage {
    Protocol(ProtocolPayload),
    RestoreRequest {
        chain_id: u64,
    },
    RestoreReply(RestoreData),
    /// Ask the counterparty to run channel setup as leader
    SetupRequest {
        chain_id: u64,
        timeout: u64,
    },
    SetupOk {
        channel_address: Address,
    },
    /// Liveness signal; triggers queued-update drain on routers
    IsAlive {
        channel_address: Address,
        skip_check_in: bool,
    },
    RequestCollateral {
        channel_address: Address,
        asset_id: Address,
        #[serde(default, with = "crate::types::serde_amount_opt")]
        amount: Option<u128>,
    },
    /// Liveness probe
    Probe,
    /// Generic acknowledgment
    Ack,
}

/// An inbound message as delivered to a subscriber.
#[derive(Debug)]
pub struct InboundMessage {
    pub from: Identifier,
    pub reply_inbox: String,
    pub message: NodeMessage,
}

// =============================================================================
// In-Process Hub
// =============================================================================

type ReplySender = oneshot::Sender<Result<NodeMessage, EngineError>>;
type ReplyReceiver = oneshot::Receiver<Result<NodeMessage, EngineError>>;

#[derive(Default)]
struct HubState {
    subscribers: HashMap<Identifier, mpsc::UnboundedSender<InboundMessage>>,
    inboxes: HashMap<String, ReplySender>,
    /// Receivers for inboxes opened via `open_inbox`, awaiting pickup
    parked: HashMap<String, ReplyReceiver>,
    offline: HashSet<Identifier>,
}

/// Shared in-process message fabric. Every node connected to the same hub
/// can reach every other by identifier.
pub struct MessagingHub {
    state: Mutex<HubState>,
}

impl MessagingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(MessagingHub {
            state: Mutex::new(HubState::default()),
        })
    }

    /// Simulate a peer dropping off the transport (tests).
    pub fn set_offline(&self, identifier: &Identifier, offline: bool) {
        let mut state = self.state.lock().unwrap();
        if offline {
            state.offline.insert(*identifier);
        } else {
            state.offline.remove(identifier);
        }
    }

    pub fn is_online(&self, identifier: &Identifier) -> bool {
        let state = self.state.lock().unwrap();
        !state.offline.contains(identifier) && state.subscribers.contains_key(identifier)
    }

    fn register_inbox(&self, inbox: String, sender: ReplySender) {
        self.state.lock().unwrap().inboxes.insert(inbox, sender);
    }

    fn take_inbox(&self, inbox: &str) -> Option<ReplySender> {
        self.state.lock().unwrap().inboxes.remove(inbox)
    }

    fn deliver(&self, to: &Identifier, message: InboundMessage) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.offline.contains(to) {
            return false;
        }
        match state.subscribers.get(to) {
            Some(sender) => {
                if sender.send(message).is_ok() {
                    true
                } else {
                    state.subscribers.remove(to);
                    false
                }
            }
            None => false,
        }
    }
}

/// A node's handle on the hub.
#[derive(Clone)]
pub struct MemoryMessaging {
    hub: Arc<MessagingHub>,
}

impl MemoryMessaging {
    pub fn new(hub: Arc<MessagingHub>) -> Self {
        MemoryMessaging { hub }
    }

    pub fn hub(&self) -> &Arc<MessagingHub> {
        &self.hub
    }

    fn new_inbox() -> String {
        hex::encode(rand::random::<[u8; 16]>())
    }
}

#[async_trait]
impl Messaging for MemoryMessaging {
    async fn subscribe(
        &self,
        identifier: &Identifier,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .state
            .lock()
            .unwrap()
            .subscribers
            .insert(*identifier, tx);
        Ok(rx)
    }

    async fn request(
        &self,
        from: &Identifier,
        to: &Identifier,
        message: NodeMessage,
        timeout_ms: u64,
    ) -> Result<NodeMessage, EngineError> {
        let inbox = Self::new_inbox();
        let (tx, rx) = oneshot::channel();
        self.hub.register_inbox(inbox.clone(), tx);

        let delivered = self.hub.deliver(
            to,
            InboundMessage {
                from: *from,
                reply_inbox: inbox.clone(),
                message,
            },
        );
        if !delivered {
            self.hub.take_inbox(&inbox);
            return Err(EngineError::timeout(format!(
                "peer {} unreachable",
                to
            )));
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.hub.take_inbox(&inbox);
                Err(EngineError::external("reply inbox dropped"))
            }
            Err(_) => {
                self.hub.take_inbox(&inbox);
                Err(EngineError::timeout(format!(
                    "no reply from {} within {}ms",
                    to, timeout_ms
                )))
            }
        }
    }

    async fn respond(
        &self,
        reply_inbox: &str,
        response: Result<NodeMessage, EngineError>,
    ) -> Result<(), EngineError> {
        match self.hub.take_inbox(reply_inbox) {
            Some(sender) => {
                // the requester may have timed out and dropped the receiver
                let _ = sender.send(response);
            }
            None => {
                tracing::debug!(inbox = reply_inbox, "reply inbox already gone");
            }
        }
        Ok(())
    }

    async fn open_inbox(&self) -> Result<String, EngineError> {
        let inbox = Self::new_inbox();
        let (tx, rx) = oneshot::channel();
        let mut state = self.hub.state.lock().unwrap();
        state.inboxes.insert(inbox.clone(), tx);
        state.parked.insert(inbox.clone(), rx);
        Ok(inbox)
    }

    async fn await_inbox(
        &self,
        inbox: &str,
        timeout_ms: u64,
    ) -> Result<NodeMessage, EngineError> {
        let rx = self
            .hub
            .state
            .lock()
            .unwrap()
            .parked
            .remove(inbox)
            .ok_or_else(|| EngineError::external(format!("inbox {} not open", inbox)))?;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::external("inbox dropped")),
            Err(_) => {
                self.hub.take_inbox(inbox);
                Err(EngineError::timeout(format!(
                    "nothing arrived in inbox {} within {}ms",
                    inbox, timeout_ms
                )))
            }
        }
    }

    async fn probe(&self, _from: &Identifier, to: &Identifier) -> bool {
        self.hub.is_online(to)
    }
}

// =============================================================================
// Tests
// =============================================================================

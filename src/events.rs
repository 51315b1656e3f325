// =============================================================================
// MOONWIRE v1.1 - Engine Event Bus
// =============================================================================
//
// Typed multi-producer/multi-consumer event fanout with per-subscriber
// filters. The engine publishes after every persisted update; the forwarding
// engine and node layers subscribe for the kinds they care about. Event
// emission for a channel is ordered identically to update application.
//
// =============================================================================

use std::sync::RwLock;
use tokio::sync::mpsc;

use crate::types::{Address, Bytes32, ChannelState, Identifier, Transfer, Update};

// =============================================================================
// Events
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    ChannelUpdated,
    ConditionalTransferCreated,
    ConditionalTransferResolved,
    IsAlive,
    RestoreState,
    WithdrawalReconciled,
    CollateralRequested,
}

/// Everything the engine announces to the rest of the node.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A doubly-signed update was applied and persisted
    ChannelUpdated {
        channel: ChannelState,
        update: Update,
    },
    /// A conditional transfer became active on a channel
    ConditionalTransferCreated {
        channel: ChannelState,
        transfer: Transfer,
    },
    /// A conditional transfer was resolved and left the active set
    ConditionalTransferResolved {
        channel: ChannelState,
        transfer: Transfer,
    },
    /// A counterparty signaled liveness for a channel
    IsAlive {
        channel_address: Address,
        from: Identifier,
        skip_check_in: bool,
    },
    /// Local state was overwritten from a restore payload
    RestoreState { channel: ChannelState },
    /// A withdraw-definition transfer resolved; funds leave the channel
    WithdrawalReconciled {
        channel_address: Address,
        transfer_id: Bytes32,
        recipient: Address,
        asset_id: Address,
        amount: u128,
    },
    /// A counterparty asked for the channel to be collateralized
    CollateralRequested {
        channel_address: Address,
        asset_id: Address,
        amount: Option<u128>,
        from: Identifier,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::ChannelUpdated { .. } => EventKind::ChannelUpdated,
            EngineEvent::ConditionalTransferCreated { .. } => {
                EventKind::ConditionalTransferCreated
            }
            EngineEvent::ConditionalTransferResolved { .. } => {
                EventKind::ConditionalTransferResolved
            }
            EngineEvent::IsAlive { .. } => EventKind::IsAlive,
            EngineEvent::RestoreState { .. } => EventKind::RestoreState,
            EngineEvent::WithdrawalReconciled { .. } => EventKind::WithdrawalReconciled,
            EngineEvent::CollateralRequested { .. } => EventKind::CollateralRequested,
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

type Filter = Box<dyn Fn(&EngineEvent) -> bool + Send + Sync>;

struct Subscriber {
    filter: Filter,
    sender: mpsc::UnboundedSender<EngineEvent>,
}

/// Fanout bus. Publishing clones the event into every subscriber whose
/// filter matches; closed subscribers are dropped lazily.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.subscribe_filtered(Box::new(|_| true))
    }

    /// Subscribe to one event kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.subscribe_filtered(Box::new(move |event| event.kind() == kind))
    }

    /// Subscribe with an arbitrary filter.
    pub fn subscribe_filtered(&self, filter: Filter) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap()
            .push(Subscriber { filter, sender: tx });
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|s| {
            if (s.filter)(&event) {
                s.sender.send(event.clone()).is_ok()
            } else {
                !s.sender.is_closed()
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

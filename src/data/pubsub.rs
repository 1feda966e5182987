use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::data::series::Snapshot;
use crate::error::{DeliveryError, SerializationError};

/// Encoded payload shared by every subscriber of one broadcast.
pub type Payload = Arc<str>;

/// One connected viewer: an outbound queue drained by its connection task.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: Uuid,
    peer_addr: String,
    tx: mpsc::Sender<Payload>,
}

impl Subscriber {
    pub fn channel(peer_addr: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let subscriber = Self {
            id: Uuid::new_v4(),
            peer_addr: peer_addr.into(),
            tx,
        };
        (subscriber, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn deliver(&self, payload: &Payload) -> Result<(), DeliveryError> {
        self.tx.try_send(Arc::clone(payload)).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// The live set of viewers. Shared between connection tasks (register and
/// unregister) and the broadcaster (iteration).
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, subscriber: Subscriber) {
        let id = subscriber.id;
        let peer = subscriber.peer_addr.clone();
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, subscriber);
            subscribers.len()
        };
        info!("Registered subscriber {} from {} ({} active)", id, peer, count);
    }

    pub fn unregister(&self, id: Uuid) -> bool {
        let (removed, count) = {
            let mut subscribers = self.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            info!("Unregistered subscriber {} ({} active)", id, count);
        }
        removed
    }

    /// Runs `action` over a copy of the current membership, so callers may
    /// register or unregister (including from inside `action`) without deadlock.
    pub fn for_each<F>(&self, mut action: F)
    where
        F: FnMut(&Subscriber),
    {
        let members: Vec<Subscriber> = self.lock().values().cloned().collect();
        for subscriber in &members {
            action(subscriber);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub pruned: usize,
}

/// Serializes a snapshot once and fans the identical payload out to every
/// registered subscriber. A subscriber whose queue is closed or still full
/// from earlier updates is pruned; dropping its sender ends the connection.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }

    pub fn publish(&self, snapshot: &Snapshot) -> Result<PublishReport, SerializationError> {
        if self.registry.is_empty() {
            return Ok(PublishReport::default());
        }

        let payload: Payload = match snapshot.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Dropping broadcast: {}", e);
                return Err(e);
            }
        };

        let mut report = PublishReport::default();
        let mut failed = Vec::new();

        self.registry.for_each(|subscriber| match subscriber.deliver(&payload) {
            Ok(()) => report.delivered += 1,
            Err(DeliveryError::Full) => {
                warn!("Subscriber {} is lagging, dropping it", subscriber.peer_addr());
                failed.push(subscriber.id());
            }
            Err(DeliveryError::Closed) => failed.push(subscriber.id()),
        });

        for id in failed {
            if self.registry.unregister(id) {
                report.pruned += 1;
            }
        }

        debug!(
            "Broadcast {} assets: delivered={}, pruned={}",
            snapshot.asset_count(),
            report.delivered,
            report.pruned
        );
        Ok(report)
    }
}

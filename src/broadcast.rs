use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

pub type Payload = Arc<[u8]>;

/// Registry of live viewers. Publishing takes the read lock, so concurrent
/// publishers never wait on each other; add/remove take the write lock.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<Payload>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: mpsc::Sender<Payload>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, sink);
        debug!("Subscriber {} added.", id);
        id
    }

    /// Registers a fresh bounded channel and hands back its receiving end.
    pub fn subscribe(&self, capacity: usize) -> (Uuid, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity);
        (self.add(tx), rx)
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            debug!("Subscriber {} removed.", id);
        }
        removed
    }

    /// Best-effort fan-out. A full or closed sink is skipped, not dropped:
    /// only the subscriber's own receive loop unregisters it.
    pub fn publish(&self, payload: &[u8]) -> usize {
        let payload: Payload = Arc::from(payload);
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for (id, sink) in subscribers.iter() {
            match sink.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!("Skipping subscriber {}: {}", id, e),
            }
        }
        delivered
    }

    pub fn size(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

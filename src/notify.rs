use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Change;

const CHANNEL_CAPACITY: usize = 256;

/// A committed change as seen by subscribers of its event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub event_id: Ulid,
    pub change: Change,
}

impl Notice {
    /// JSON payload for LISTEN/NOTIFY.
    pub fn payload(&self) -> String {
        serde_json::to_string(&self.change).unwrap_or_default()
    }
}

/// Broadcast hub for change notices, one channel per event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, event_id: Ulid) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(event_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish committed changes. No-op if nobody is listening.
    pub fn publish(&self, changes: &[Change]) {
        for change in changes {
            let event_id = change.event_id();
            if let Some(sender) = self.channels.get(&event_id) {
                let _ = sender.send(Notice {
                    event_id,
                    change: change.clone(),
                });
            }
        }
    }

    /// Drop channels whose receivers are all gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

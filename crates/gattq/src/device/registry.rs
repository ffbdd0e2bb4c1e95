//! Notification registry
//!
//! Maps a characteristic UUID to its subscriber. Entries are added by a
//! successful EnableNotification task, removed by DisableNotification, and
//! the whole registry is cleared on disconnect. Value-changed events are
//! unsolicited and routed here without touching the operation queue.

use crate::device::task::NotifyCallback;
use crate::gatt::types::Uuid;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct NotificationRegistry {
    entries: HashMap<Uuid, Arc<dyn NotifyCallback>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        NotificationRegistry::default()
    }

    pub fn insert(&mut self, uuid: Uuid, callback: Arc<dyn NotifyCallback>) {
        self.entries.insert(uuid, callback);
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<Arc<dyn NotifyCallback>> {
        self.entries.remove(uuid)
    }

    /// Route one value-changed event to its subscriber, if any
    pub fn dispatch(&self, uuid: &Uuid, value: &[u8]) {
        match self.entries.get(uuid) {
            Some(callback) => callback.on_value(value),
            None => debug!("value change for {} with no subscriber", uuid),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

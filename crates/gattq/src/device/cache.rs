//! Handle cache
//!
//! Memoizes lookups of discovered services and characteristics by UUID so
//! repeated operations against the same attribute avoid re-walking the
//! attribute table. Cleared on every disconnect: handles belong to one
//! connection instance only.

use crate::gatt::types::{Characteristic, Service, Uuid};
use std::collections::HashMap;

#[derive(Default)]
pub(crate) struct HandleCache {
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
}

impl HandleCache {
    pub fn new() -> Self {
        HandleCache::default()
    }

    /// Look up a service by UUID, walking `table` on a miss
    pub fn service(&mut self, uuid: &Uuid, table: &[Service]) -> Option<Service> {
        if let Some(service) = self.services.get(uuid) {
            return Some(service.clone());
        }

        let service = table.iter().find(|s| &s.uuid == uuid)?.clone();
        self.services.insert(*uuid, service.clone());
        Some(service)
    }

    /// Look up a characteristic inside a service, walking `table` on a miss
    pub fn characteristic(
        &mut self,
        service_uuid: &Uuid,
        chara_uuid: &Uuid,
        table: &[Service],
    ) -> Option<Characteristic> {
        let key = (*service_uuid, *chara_uuid);
        if let Some(chara) = self.characteristics.get(&key) {
            return Some(chara.clone());
        }

        let service = self.service(service_uuid, table)?;
        let chara = service.characteristic(chara_uuid)?.clone();
        self.characteristics.insert(key, chara.clone());
        Some(chara)
    }

    pub fn clear(&mut self) {
        self.services.clear();
        self.characteristics.clear();
    }
}

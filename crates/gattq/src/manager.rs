//! Device manager
//!
//! Owns the peripheral map and the collaborators shared by every peripheral:
//! the transport, the radio availability probe and the scheduler thread. One
//! manager per application; peripherals are created on demand and live until
//! explicitly removed.

use crate::addr::BdAddr;
use crate::device::{ConnectionCallback, ConnectionState, Peripheral};
use crate::sched::Scheduler;
use crate::transport::{GattTransport, RadioAvailability};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct DeviceManager {
    transport: Arc<dyn GattTransport>,
    radio: Arc<dyn RadioAvailability>,
    sched: Scheduler,
    devices: Mutex<HashMap<BdAddr, Peripheral>>,
}

impl DeviceManager {
    pub fn new(transport: Arc<dyn GattTransport>, radio: Arc<dyn RadioAvailability>) -> Self {
        DeviceManager {
            transport,
            radio,
            sched: Scheduler::new(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Get the peripheral for `addr`, spawning its worker on first use
    pub fn device(&self, addr: BdAddr) -> Peripheral {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices
            .entry(addr)
            .or_insert_with(|| {
                debug!("creating peripheral {}", addr);
                Peripheral::spawn(
                    addr,
                    Arc::clone(&self.transport),
                    Arc::clone(&self.radio),
                    self.sched.clone(),
                )
            })
            .clone()
    }

    /// The peripheral for `addr`, if one has been created
    pub fn get(&self, addr: BdAddr) -> Option<Peripheral> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.get(&addr).cloned()
    }

    pub fn contains(&self, addr: BdAddr) -> bool {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.contains_key(&addr)
    }

    /// Stop the peripheral's worker and forget it
    pub fn remove(&self, addr: BdAddr) {
        let removed = {
            let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
            devices.remove(&addr)
        };
        if let Some(peripheral) = removed {
            peripheral.destroy();
        }
    }

    /// Connect to `addr`, creating the peripheral if needed
    pub fn connect(&self, addr: BdAddr, callback: impl ConnectionCallback + 'static) -> Peripheral {
        let peripheral = self.device(addr);
        peripheral.connect(callback);
        peripheral
    }

    pub fn disconnect(&self, addr: BdAddr) {
        if let Some(peripheral) = self.get(addr) {
            peripheral.disconnect();
        }
    }

    pub fn disconnect_all(&self) {
        for peripheral in self.devices() {
            peripheral.disconnect();
        }
    }

    /// Snapshot of every known peripheral
    pub fn devices(&self) -> Vec<Peripheral> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.values().cloned().collect()
    }

    /// Snapshot of the peripherals currently connected
    pub fn connected_devices(&self) -> Vec<Peripheral> {
        self.devices()
            .into_iter()
            .filter(Peripheral::is_connected)
            .collect()
    }

    pub fn state_of(&self, addr: BdAddr) -> ConnectionState {
        self.get(addr)
            .map(|p| p.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self, addr: BdAddr) -> bool {
        self.state_of(addr) == ConnectionState::Connected
    }

    pub fn mtu_of(&self, addr: BdAddr) -> Option<u16> {
        self.get(addr).map(|p| p.mtu())
    }

    /// Stop every worker and empty the map
    pub fn destroy(&self) {
        let drained: Vec<Peripheral> = {
            let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
            devices.drain().map(|(_, p)| p).collect()
        };
        for peripheral in drained {
            peripheral.destroy();
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

//! Per-peripheral engine
//!
//! A [`Peripheral`] is a cheap cloneable handle to one remote device's
//! dedicated worker thread. Every call is a message to that worker: protocol
//! operations are queued FIFO and executed one at a time, connection commands
//! drive the Disconnected / Connecting / Connected state machine. Completion
//! callbacks run on the worker thread.

pub(crate) mod cache;
pub(crate) mod registry;
pub mod task;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

use crate::addr::BdAddr;
use crate::error::GattError;
use crate::gatt::constants::ATT_DEFAULT_MTU;
use crate::gatt::types::{Characteristic, Service, Uuid};
use crate::sched::Scheduler;
use crate::transport::{GattTransport, Phy, RadioAvailability, WriteMode};
use log::warn;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use task::{GattTask, NotifyCallback, PhyValue, SplitWriteState, Target};
use worker::{Command, Msg, Worker};

pub use task::{
    MtuCallback, PhyCallback, ProgressCallback, ReadCallback, RssiCallback, WriteCallback,
};

/// Connection lifecycle of one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Observer of one peripheral's connection lifecycle.
///
/// `on_connected` fires only once attribute discovery has completed
/// successfully; `on_disconnected` fires on every teardown and reports
/// whether the teardown aborted a connection attempt. All calls happen on
/// the peripheral's worker thread.
pub trait ConnectionCallback: Send {
    fn on_connecting(&self);
    fn on_connect_failed(&self);
    fn on_connected(&self, services: &[Service]);
    fn on_disconnected(&self, was_connecting: bool);
}

/// Lock-free snapshot state readable without a round trip to the worker
pub(crate) struct Shared {
    state: AtomicU8,
    mtu: AtomicU16,
}

impl Shared {
    fn new() -> Self {
        Shared {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            mtu: AtomicU16::new(ATT_DEFAULT_MTU),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }
}

/// Handle to one remote peripheral's engine
#[derive(Clone)]
pub struct Peripheral {
    addr: BdAddr,
    tx: Sender<Msg>,
    shared: Arc<Shared>,
}

impl Peripheral {
    /// Start the dedicated worker thread and return its handle
    pub(crate) fn spawn(
        addr: BdAddr,
        transport: Arc<dyn GattTransport>,
        radio: Arc<dyn RadioAvailability>,
        sched: Scheduler,
    ) -> Peripheral {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::new());

        let event_tx = tx.clone();
        let events = crate::transport::EventSender::new(move |event| {
            // Events after destroy land on a closed channel and are dropped
            let _ = event_tx.send(Msg::Event(event));
        });

        let worker = Worker::new(
            addr,
            transport,
            radio,
            sched,
            Arc::clone(&shared),
            rx,
            events,
        );

        let spawned = thread::Builder::new()
            .name(format!("gattq-{}", addr))
            .spawn(move || worker.run());
        if let Err(err) = spawned {
            warn!("failed to spawn worker thread for {}: {}", addr, err);
        }

        Peripheral { addr, tx, shared }
    }

    pub fn addr(&self) -> BdAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Currently negotiated MTU; [`ATT_DEFAULT_MTU`] while disconnected
    pub fn mtu(&self) -> u16 {
        self.shared.mtu()
    }

    /// Start connecting, replacing any previously installed callback. If a
    /// connection attempt is already underway or established, the new
    /// callback is re-announced the current state instead.
    pub fn connect(&self, callback: impl ConnectionCallback + 'static) {
        let _ = self
            .tx
            .send(Msg::Command(Command::Connect(Box::new(callback))));
    }

    /// Tear the connection down, failing every queued operation
    pub fn disconnect(&self) {
        let _ = self.tx.send(Msg::Command(Command::Disconnect {
            destroy: false,
        }));
    }

    /// Disconnect and stop the worker thread; the handle is dead afterwards
    pub fn destroy(&self) {
        let _ = self
            .tx
            .send(Msg::Command(Command::Disconnect { destroy: true }));
    }

    pub fn read_characteristic(
        &self,
        target: Target,
        callback: impl FnOnce(Result<Vec<u8>, GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::ReadCharacteristic {
            target,
            callback: Some(Box::new(callback)),
        });
    }

    /// Write a value in one request. The mode is corrected at execution time
    /// if the characteristic does not support the requested one.
    pub fn write_characteristic(
        &self,
        target: Target,
        value: Vec<u8>,
        mode: WriteMode,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::WriteCharacteristic {
            target,
            value,
            mode,
            callback: Some(Box::new(callback)),
        });
    }

    /// Write a value split into `chunk_size`-byte chunks, pausing `interval`
    /// between chunks. With-response writes wait for each chunk's
    /// acknowledgement before the next chunk; without-response writes send
    /// every chunk regardless of failures and report the first failure after
    /// the last chunk completes. `progress` is called after every sent chunk.
    #[allow(clippy::too_many_arguments)]
    pub fn split_write_characteristic(
        &self,
        target: Target,
        value: &[u8],
        mode: WriteMode,
        chunk_size: usize,
        interval: Duration,
        progress: impl FnMut(usize, usize) + Send + 'static,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) {
        let acknowledged = mode == WriteMode::WithResponse;
        self.submit(GattTask::SplitWriteCharacteristic {
            target,
            mode,
            state: SplitWriteState::new(value, chunk_size, acknowledged, interval),
            progress: Box::new(progress),
            callback: Some(Box::new(callback)),
        });
    }

    pub fn read_descriptor(
        &self,
        target: Target,
        descriptor: Uuid,
        callback: impl FnOnce(Result<Vec<u8>, GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::ReadDescriptor {
            target,
            descriptor,
            resolved: None,
            callback: Some(Box::new(callback)),
        });
    }

    pub fn write_descriptor(
        &self,
        target: Target,
        descriptor: Uuid,
        value: Vec<u8>,
        callback: impl FnOnce(Result<(), GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::WriteDescriptor {
            target,
            descriptor,
            resolved: None,
            value,
            callback: Some(Box::new(callback)),
        });
    }

    /// Subscribe to value changes. The subscriber's `on_enabled` fires once
    /// the peripheral-side configuration write succeeds; `on_value` fires for
    /// every change until disabled or disconnected.
    pub fn enable_notifications(&self, target: Target, callback: impl NotifyCallback + 'static) {
        self.submit(GattTask::EnableNotification {
            target,
            cccd: None,
            callback: Arc::new(callback),
        });
    }

    pub fn disable_notifications(&self, target: Target) {
        self.submit(GattTask::DisableNotification {
            target,
            cccd: None,
            callback: None,
        });
    }

    pub fn request_mtu(
        &self,
        mtu: u16,
        callback: impl FnOnce(Result<u16, GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::UpdateMtu {
            mtu,
            callback: Some(Box::new(callback)),
        });
    }

    pub fn set_preferred_phy(
        &self,
        tx_phy: Phy,
        rx_phy: Phy,
        options: u8,
        callback: impl FnOnce(Result<PhyValue, GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::UpdatePhy {
            tx_phy,
            rx_phy,
            options,
            callback: Some(Box::new(callback)),
        });
    }

    pub fn read_phy(&self, callback: impl FnOnce(Result<PhyValue, GattError>) + Send + 'static) {
        self.submit(GattTask::ReadPhy {
            callback: Some(Box::new(callback)),
        });
    }

    pub fn read_signal_strength(
        &self,
        callback: impl FnOnce(Result<i16, GattError>) + Send + 'static,
    ) {
        self.submit(GattTask::ReadSignalStrength {
            callback: Some(Box::new(callback)),
        });
    }

    /// Look up a discovered service by UUID; `reply` runs on the worker
    pub fn service(&self, uuid: Uuid, reply: impl FnOnce(Option<Service>) + Send + 'static) {
        let _ = self.tx.send(Msg::Command(Command::GetService {
            uuid,
            reply: Box::new(reply),
        }));
    }

    /// Look up a discovered characteristic by UUID; `reply` runs on the worker
    pub fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        reply: impl FnOnce(Option<Characteristic>) + Send + 'static,
    ) {
        let _ = self.tx.send(Msg::Command(Command::GetCharacteristic {
            service,
            characteristic,
            reply: Box::new(reply),
        }));
    }

    /// Queue a task, failing it immediately if the worker is gone
    fn submit(&self, task: GattTask) {
        if let Err(SendError(msg)) = self.tx.send(Msg::Command(Command::Enqueue(task))) {
            if let Msg::Command(Command::Enqueue(task)) = msg {
                task.fail(GattError::NotConnected);
            }
        }
    }
}

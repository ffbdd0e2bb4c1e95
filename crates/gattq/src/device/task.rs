//! Operation tasks
//!
//! One [`GattTask`] describes one requested protocol operation: its target
//! attribute, payload, completion callback and, for split writes, the
//! in-flight progress state. Tasks are queued per peripheral and executed
//! strictly one at a time; the dispatcher matches completion events against
//! the variant of the task currently in flight.

use crate::error::GattError;
use crate::gatt::types::{Characteristic, Descriptor, Uuid};
use crate::transport::{GattStatus, Phy, WriteMode};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Single-shot completion for read operations
pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>, GattError>) + Send>;

/// Single-shot completion for write operations
pub type WriteCallback = Box<dyn FnOnce(Result<(), GattError>) + Send>;

/// Per-chunk progress report for split writes: (chunks sent, total chunks)
pub type ProgressCallback = Box<dyn FnMut(usize, usize) + Send>;

/// Single-shot completion for MTU negotiation, carrying the granted MTU
pub type MtuCallback = Box<dyn FnOnce(Result<u16, GattError>) + Send>;

/// Single-shot completion for PHY operations
pub type PhyCallback = Box<dyn FnOnce(Result<PhyValue, GattError>) + Send>;

/// Single-shot completion for signal strength reads
pub type RssiCallback = Box<dyn FnOnce(Result<i16, GattError>) + Send>;

/// PHY pair reported for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyValue {
    pub tx_phy: Phy,
    pub rx_phy: Phy,
}

/// Subscriber for characteristic value changes.
///
/// `on_enabled`/`on_disabled` report the outcome of the subscription
/// operations; `on_value` delivers every unsolicited value change while the
/// subscription is active. All calls happen on the peripheral's worker.
pub trait NotifyCallback: Send + Sync {
    fn on_enabled(&self);
    fn on_disabled(&self);
    fn on_value(&self, value: &[u8]);
}

/// Target attribute of an operation: either identified by UUID and resolved
/// through the handle cache at execution time, or a handle resolved earlier
/// in this same connection instance.
#[derive(Debug, Clone)]
pub enum Target {
    ByUuid { service: Uuid, characteristic: Uuid },
    Resolved(Characteristic),
}

impl Target {
    pub fn by_uuid(service: Uuid, characteristic: Uuid) -> Self {
        Target::ByUuid {
            service,
            characteristic,
        }
    }

    pub fn resolved(characteristic: Characteristic) -> Self {
        Target::Resolved(characteristic)
    }

    pub(crate) fn characteristic(&self) -> Option<&Characteristic> {
        match self {
            Target::Resolved(chara) => Some(chara),
            Target::ByUuid { .. } => None,
        }
    }
}

/// Mutable progress state of one split write
pub(crate) struct SplitWriteState {
    /// Chunks not yet handed to the transport
    pub chunks: VecDeque<Vec<u8>>,
    pub total: usize,
    /// Chunks whose initiation the transport accepted
    pub sent: usize,
    /// Chunks whose completion event arrived
    pub completed: usize,
    /// First failing completion status, latched for the final report
    pub failed_status: Option<GattStatus>,
    /// Acknowledged pacing: wait for each chunk's completion before the next
    pub acknowledged: bool,
    /// Pause between consecutive chunks
    pub interval: Duration,
}

impl SplitWriteState {
    pub fn new(value: &[u8], chunk_size: usize, acknowledged: bool, interval: Duration) -> Self {
        let chunks = split_chunks(value, chunk_size);
        let total = chunks.len();
        SplitWriteState {
            chunks,
            total,
            sent: 0,
            completed: 0,
            failed_status: None,
            acknowledged,
            interval,
        }
    }
}

/// Split a payload into fixed-size chunks; the last chunk carries the
/// remainder. An empty payload yields no chunks.
pub(crate) fn split_chunks(value: &[u8], chunk_size: usize) -> VecDeque<Vec<u8>> {
    let chunk_size = chunk_size.max(1);
    value.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

/// One requested operation, queued FIFO per peripheral
pub(crate) enum GattTask {
    ReadCharacteristic {
        target: Target,
        callback: Option<ReadCallback>,
    },
    WriteCharacteristic {
        target: Target,
        value: Vec<u8>,
        mode: WriteMode,
        callback: Option<WriteCallback>,
    },
    SplitWriteCharacteristic {
        target: Target,
        mode: WriteMode,
        state: SplitWriteState,
        progress: ProgressCallback,
        callback: Option<WriteCallback>,
    },
    ReadDescriptor {
        target: Target,
        descriptor: Uuid,
        resolved: Option<Descriptor>,
        callback: Option<ReadCallback>,
    },
    WriteDescriptor {
        target: Target,
        descriptor: Uuid,
        resolved: Option<Descriptor>,
        value: Vec<u8>,
        callback: Option<WriteCallback>,
    },
    EnableNotification {
        target: Target,
        cccd: Option<Descriptor>,
        callback: Arc<dyn NotifyCallback>,
    },
    DisableNotification {
        target: Target,
        cccd: Option<Descriptor>,
        /// Subscriber removed from the registry at execution time, kept
        /// around so completion can signal it
        callback: Option<Arc<dyn NotifyCallback>>,
    },
    UpdateMtu {
        mtu: u16,
        callback: Option<MtuCallback>,
    },
    UpdatePhy {
        tx_phy: Phy,
        rx_phy: Phy,
        options: u8,
        callback: Option<PhyCallback>,
    },
    ReadPhy {
        callback: Option<PhyCallback>,
    },
    ReadSignalStrength {
        callback: Option<RssiCallback>,
    },
}

impl GattTask {
    /// Task kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            GattTask::ReadCharacteristic { .. } => "ReadCharacteristic",
            GattTask::WriteCharacteristic { .. } => "WriteCharacteristic",
            GattTask::SplitWriteCharacteristic { .. } => "SplitWriteCharacteristic",
            GattTask::ReadDescriptor { .. } => "ReadDescriptor",
            GattTask::WriteDescriptor { .. } => "WriteDescriptor",
            GattTask::EnableNotification { .. } => "EnableNotification",
            GattTask::DisableNotification { .. } => "DisableNotification",
            GattTask::UpdateMtu { .. } => "UpdateMtu",
            GattTask::UpdatePhy { .. } => "UpdatePhy",
            GattTask::ReadPhy { .. } => "ReadPhy",
            GattTask::ReadSignalStrength { .. } => "ReadSignalStrength",
        }
    }

    /// Deliver a terminal failure to the task's own callback and consume the
    /// task. Notification tasks signal "disabled", matching their surface.
    pub fn fail(self, err: GattError) {
        match self {
            GattTask::ReadCharacteristic { callback, .. }
            | GattTask::ReadDescriptor { callback, .. } => {
                if let Some(cb) = callback {
                    cb(Err(err));
                }
            }
            GattTask::WriteCharacteristic { callback, .. }
            | GattTask::SplitWriteCharacteristic { callback, .. }
            | GattTask::WriteDescriptor { callback, .. } => {
                if let Some(cb) = callback {
                    cb(Err(err));
                }
            }
            GattTask::EnableNotification { callback, .. } => {
                callback.on_disabled();
            }
            GattTask::DisableNotification { callback, .. } => {
                if let Some(cb) = callback {
                    cb.on_disabled();
                }
            }
            GattTask::UpdateMtu { callback, .. } => {
                if let Some(cb) = callback {
                    cb(Err(err));
                }
            }
            GattTask::UpdatePhy { callback, .. } | GattTask::ReadPhy { callback, .. } => {
                if let Some(cb) = callback {
                    cb(Err(err));
                }
            }
            GattTask::ReadSignalStrength { callback, .. } => {
                if let Some(cb) = callback {
                    cb(Err(err));
                }
            }
        }
    }
}

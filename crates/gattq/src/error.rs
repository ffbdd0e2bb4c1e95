//! Error types for the gattq library
//!
//! One terminal error kind per way a queued operation can fail. Errors are
//! delivered through the failing operation's own callback, never to anyone
//! else (see the propagation rules on [`crate::device::Peripheral`]).

use crate::transport::GattStatus;
use thiserror::Error;

/// Ways a GATT operation can terminally fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GattError {
    /// The operation was requested with no open link
    #[error("device not connected")]
    NotConnected,

    /// The target service, characteristic or descriptor is absent from the
    /// discovered attribute table
    #[error("attribute not found")]
    AttributeNotFound,

    /// The attribute exists but lacks the required property, e.g. a write
    /// was requested on a read-only characteristic
    #[error("attribute lacks the required capability")]
    CapabilityMissing,

    /// The transport kept rejecting initiation until the retry ceiling was
    /// reached. Transient busy rejections below the ceiling are retried
    /// internally and never surface.
    #[error("transport busy, gave up after {attempts} initiation attempts")]
    Busy { attempts: u32 },

    /// The asynchronous completion event carried a non-success status
    #[error("transport reported failure status {0}")]
    TransportFailure(GattStatus),

    /// The link dropped while the operation was queued or in flight
    #[error("disconnected while the operation was outstanding")]
    Disconnected,
}

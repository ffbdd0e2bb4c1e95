//! gattq - a client-side GATT operation engine
//!
//! This library drives GATT client traffic against remote BLE peripherals on
//! top of a caller-supplied transport. Each peripheral gets a dedicated
//! worker thread running a connection state machine and a FIFO operation
//! queue: at most one protocol request is outstanding per link, busy
//! transports are retried on a timer, long writes are split into paced
//! chunks, and value-change subscriptions are routed to their callbacks.

pub mod addr;
pub mod device;
pub mod error;
pub mod gatt;
pub mod manager;
mod sched;
pub mod transport;

// Re-export common types for convenience
pub use addr::BdAddr;
pub use device::task::{NotifyCallback, PhyValue, Target};
pub use device::{ConnectionCallback, ConnectionState, Peripheral};
pub use error::GattError;
pub use gatt::constants::ATT_DEFAULT_MTU;
pub use gatt::types::{Characteristic, CharacteristicProperties, Descriptor, Service, Uuid};
pub use manager::DeviceManager;
pub use transport::{
    AlwaysPowered, EventSender, GattStatus, GattTransport, Initiation, LinkHandle, Phy,
    RadioAvailability, TransportEvent, WriteMode,
};

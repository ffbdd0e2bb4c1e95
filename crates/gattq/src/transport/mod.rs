//! Transport boundary
//!
//! The engine never touches a radio itself. A caller-supplied
//! [`GattTransport`] opens links and executes the GATT primitives; every
//! primitive either accepts or rejects *initiation* immediately and, when
//! accepted, later delivers exactly one [`TransportEvent`] completion through
//! the [`EventSender`] handed over at `open_link`. A [`RadioAvailability`]
//! collaborator answers whether the local adapter is powered.

use crate::addr::BdAddr;
use crate::error::GattError;
use crate::gatt::types::{Characteristic, Descriptor, Service, Uuid};
use std::fmt;
use std::sync::Arc;

/// Opaque reference to one open link, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHandle(pub u16);

/// Completion status carried by transport events. Zero is success; any other
/// value is stack specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// Generic failure (the Android stack's GATT_FAILURE)
    pub const FAILURE: GattStatus = GattStatus(0x85);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Immediate outcome of asking the transport to start a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// The request was started; a completion event will follow
    Accepted,
    /// The stack cannot take a request right now; try again shortly
    Busy,
}

/// How a characteristic write is acknowledged at the protocol level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Radio PHY used for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Asynchronous events a transport delivers for one link
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link came up; attribute discovery may be requested
    LinkEstablished,
    /// The link dropped, whether requested or not
    LinkLost,
    /// Attribute discovery finished
    DiscoveryComplete {
        status: GattStatus,
        services: Vec<Service>,
    },
    /// The peripheral signalled that its attribute table changed
    ServiceChanged,
    /// A characteristic read finished
    CharacteristicRead { status: GattStatus, value: Vec<u8> },
    /// A characteristic write finished
    CharacteristicWrite { status: GattStatus },
    /// A descriptor read finished
    DescriptorRead { status: GattStatus, value: Vec<u8> },
    /// A descriptor write finished
    DescriptorWrite { status: GattStatus },
    /// MTU negotiation finished
    MtuChanged { status: GattStatus, mtu: u16 },
    /// A requested PHY change finished
    PhyUpdated {
        status: GattStatus,
        tx_phy: Phy,
        rx_phy: Phy,
    },
    /// A PHY read finished
    PhyRead {
        status: GattStatus,
        tx_phy: Phy,
        rx_phy: Phy,
    },
    /// A signal strength read finished
    SignalStrength { status: GattStatus, rssi: i16 },
    /// Unsolicited value change for a subscribed characteristic
    ValueChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Channel the transport uses to deliver events for one link.
///
/// Cloneable and callable from any thread; delivery after the owning
/// peripheral worker has been destroyed is silently dropped.
#[derive(Clone)]
pub struct EventSender(Arc<dyn Fn(TransportEvent) + Send + Sync>);

impl EventSender {
    pub(crate) fn new<F>(deliver: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        EventSender(Arc::new(deliver))
    }

    /// Deliver one event to the link's owning worker
    pub fn deliver(&self, event: TransportEvent) {
        (self.0)(event);
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").finish()
    }
}

/// The GATT primitives the engine drives.
///
/// Calls may arrive from the peripheral's worker thread or, for
/// `discover_attributes`, from the shared scheduler thread. Calls against a
/// link that has already been closed must be ignored, not panic.
pub trait GattTransport: Send + Sync {
    /// Open a link to the peripheral. Events for the link are delivered
    /// through `events` until `close` is called.
    fn open_link(&self, addr: BdAddr, events: EventSender) -> Result<LinkHandle, GattError>;

    /// Release the link. No further events may be delivered for it.
    fn close(&self, link: LinkHandle);

    /// Walk the peripheral's attribute table. Completion is
    /// [`TransportEvent::DiscoveryComplete`].
    fn discover_attributes(&self, link: LinkHandle) -> Initiation;

    fn read_characteristic(&self, link: LinkHandle, characteristic: &Characteristic) -> Initiation;

    fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: &Characteristic,
        value: &[u8],
        mode: WriteMode,
    ) -> Initiation;

    fn read_descriptor(&self, link: LinkHandle, descriptor: &Descriptor) -> Initiation;

    fn write_descriptor(&self, link: LinkHandle, descriptor: &Descriptor, value: &[u8])
        -> Initiation;

    /// Flip the stack-local "route value changes for this characteristic"
    /// flag. Synchronous; returns false if the stack refused.
    fn set_notification_enabled(
        &self,
        link: LinkHandle,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> bool;

    fn request_mtu(&self, link: LinkHandle, mtu: u16) -> Initiation;

    fn set_preferred_phy(
        &self,
        link: LinkHandle,
        tx_phy: Phy,
        rx_phy: Phy,
        options: u8,
    ) -> Initiation;

    fn read_phy(&self, link: LinkHandle) -> Initiation;

    fn read_signal_strength(&self, link: LinkHandle) -> Initiation;
}

/// Local adapter availability
pub trait RadioAvailability: Send + Sync {
    /// Is the local radio currently powered on?
    fn is_powered(&self) -> bool;

    /// Ask the platform to power the radio on. Returns false if powering on
    /// could not even be requested.
    fn request_power_on(&self) -> bool;
}

/// Radio collaborator for platforms where the adapter is always up
pub struct AlwaysPowered;

impl RadioAvailability for AlwaysPowered {
    fn is_powered(&self) -> bool {
        true
    }

    fn request_power_on(&self) -> bool {
        true
    }
}

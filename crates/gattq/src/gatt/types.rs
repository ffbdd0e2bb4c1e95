//! Common types for GATT attributes
//!
//! The attribute table is delivered by the transport after discovery and is
//! only valid for the connection instance that discovered it.

use bitflags::bitflags;
use std::fmt;

/// UUID for GATT attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uuid {
    /// 16-bit UUID
    Uuid16(u16),
    /// 32-bit UUID
    Uuid32(u32),
    /// 128-bit UUID (full UUID)
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Convert raw bytes to UUID based on length
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => {
                let uuid = u16::from_le_bytes([bytes[0], bytes[1]]);
                Some(Uuid::Uuid16(uuid))
            }
            4 => {
                let uuid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Some(Uuid::Uuid32(uuid))
            }
            16 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(bytes);
                Some(Uuid::Uuid128(uuid))
            }
            _ => None,
        }
    }

    /// Create a UUID from a 16-bit value
    pub fn from_u16(uuid: u16) -> Self {
        Uuid::Uuid16(uuid)
    }

    /// Create a UUID from a 32-bit value
    pub fn from_u32(uuid: u32) -> Self {
        Uuid::Uuid32(uuid)
    }

    /// Create a UUID from a 128-bit value
    pub fn from_u128(uuid: u128) -> Self {
        Uuid::Uuid128(uuid.to_le_bytes())
    }

    /// Get the bytes representation of this UUID
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Uuid::Uuid16(uuid) => uuid.to_le_bytes().to_vec(),
            Uuid::Uuid32(uuid) => uuid.to_le_bytes().to_vec(),
            Uuid::Uuid128(uuid) => uuid.to_vec(),
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uuid::Uuid16(uuid) => write!(f, "{:04x}", uuid),
            Uuid::Uuid32(uuid) => write!(f, "{:08x}", uuid),
            Uuid::Uuid128(uuid) => {
                write!(
                    f,
                    "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                    uuid[15], uuid[14], uuid[13], uuid[12],
                    uuid[11], uuid[10],
                    uuid[9], uuid[8],
                    uuid[7], uuid[6],
                    uuid[5], uuid[4], uuid[3], uuid[2], uuid[1], uuid[0]
                )
            }
        }
    }
}

bitflags! {
    /// Characteristic properties as defined in the Bluetooth specification
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_write_without_response(&self) -> bool {
        self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn can_indicate(&self) -> bool {
        self.contains(Self::INDICATE)
    }
}

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    /// Service UUID
    pub uuid: Uuid,
    /// Whether this is a primary or secondary service
    pub is_primary: bool,
    /// Start handle for this service
    pub start_handle: u16,
    /// End handle for this service
    pub end_handle: u16,
    /// Characteristics contained in this service
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Find a characteristic of this service by UUID
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// A discovered GATT characteristic
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Declaration handle
    pub declaration_handle: u16,
    /// Value handle
    pub value_handle: u16,
    /// Characteristic properties
    pub properties: CharacteristicProperties,
    /// Descriptors attached to this characteristic
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Find a descriptor of this characteristic by UUID
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| &d.uuid == uuid)
    }
}

/// A discovered GATT descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Descriptor UUID
    pub uuid: Uuid,
    /// Attribute handle
    pub handle: u16,
}

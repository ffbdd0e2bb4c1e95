//! GATT (Generic Attribute Profile) data model
//!
//! Types describing the attribute table a peripheral exposes, plus the
//! protocol constants the engine needs.

pub mod constants;
pub mod types;

pub use types::{Characteristic, CharacteristicProperties, Descriptor, Service, Uuid};

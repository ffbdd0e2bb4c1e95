//! GATT protocol constants and engine tunables

use std::time::Duration;

/// Default ATT MTU negotiated at link setup (link-layer default)
pub const ATT_DEFAULT_MTU: u16 = 23;

/// Client Characteristic Configuration descriptor UUID
pub const CLIENT_CHAR_CONFIG_UUID: u16 = 0x2902;

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Maximum initiation attempts for one request while the transport keeps
/// answering busy. Reached means the task fails with [`crate::GattError::Busy`].
pub const BUSY_RETRY_LIMIT: u32 = 50;

/// Delay between two initiation attempts after a busy rejection
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Settle delay between powering the radio on and requesting the link.
/// Adapters need a moment after power-on; an immediate link request fails.
pub const RADIO_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Settle delay between link establishment and the discovery request.
/// Slower or bonded peripherals will not answer discovery reliably sooner.
pub const DISCOVERY_SETTLE_DELAY: Duration = Duration::from_millis(300);

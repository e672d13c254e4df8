//! Application-wide constants and compile-time configuration.
//!
//! Timing parameters, table sizes and protocol constants live here so they
//! can be tuned in one place.  Behaviour that tests need to override is
//! collected in [`CentralConfig`].

// BLE

/// BLE connection interval range (in 1.25 ms units).
/// 6 = 7.5 ms (lowest latency for HID).
pub const BLE_CONN_INTERVAL_MIN: u16 = 6;
pub const BLE_CONN_INTERVAL_MAX: u16 = 12;

/// BLE slave latency (number of connection events the peripheral can skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// BLE supervision timeout (in 10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

/// Give up on a connection attempt after this long (in 10 ms units). 500 = 5 s.
pub const BLE_CONNECT_TIMEOUT: u16 = 500;

/// ATT MTU requested on every new link.
pub const BLE_ATT_MTU: u16 = 247;

/// Simultaneous links: the primary peripheral plus two accessory arms.
pub const MAX_CONNECTIONS: usize = 3;

/// Addresses tracked while their advertisement fragments accumulate.
pub const QUALIFICATION_POOL_SIZE: usize = 4;

/// Names remembered from fragments that did not qualify on their own.
pub const NAME_CACHE_SIZE: usize = 8;

/// How long an "additional device" pairing scan stays active.
pub const ADDITIONAL_SCAN_TIMEOUT_MS: u64 = 10_000;

/// Grace period during which a bonded peer is preferred over a new one.
pub const BONDED_PREFERENCE_WINDOW_MS: u64 = 3_000;

/// Interval between RSSI requests on a connected link.
pub const RSSI_POLL_INTERVAL_MS: u64 = 1_000;

/// Connect to glasses-style accessory arms in addition to the primary.
pub const ACCESSORY_SUPPORT: bool = true;

/// Length of the fallback display name: the last four address octets.
pub const ADDRESS_NAME_LEN: usize = 11;

// USB

/// USB VID/PID - use the "pid.codes" open-source test VID.
/// Replace with your own allocated VID/PID for production.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0001;

/// USB device strings.
pub const USB_MANUFACTURER: &str = "mouthpad-usb";
pub const USB_PRODUCT: &str = "MouthPad USB Bridge";
pub const USB_SERIAL_NUMBER: &str = "000001";

/// USB HID polling interval (ms). 1 ms = 1000 Hz for lowest latency.
pub const USB_HID_POLL_MS: u8 = 1;

/// Largest HID input report written to USB, report ID included.
pub const MAX_USB_REPORT_LEN: usize = 16;

/// Release-all burst: rounds, gap between reports, gap between rounds.
pub const RELEASE_ALL_ROUNDS: usize = 3;
pub const RELEASE_REPORT_GAP_MS: u64 = 10;
pub const RELEASE_ROUND_GAP_MS: u64 = 20;

/// Time the host gets to configure the device before the watchdog acts.
pub const USB_ENUM_TIMEOUT_MS: u64 = 2_000;

/// Full device resets attempted for a failed enumeration before giving up.
pub const USB_ENUM_MAX_RETRIES: u8 = 3;

// Serial framing

/// Largest payload carried by one CDC frame.
pub const FRAME_MAX_PAYLOAD: usize = 512;

/// Magic + length + CRC bytes wrapped around each payload.
pub const FRAME_OVERHEAD: usize = 6;

// Paired-device storage

/// Maximum number of paired devices tracked in storage.
pub const MAX_PAIRED_DEVICES: usize = 4;

/// Longest display name kept for a bonded device.
pub const BOND_NAME_MAX: usize = 31;

/// Flash page index where pairing storage starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for pairing storage.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

/// Runtime-tunable behaviour of the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CentralConfig {
    pub accessory_support: bool,
    pub additional_scan_timeout_ms: u64,
    pub bonded_preference_window_ms: u64,
    pub rssi_poll_interval_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            accessory_support: ACCESSORY_SUPPORT,
            additional_scan_timeout_ms: ADDITIONAL_SCAN_TIMEOUT_MS,
            bonded_preference_window_ms: BONDED_PREFERENCE_WINDOW_MS,
            rssi_poll_interval_ms: RSSI_POLL_INTERVAL_MS,
        }
    }
}

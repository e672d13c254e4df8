//! Unified error type for mouthpad-usb.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (behind the `defmt` feature) for efficient
//! on-target logging.

/// Top-level error type used across the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // BLE
    /// The radio stack rejected or failed a request.
    Ble(BleError),

    // Serial framing
    /// A CDC frame could not be encoded.
    Frame(FrameError),

    /// A host message inside a frame could not be understood.
    Relay(RelayError),

    // USB
    /// USB stack returned an error.
    Usb(UsbError),

    // Storage
    /// Flash read/write/erase failed.
    Storage,

    /// Bond table operation failed.
    Registry(RegistryError),

    // Generic
    /// Buffer too small for the requested operation.
    BufferOverflow,

    /// Operation timed out.
    Timeout,
}

/// Subset of BLE errors we propagate (keeps the enum `Copy`-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleError {
    /// GAP / GATT raw error code from the SoftDevice.
    Raw(u32),
    /// Scan was cancelled or could not start.
    ScanFailed,
    /// Connection attempt failed.
    ConnectFailed,
    /// Encryption or pairing could not be started or failed.
    SecurityFailed,
    /// GATT discovery could not be started.
    DiscoveryFailed,
    /// Characteristic subscribe/notify failed.
    NotifyFailed,
    /// RSSI could not be sampled.
    RssiFailed,
    /// The handle does not name a live link.
    NotConnected,
    /// All connection slots are in use.
    NoFreeSlot,
    /// The radio request queue is full.
    Busy,
}

/// Errors raised while building CDC frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Payload is longer than the maximum frame payload.
    PayloadTooLarge,
    /// Output buffer cannot hold the encoded frame.
    BufferTooSmall,
}

/// Errors raised while decoding host messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RelayError {
    /// Frame payload was empty.
    Empty,
    /// Leading variant byte not understood by this firmware.
    UnknownTag(u8),
    /// Variant known, body failed to decode or had trailing bytes.
    Malformed,
}

/// Errors raised when handing reports or bytes to the USB endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Endpoint not configured by the host yet.
    NotReady,
    /// The outbound queue is full.
    QueueFull,
    /// The endpoint write failed.
    WriteFailed,
}

/// Errors raised by the bonded-device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistryError {
    /// Slot index outside the table.
    InvalidSlot,
    /// A persisted record could not be decoded.
    Corrupt,
}

// Convenience conversions

impl From<BleError> for Error {
    fn from(e: BleError) -> Self {
        Error::Ble(e)
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Frame(e)
    }
}

impl From<RelayError> for Error {
    fn from(e: RelayError) -> Self {
        Error::Relay(e)
    }
}

impl From<UsbError> for Error {
    fn from(e: UsbError) -> Self {
        Error::Usb(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

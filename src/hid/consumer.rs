//! Consumer Control HID support - media keys, volume, etc.
//!
//! Consumer Control is a separate HID usage page (0x0C).  The USB side
//! carries one 16-bit usage code per report (ID 3).  Older peripheral
//! firmware sends a 1-byte bitmap instead, one bit per action; those
//! notifications are translated with [`legacy_bitmap_usage`].

/// Report ID for consumer control.
pub const CONSUMER_REPORT_ID: u8 = 3;

/// Consumer report size in bytes, report ID included.
pub const CONSUMER_REPORT_SIZE: usize = 3;

/// Payload length of the legacy bitmap format.
pub const LEGACY_BITMAP_LEN: usize = 1;

/// Consumer control usage codes known to the bridge (Usage Page 0x0C).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ConsumerUsage {
    /// Play/Pause toggle.
    PlayPause = 0x00CD,
    /// AL Consumer Control Configuration (media player).
    MediaConfig = 0x0183,
    /// Scan next track.
    NextTrack = 0x00B5,
    /// Scan previous track.
    PrevTrack = 0x00B6,
    /// Volume down.
    VolumeDown = 0x00EA,
    /// Volume up.
    VolumeUp = 0x00E9,
    /// AC Forward.
    BrowserForward = 0x0225,
    /// AC Back.
    BrowserBack = 0x0224,
}

impl ConsumerUsage {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// Legacy bitmap bit → usage, indexed by bit number.
pub const LEGACY_USAGES: [ConsumerUsage; 8] = [
    ConsumerUsage::PlayPause,
    ConsumerUsage::MediaConfig,
    ConsumerUsage::NextTrack,
    ConsumerUsage::PrevTrack,
    ConsumerUsage::VolumeDown,
    ConsumerUsage::VolumeUp,
    ConsumerUsage::BrowserForward,
    ConsumerUsage::BrowserBack,
];

/// Usage for a legacy bitmap.
///
/// Only the lowest set bit is translated: the 16-bit format carries a single
/// usage, so the first action wins.  `0x00` means all keys released.
pub fn legacy_bitmap_usage(bitmap: u8) -> Option<ConsumerUsage> {
    if bitmap == 0 {
        return None;
    }
    LEGACY_USAGES.get(bitmap.trailing_zeros() as usize).copied()
}

/// Consumer Control HID report (ID 3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConsumerReport {
    /// Active consumer control usage, 0 when released.
    pub usage: u16,
}

impl ConsumerReport {
    /// Create an empty (no keys pressed) report.
    pub const fn released() -> Self {
        Self { usage: 0 }
    }

    /// Create a report with a single usage.
    pub const fn new(usage: ConsumerUsage) -> Self {
        Self {
            usage: usage as u16,
        }
    }

    /// Translate a legacy 1-byte bitmap payload.
    pub fn from_legacy_bitmap(bitmap: u8) -> Self {
        Self {
            usage: legacy_bitmap_usage(bitmap).map_or(0, ConsumerUsage::code),
        }
    }

    /// Serialize to USB HID report bytes (little-endian usage).
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < CONSUMER_REPORT_SIZE {
            return 0;
        }
        let bytes = self.usage.to_le_bytes();
        buf[0] = CONSUMER_REPORT_ID;
        buf[1] = bytes[0];
        buf[2] = bytes[1];
        CONSUMER_REPORT_SIZE
    }

    /// Check if any key is pressed.
    pub fn is_released(&self) -> bool {
        self.usage == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bitmap_has_no_usage() {
        assert_eq!(legacy_bitmap_usage(0x00), None);
        assert!(ConsumerReport::from_legacy_bitmap(0x00).is_released());
    }

    #[test]
    fn bit_two_is_next_track() {
        assert_eq!(legacy_bitmap_usage(0x04), Some(ConsumerUsage::NextTrack));
        assert_eq!(ConsumerReport::from_legacy_bitmap(0x04).usage, 0x00B5);
    }

    #[test]
    fn lowest_set_bit_wins() {
        // bits 1, 5 and 7 set
        assert_eq!(legacy_bitmap_usage(0b1010_0010), Some(ConsumerUsage::MediaConfig));
        assert_eq!(legacy_bitmap_usage(0xFF), Some(ConsumerUsage::PlayPause));
        assert_eq!(legacy_bitmap_usage(0x80), Some(ConsumerUsage::BrowserBack));
    }

    #[test]
    fn every_single_bit_maps_to_table_entry() {
        let expected = [0x00CD, 0x0183, 0x00B5, 0x00B6, 0x00EA, 0x00E9, 0x0225, 0x0224];
        for (bit, code) in expected.iter().enumerate() {
            let usage = legacy_bitmap_usage(1 << bit).unwrap();
            assert_eq!(usage.code(), *code, "bit {}", bit);
        }
    }

    #[test]
    fn serialize_prefixes_report_id() {
        let report = ConsumerReport::new(ConsumerUsage::PlayPause);
        let mut buf = [0u8; 3];
        assert_eq!(report.serialize(&mut buf), 3);
        assert_eq!(buf, [0x03, 0xCD, 0x00]); // Little-endian 0x00CD
    }

    #[test]
    fn serialize_buffer_too_small() {
        let mut buf = [0u8; 2];
        assert_eq!(ConsumerReport::released().serialize(&mut buf), 0);
    }
}

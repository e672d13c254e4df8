//! Pointer reports: buttons/wheel (report ID 1) and 12-bit motion (ID 2).
//!
//! USB layout, report ID included:
//! ```text
//! ID 1: [0x01] [buttons: 5 bits + 3 pad] [wheel: i8] [AC pan: i8]
//! ID 2: [0x02] [X 7:0] [Y 3:0 | X 11:8] [Y 11:4]
//! ```
//! Report 2 holds two consecutive 12-bit fields, packed little-endian as
//! the report descriptor declares them.

/// Report ID for buttons, wheel and horizontal pan.
pub const BUTTONS_REPORT_ID: u8 = 1;

/// Report ID for X/Y motion.
pub const MOTION_REPORT_ID: u8 = 2;

/// Buttons report size in bytes, report ID included.
pub const BUTTONS_REPORT_SIZE: usize = 4;

/// Motion report size in bytes, report ID included.
pub const MOTION_REPORT_SIZE: usize = 4;

/// Largest magnitude of a 12-bit motion axis.
pub const MOTION_LIMIT: i16 = 2047;

/// Buttons a boot-protocol mouse may report (left, right, middle).
pub const BOOT_BUTTON_MASK: u8 = 0x07;

/// Buttons the USB descriptor declares (five).
pub const BUTTON_MASK: u8 = 0x1F;

/// Buttons, wheel and pan (report ID 1).
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ButtonsReport {
    /// Button bitfield (bit 0 = left, bit 1 = right, bit 2 = middle, ...).
    pub buttons: u8,
    /// Scroll wheel delta (signed).
    pub wheel: i8,
    /// Horizontal pan delta (signed).
    pub pan: i8,
}

impl ButtonsReport {
    /// Nothing pressed, nothing scrolling.
    pub const fn released() -> Self {
        Self {
            buttons: 0,
            wheel: 0,
            pan: 0,
        }
    }

    /// Serialise into a byte slice for USB HID transmission.
    /// Returns the number of bytes written, or 0 if `buf` is too small.
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < BUTTONS_REPORT_SIZE {
            return 0;
        }
        buf[0] = BUTTONS_REPORT_ID;
        buf[1] = self.buttons & BUTTON_MASK;
        buf[2] = self.wheel as u8;
        buf[3] = self.pan as u8;
        BUTTONS_REPORT_SIZE
    }
}

/// X/Y displacement (report ID 2), each axis 12-bit signed.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotionReport {
    pub x: i16,
    pub y: i16,
}

impl MotionReport {
    /// Build a report, clamping both axes to the 12-bit range.
    pub fn new(x: i16, y: i16) -> Self {
        Self {
            x: x.clamp(-MOTION_LIMIT, MOTION_LIMIT),
            y: y.clamp(-MOTION_LIMIT, MOTION_LIMIT),
        }
    }

    /// Pack both axes into the three payload bytes.
    pub fn pack(&self) -> [u8; 3] {
        let x = (self.x as u16) & 0x0FFF;
        let y = (self.y as u16) & 0x0FFF;
        [
            (x & 0xFF) as u8,
            ((x >> 8) as u8 & 0x0F) | (((y & 0x0F) as u8) << 4),
            (y >> 4) as u8,
        ]
    }

    /// Unpack three payload bytes, sign-extending each 12-bit axis.
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        let x = (data[0] as u16) | (((data[1] & 0x0F) as u16) << 8);
        let y = ((data[1] >> 4) as u16) | ((data[2] as u16) << 4);
        Some(Self {
            x: sign_extend_12(x),
            y: sign_extend_12(y),
        })
    }

    /// Serialise into a byte slice for USB HID transmission.
    /// Returns the number of bytes written, or 0 if `buf` is too small.
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < MOTION_REPORT_SIZE {
            return 0;
        }
        buf[0] = MOTION_REPORT_ID;
        buf[1..MOTION_REPORT_SIZE].copy_from_slice(&self.pack());
        MOTION_REPORT_SIZE
    }

    pub fn is_idle(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

fn sign_extend_12(v: u16) -> i16 {
    ((v << 4) as i16) >> 4
}

/// Boot-protocol mouse notification (no report ID).
///
/// Layout: `[buttons] [x: i8] [y: i8] ([wheel: i8])`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootMouseReport {
    pub buttons: u8,
    pub x: i8,
    pub y: i8,
    pub wheel: i8,
}

impl BootMouseReport {
    /// Parse from raw BLE HID notification bytes.
    ///
    /// Accepts 3-byte (no wheel) or 4-byte (with wheel) reports.
    pub fn from_ble_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        Some(Self {
            buttons: data[0],
            x: data[1] as i8,
            y: data[2] as i8,
            wheel: if data.len() >= 4 { data[3] as i8 } else { 0 },
        })
    }

    /// Report ID 1 equivalent; only the three boot buttons survive.
    pub fn buttons_report(&self) -> ButtonsReport {
        ButtonsReport {
            buttons: self.buttons & BOOT_BUTTON_MASK,
            wheel: self.wheel,
            pan: 0,
        }
    }

    /// Report ID 2 equivalent, widened from 8-bit to 12-bit axes.
    pub fn motion_report(&self) -> MotionReport {
        MotionReport::new(self.x as i16, self.y as i16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_pack_positive_axes() {
        let r = MotionReport::new(0x123, 0x456);
        assert_eq!(r.pack(), [0x23, 0x61, 0x45]);
    }

    #[test]
    fn motion_pack_negative_one() {
        let r = MotionReport::new(-1, -1);
        assert_eq!(r.pack(), [0xFF, 0xFF, 0xFF]);
        assert_eq!(MotionReport::unpack(&r.pack()), Some(r));
    }

    #[test]
    fn motion_limits_clamp_and_survive_packing() {
        let r = MotionReport::new(5000, -5000);
        assert_eq!(r, MotionReport { x: 2047, y: -2047 });
        assert_eq!(MotionReport::unpack(&r.pack()), Some(r));
    }

    #[test]
    fn motion_unpack_short_fails() {
        assert!(MotionReport::unpack(&[0x00, 0x00]).is_none());
    }

    #[test]
    fn buttons_serialize_masks_to_five_buttons() {
        let r = ButtonsReport {
            buttons: 0xFF,
            wheel: -1,
            pan: 2,
        };
        let mut buf = [0u8; 4];
        assert_eq!(r.serialize(&mut buf), 4);
        assert_eq!(buf, [0x01, 0x1F, 0xFF, 0x02]);
    }

    #[test]
    fn buttons_serialize_buffer_too_small() {
        let mut buf = [0u8; 3];
        assert_eq!(ButtonsReport::released().serialize(&mut buf), 0);
    }

    #[test]
    fn boot_mouse_keeps_only_three_buttons() {
        let boot = BootMouseReport::from_ble_bytes(&[0xFF, 0x00, 0x00]).unwrap();
        assert_eq!(boot.buttons_report().buttons, 0x07);
        assert_eq!(boot.buttons_report().wheel, 0);
    }

    #[test]
    fn boot_mouse_wheel_from_fourth_byte() {
        let boot = BootMouseReport::from_ble_bytes(&[0x01, 0x05, 0xFB, 0x01]).unwrap();
        assert_eq!(boot.buttons_report().wheel, 1);
        assert_eq!(boot.motion_report(), MotionReport { x: 5, y: -5 });
    }

    #[test]
    fn boot_mouse_short_fails() {
        assert!(BootMouseReport::from_ble_bytes(&[0x01, 0x02]).is_none());
    }
}

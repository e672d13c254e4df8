//! Advertising-data parsing.
//!
//! Advertisements are a sequence of `[len][type][len - 1 bytes]` AD
//! structures.  A peripheral may split its service UUIDs and name across
//! the advertisement and the scan response, so nothing here decides whether
//! a device is acceptable: it only reports what one fragment contains.

use super::{device_name, DeviceName};

pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_INCOMPLETE_UUID16: u8 = 0x02;
pub const AD_TYPE_COMPLETE_UUID16: u8 = 0x03;
pub const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
pub const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
pub const AD_TYPE_SHORT_NAME: u8 = 0x08;
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;

/// HID over GATT service.
pub const HID_SERVICE_UUID16: u16 = 0x1812;

/// Nordic UART Service `6E400001-B5A3-F393-E0A9-E50E24DCCA9E`, little-endian.
pub const NUS_SERVICE_UUID128: [u8; 16] = [
    0x9E, 0xCA, 0xDC, 0x24, 0x0E, 0xE5, 0xA9, 0xE0, 0x93, 0xF3, 0xA3, 0xB5, 0x01, 0x00, 0x40, 0x6E,
];

/// Iterator over the `(ad_type, payload)` pairs of raw advertising data.
///
/// Stops at the first zero-length or truncated structure.
pub struct AdStructures<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.pos;
        let len = *self.data.get(i)? as usize;
        if len == 0 || i + len >= self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = i + len + 1;
        Some((self.data[i + 1], &self.data[i + 2..i + 1 + len]))
    }
}

bitflags::bitflags! {
    /// Services of interest seen in advertisements.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ServiceSet: u8 {
        const HID = 1 << 0;
        const NUS = 1 << 1;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ServiceSet {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "ServiceSet(hid={=bool}, nus={=bool})",
            self.contains(Self::HID),
            self.contains(Self::NUS)
        )
    }
}

/// Services advertised by one fragment.
pub fn advertised_services(data: &[u8]) -> ServiceSet {
    let mut set = ServiceSet::empty();
    for (ad_type, payload) in AdStructures::new(data) {
        match ad_type {
            AD_TYPE_INCOMPLETE_UUID16 | AD_TYPE_COMPLETE_UUID16 => {
                let hid = HID_SERVICE_UUID16.to_le_bytes();
                if payload.chunks_exact(2).any(|c| c == hid) {
                    set.insert(ServiceSet::HID);
                }
            }
            AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                if payload.chunks_exact(16).any(|c| c == NUS_SERVICE_UUID128) {
                    set.insert(ServiceSet::NUS);
                }
            }
            _ => {}
        }
    }
    set
}

/// Extract complete/shortened local name from advertisement data.
///
/// Invalid UTF-8 is cut at the first bad byte.
pub fn extract_device_name(data: &[u8]) -> Option<DeviceName> {
    let (_, bytes) = AdStructures::new(data)
        .find(|(t, _)| *t == AD_TYPE_COMPLETE_NAME || *t == AD_TYPE_SHORT_NAME)?;
    let text = match core::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    };
    if text.is_empty() {
        return None;
    }
    Some(device_name(text))
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

//! HID report types and BLE→USB translation layer.
//!
//! Every BLE input report becomes one USB report on the single HID
//! interface, prefixed with its report ID and forwarded without batching.
//! Two compatibility shims sit in front of the plain pass-through:
//!
//! - boot-protocol mouse notifications (no report ID) are remapped onto
//!   report IDs 1 and 2;
//! - consumer reports in the legacy 1-byte bitmap format are remapped onto
//!   the 16-bit usage format of report ID 3.

pub mod consumer;
pub mod descriptor;
pub mod mouse;
pub mod protocol_mode;

#[cfg(test)]
mod tests;

use heapless::Vec;

use crate::config::MAX_USB_REPORT_LEN;
use consumer::{ConsumerReport, CONSUMER_REPORT_ID};
use mouse::BootMouseReport;

/// Most USB reports produced from a single BLE notification.
pub const MAX_REPORTS_PER_NOTIFICATION: usize = 2;

/// A BLE HID notification as delivered by the GATT client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleReport<'a> {
    /// Report-protocol input report, tagged by its Report Reference ID.
    Input { report_id: u8, data: &'a [u8] },
    /// Boot-protocol mouse input (3-4 raw bytes, no report ID).
    BootMouse(&'a [u8]),
}

/// One USB HID input report, report ID in byte 0.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsbReport {
    buf: [u8; MAX_USB_REPORT_LEN],
    len: u8,
}

impl UsbReport {
    /// Prefix `payload` with `report_id`; `None` if it does not fit.
    pub fn with_id(report_id: u8, payload: &[u8]) -> Option<Self> {
        if payload.len() + 1 > MAX_USB_REPORT_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_USB_REPORT_LEN];
        buf[0] = report_id;
        buf[1..=payload.len()].copy_from_slice(payload);
        Some(Self {
            buf,
            len: (payload.len() + 1) as u8,
        })
    }

    /// Wrap bytes that already start with a report ID.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&id, payload) = bytes.split_first()?;
        Self::with_id(id, payload)
    }

    /// Build from a serializer writing into a scratch buffer.
    fn serialized(write: impl FnOnce(&mut [u8]) -> usize) -> Option<Self> {
        let mut buf = [0u8; MAX_USB_REPORT_LEN];
        let len = write(&mut buf);
        (len > 0).then_some(Self {
            buf,
            len: len as u8,
        })
    }

    pub fn report_id(&self) -> u8 {
        self.buf[0]
    }

    /// Bytes to hand to the HID endpoint, report ID included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

impl core::fmt::Debug for UsbReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("UsbReport").field(&self.as_bytes()).finish()
    }
}

/// Reports produced for one notification, in submission order.
pub type Translation = Vec<UsbReport, MAX_REPORTS_PER_NOTIFICATION>;

/// Translate one BLE notification into the USB reports to submit.
///
/// Returns an empty list when the notification cannot be represented
/// (malformed boot report or payload longer than a USB report).
pub fn translate(report: &BleReport<'_>) -> Translation {
    let mut out = Translation::new();
    match *report {
        BleReport::Input {
            report_id: CONSUMER_REPORT_ID,
            data: &[bitmap],
        } => {
            let consumer = ConsumerReport::from_legacy_bitmap(bitmap);
            debug!("consumer bitmap {:#x} -> usage {:#x}", bitmap, consumer.usage);
            push(&mut out, UsbReport::serialized(|b| consumer.serialize(b)));
        }
        BleReport::Input { report_id, data } => match UsbReport::with_id(report_id, data) {
            Some(r) => push(&mut out, Some(r)),
            None => warn!("report {} too long for USB ({} bytes)", report_id, data.len()),
        },
        BleReport::BootMouse(data) => match BootMouseReport::from_ble_bytes(data) {
            Some(boot) => {
                let buttons = boot.buttons_report();
                push(&mut out, UsbReport::serialized(|b| buttons.serialize(b)));
                let motion = boot.motion_report();
                if !motion.is_idle() {
                    push(&mut out, UsbReport::serialized(|b| motion.serialize(b)));
                }
            }
            None => warn!("boot mouse report too short ({} bytes)", data.len()),
        },
    }
    out
}

fn push(out: &mut Translation, report: Option<UsbReport>) {
    if let Some(r) = report {
        // Capacity matches the most reports a single arm produces.
        let _ = out.push(r);
    }
}

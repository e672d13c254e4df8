//! Unit tests for BLE→USB report translation.
//!
//! These tests run on the host (not embedded) and verify the pure
//! logic of report forwarding and the two compatibility remaps.

use super::consumer::ConsumerUsage;
use super::mouse::MotionReport;
use super::{translate, BleReport, UsbReport};
use crate::config::MAX_USB_REPORT_LEN;

fn bytes(reports: &[UsbReport]) -> Vec<Vec<u8>> {
    reports.iter().map(|r| r.as_bytes().to_vec()).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Report-protocol pass-through
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn input_report_is_prefixed_with_its_id() {
    let out = translate(&BleReport::Input {
        report_id: 1,
        data: &[0x01, 0xFF, 0x00],
    });
    assert_eq!(bytes(&out), vec![vec![0x01, 0x01, 0xFF, 0x00]]);
}

#[test]
fn motion_report_passes_through_unchanged() {
    let packed = MotionReport::new(-3, 40).pack();
    let out = translate(&BleReport::Input {
        report_id: 2,
        data: &packed,
    });
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].report_id(), 2);
    assert_eq!(&out[0].as_bytes()[1..], &packed);
}

#[test]
fn unknown_report_ids_are_forwarded_too() {
    let out = translate(&BleReport::Input {
        report_id: 0x20,
        data: &[0xDE, 0xAD],
    });
    assert_eq!(bytes(&out), vec![vec![0x20, 0xDE, 0xAD]]);
}

#[test]
fn two_byte_consumer_report_is_not_remapped() {
    let out = translate(&BleReport::Input {
        report_id: 3,
        data: &[0xE9, 0x00],
    });
    assert_eq!(bytes(&out), vec![vec![0x03, 0xE9, 0x00]]);
}

#[test]
fn oversize_payload_is_dropped() {
    let data = [0u8; MAX_USB_REPORT_LEN];
    let out = translate(&BleReport::Input {
        report_id: 1,
        data: &data,
    });
    assert!(out.is_empty());
}

#[test]
fn largest_payload_that_fits_is_kept() {
    let data = [0x5Au8; MAX_USB_REPORT_LEN - 1];
    let out = translate(&BleReport::Input {
        report_id: 9,
        data: &data,
    });
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_bytes().len(), MAX_USB_REPORT_LEN);
}

// ═══════════════════════════════════════════════════════════════════════════
// Legacy consumer bitmap
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn legacy_bitmap_zero_releases() {
    let out = translate(&BleReport::Input {
        report_id: 3,
        data: &[0x00],
    });
    assert_eq!(bytes(&out), vec![vec![0x03, 0x00, 0x00]]);
}

#[test]
fn legacy_bitmap_bit_two_is_next_track() {
    let out = translate(&BleReport::Input {
        report_id: 3,
        data: &[0x04],
    });
    let code = ConsumerUsage::NextTrack.code().to_le_bytes();
    assert_eq!(bytes(&out), vec![vec![0x03, code[0], code[1]]]);
}

#[test]
fn legacy_bitmap_multiple_bits_lowest_wins() {
    let out = translate(&BleReport::Input {
        report_id: 3,
        data: &[0b0011_0000],
    });
    // bit 4 = volume down beats bit 5 = volume up
    assert_eq!(bytes(&out), vec![vec![0x03, 0xEA, 0x00]]);
}

#[test]
fn one_byte_reports_on_other_ids_are_plain() {
    let out = translate(&BleReport::Input {
        report_id: 1,
        data: &[0x04],
    });
    assert_eq!(bytes(&out), vec![vec![0x01, 0x04]]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Boot-protocol mouse
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn boot_mouse_buttons_only() {
    let out = translate(&BleReport::BootMouse(&[0x01, 0x00, 0x00]));
    assert_eq!(bytes(&out), vec![vec![0x01, 0x01, 0x00, 0x00]]);
}

#[test]
fn boot_mouse_masks_extra_buttons() {
    let out = translate(&BleReport::BootMouse(&[0xF9, 0x00, 0x00]));
    assert_eq!(out[0].as_bytes()[1], 0x01);
}

#[test]
fn boot_mouse_with_motion_emits_motion_report() {
    let out = translate(&BleReport::BootMouse(&[0x02, 0x05, 0xFB, 0x01]));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].as_bytes(), &[0x01, 0x02, 0x01, 0x00]);
    assert_eq!(out[1].report_id(), 2);
    assert_eq!(
        MotionReport::unpack(&out[1].as_bytes()[1..]),
        Some(MotionReport { x: 5, y: -5 })
    );
}

#[test]
fn short_boot_mouse_is_dropped() {
    assert!(translate(&BleReport::BootMouse(&[0x01, 0x02])).is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// UsbReport helpers
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn usb_report_from_bytes_keeps_id() {
    let r = UsbReport::from_bytes(&[2, 0, 0, 0]).unwrap();
    assert_eq!(r.report_id(), 2);
    assert_eq!(r.as_bytes(), &[2, 0, 0, 0]);
    assert!(UsbReport::from_bytes(&[]).is_none());
}

//! Classifying qualified peripherals.
//!
//! The primary peripheral is the HID mouthpiece.  Accessories are the two
//! arms of a pair of smart glasses, which advertise NUS only and identify
//! their side through the advertised name (`..._L_...`, `..._R_...`).

use super::adv_parser::ServiceSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceClass {
    Unknown,
    PrimaryPeripheral,
    AccessoryLeft,
    AccessoryRight,
}

impl DeviceClass {
    pub fn is_accessory(self) -> bool {
        matches!(self, DeviceClass::AccessoryLeft | DeviceClass::AccessoryRight)
    }

    /// Services a candidate must have advertised before we connect.
    pub fn required_services(self) -> ServiceSet {
        if self.is_accessory() {
            ServiceSet::NUS
        } else {
            ServiceSet::HID.union(ServiceSet::NUS)
        }
    }
}

/// Glasses arms advertise names containing one of these markers.
const ACCESSORY_MARKERS: [&str; 4] = ["Even", "even", "G1", "g1"];

pub fn is_accessory_name(name: &str) -> bool {
    ACCESSORY_MARKERS.iter().any(|m| name.contains(m))
}

/// Arm side encoded in an accessory name, if any.
pub fn arm_from_name(name: &str) -> Option<DeviceClass> {
    if name.contains("_L_") {
        return Some(DeviceClass::AccessoryLeft);
    }
    if name.contains("_R_") {
        return Some(DeviceClass::AccessoryRight);
    }
    // "G1_L" style: side is the character after the last underscore
    let (_, tail) = name.rsplit_once('_')?;
    match tail.chars().next() {
        Some('L') | Some('l') => Some(DeviceClass::AccessoryLeft),
        Some('R') | Some('r') => Some(DeviceClass::AccessoryRight),
        _ => None,
    }
}

/// Decide what a candidate is.
///
/// `left_taken` says whether a left arm is already connected or pending;
/// an accessory without a side marker takes whichever side is free.
pub fn classify(name: Option<&str>, services: ServiceSet, left_taken: bool) -> DeviceClass {
    if let Some(n) = name.filter(|n| is_accessory_name(n)) {
        return arm_from_name(n).unwrap_or(if left_taken {
            DeviceClass::AccessoryRight
        } else {
            DeviceClass::AccessoryLeft
        });
    }
    if services.contains(ServiceSet::HID) {
        DeviceClass::PrimaryPeripheral
    } else {
        DeviceClass::Unknown
    }
}

//! Bluetooth Low Energy central-role core.
//!
//! Everything here is radio-agnostic: the SoftDevice glue in the firmware
//! binary turns stack callbacks into [`central::CentralEvent`]s and carries
//! out the requests made through [`CentralRadio`].
//!
//! 1. **Advertisement parsing** - AD structures, service UUIDs, names.
//! 2. **Qualification** - accumulates UUID evidence per address across
//!    advertisement fragments.
//! 3. **Discovery** - per-link chain of GATT service discoveries.
//! 4. **Connection Manager** - scan / connect / secure / teardown.

pub mod adv_parser;
pub mod central;
pub mod device_class;
pub mod discovery;
pub mod peers;
pub mod qualification;

use core::fmt::Write;

use heapless::String;

use crate::config::{ADDRESS_NAME_LEN, BOND_NAME_MAX};
use crate::error::BleError;
use discovery::Stage;

/// Display name of a peer, as advertised or persisted.
pub type DeviceName = String<BOND_NAME_MAX>;

/// Copy `name` into a [`DeviceName`], truncating on a character boundary.
pub fn device_name(name: &str) -> DeviceName {
    let mut out = DeviceName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// BLE address type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressKind {
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
}

impl AddressKind {
    pub fn as_byte(self) -> u8 {
        match self {
            AddressKind::Public => 0,
            AddressKind::RandomStatic => 1,
            AddressKind::RandomPrivateResolvable => 2,
            AddressKind::RandomPrivateNonResolvable => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AddressKind::Public),
            1 => Some(AddressKind::RandomStatic),
            2 => Some(AddressKind::RandomPrivateResolvable),
            3 => Some(AddressKind::RandomPrivateNonResolvable),
            _ => None,
        }
    }
}

/// Peer device address.  `bytes` is least-significant octet first, as on
/// air and as the SoftDevice reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress {
    pub kind: AddressKind,
    pub bytes: [u8; 6],
}

/// Serialized size of a [`PeerAddress`].
pub const PEER_ADDRESS_LEN: usize = 7;

impl PeerAddress {
    pub const fn new(kind: AddressKind, bytes: [u8; 6]) -> Self {
        Self { kind, bytes }
    }

    /// `[kind][6 address bytes]`.
    pub fn to_bytes(&self) -> [u8; PEER_ADDRESS_LEN] {
        let mut out = [0u8; PEER_ADDRESS_LEN];
        out[0] = self.kind.as_byte();
        out[1..].copy_from_slice(&self.bytes);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < PEER_ADDRESS_LEN {
            return None;
        }
        let kind = AddressKind::from_byte(data[0])?;
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&data[1..PEER_ADDRESS_LEN]);
        Some(Self { kind, bytes })
    }

    /// Conventional `AA:BB:CC:DD:EE:FF` form, most-significant octet first.
    pub fn to_text(&self) -> String<17> {
        let mut s = String::new();
        for (i, b) in self.bytes.iter().rev().enumerate() {
            if i > 0 {
                let _ = s.push(':');
            }
            let _ = write!(s, "{:02X}", b);
        }
        s
    }

    /// Fallback display name: the tail of [`Self::to_text`].
    pub fn short_name(&self) -> DeviceName {
        let text = self.to_text();
        let start = text.len().saturating_sub(ADDRESS_NAME_LEN);
        device_name(&text[start..])
    }
}

/// Opaque connection handle owned by the radio stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkHandle(pub u16);

/// Requests the connection manager makes of the radio stack.
///
/// Every call is fire-and-forget: the result of the operation arrives later
/// as a [`central::CentralEvent`].  An `Err` means the request could not even
/// be issued and is treated like the matching failure event.
pub trait CentralRadio {
    fn start_scan(&mut self) -> Result<(), BleError>;
    fn stop_scan(&mut self) -> Result<(), BleError>;
    fn connect(&mut self, address: &PeerAddress) -> Result<(), BleError>;
    fn disconnect(&mut self, link: LinkHandle) -> Result<(), BleError>;
    fn request_security(&mut self, link: LinkHandle) -> Result<(), BleError>;
    /// Start discovery of one GATT service.
    fn discover(&mut self, link: LinkHandle, stage: Stage) -> Result<(), BleError>;
    fn exchange_mtu(&mut self, link: LinkHandle) -> Result<(), BleError>;
    fn request_rssi(&mut self, link: LinkHandle) -> Result<(), BleError>;
    fn delete_bond(&mut self, address: &PeerAddress) -> Result<(), BleError>;
    fn delete_all_bonds(&mut self) -> Result<(), BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: PeerAddress =
        PeerAddress::new(AddressKind::RandomStatic, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);

    #[test]
    fn address_text_is_msb_first() {
        assert_eq!(ADDR.to_text().as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn short_name_is_address_tail() {
        assert_eq!(ADDR.short_name().as_str(), "CC:DD:EE:FF");
    }

    #[test]
    fn address_bytes_round_trip() {
        let raw = ADDR.to_bytes();
        assert_eq!(raw[0], 1);
        assert_eq!(PeerAddress::from_bytes(&raw), Some(ADDR));
        assert_eq!(PeerAddress::from_bytes(&raw[..6]), None);
    }

    #[test]
    fn unknown_address_kind_rejected() {
        let mut raw = ADDR.to_bytes();
        raw[0] = 9;
        assert_eq!(PeerAddress::from_bytes(&raw), None);
    }

    #[test]
    fn device_name_truncates_on_char_boundary() {
        let long = "é".repeat(20); // 40 bytes
        let name = device_name(&long);
        assert!(name.len() <= BOND_NAME_MAX);
        assert_eq!(name.chars().count(), 15);
    }
}

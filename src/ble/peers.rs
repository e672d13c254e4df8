//! Table of live connections.
//!
//! Slots are addressed by [`PeerId`], an index into a fixed arena.  The radio
//! stack's own handle ([`LinkHandle`]) is only used to look a slot up when an
//! event arrives.  Removing an entry drops every per-link flag with it.

use super::device_class::DeviceClass;
use super::discovery::Stage;
use super::{DeviceName, LinkHandle, PeerAddress};
use crate::config::MAX_CONNECTIONS;
use crate::error::BleError;

/// Index of a connection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerId(u8);

impl PeerId {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Services confirmed by discovery on one link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Readiness {
    pub uart: bool,
    pub hid: bool,
    pub battery: bool,
    pub device_info: bool,
}

impl Readiness {
    pub fn mark(&mut self, stage: Stage) {
        match stage {
            Stage::Uart => self.uart = true,
            Stage::Hid => self.hid = true,
            Stage::Battery => self.battery = true,
            Stage::DeviceInfo => self.device_info = true,
            Stage::Mtu => {}
        }
    }

    /// Both services the bridge needs are usable.
    pub fn is_ready(&self) -> bool {
        self.uart && self.hid
    }
}

/// State of one connected peripheral.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConnection {
    pub link: LinkHandle,
    pub address: PeerAddress,
    pub class: DeviceClass,
    pub name: DeviceName,
    /// `name` is the address fallback, not a real device name.
    pub name_is_fallback: bool,
    pub readiness: Readiness,
    /// Ready notice already emitted for this link.
    pub ready_signalled: bool,
    pub mtu: u16,
    pub rssi: Option<i8>,
    pub next_rssi_poll_ms: u64,
}

/// ATT MTU before any exchange.
pub const DEFAULT_ATT_MTU: u16 = 23;

impl PeerConnection {
    pub fn new(link: LinkHandle, address: PeerAddress, class: DeviceClass, name: DeviceName) -> Self {
        Self {
            link,
            address,
            class,
            name,
            name_is_fallback: false,
            readiness: Readiness::default(),
            ready_signalled: false,
            mtu: DEFAULT_ATT_MTU,
            rssi: None,
            next_rssi_poll_ms: 0,
        }
    }
}

pub struct PeerTable<const N: usize = MAX_CONNECTIONS> {
    slots: [Option<PeerConnection>; N],
    default: Option<PeerId>,
}

impl<const N: usize> Default for PeerTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PeerTable<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            default: None,
        }
    }

    pub fn insert(&mut self, peer: PeerConnection) -> Result<PeerId, BleError> {
        if self.by_link(peer.link).is_some() {
            return Err(BleError::Busy);
        }
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(BleError::NoFreeSlot)?;
        self.slots[idx] = Some(peer);
        Ok(PeerId(idx as u8))
    }

    /// Free the slot, clearing the default designation if it pointed here.
    pub fn remove(&mut self, id: PeerId) -> Option<PeerConnection> {
        let peer = self.slots.get_mut(id.index())?.take()?;
        if self.default == Some(id) {
            self.default = None;
        }
        Some(peer)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerConnection> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerConnection> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub fn by_link(&self, link: LinkHandle) -> Option<PeerId> {
        self.find(|p| p.link == link)
    }

    pub fn by_address(&self, address: &PeerAddress) -> Option<PeerId> {
        self.find(|p| p.address == *address)
    }

    pub fn by_class(&self, class: DeviceClass) -> Option<PeerId> {
        self.find(|p| p.class == class)
    }

    fn find(&self, pred: impl Fn(&PeerConnection) -> bool) -> Option<PeerId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(&pred))
            .map(|i| PeerId(i as u8))
    }

    /// Mark `id` as the connection whose input reaches USB.
    pub fn set_default(&mut self, id: PeerId) {
        if self.get(id).is_some() {
            self.default = Some(id);
        }
    }

    pub fn default_id(&self) -> Option<PeerId> {
        self.default
    }

    pub fn default_peer(&self) -> Option<&PeerConnection> {
        self.default.and_then(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &PeerConnection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|p| (PeerId(i as u8), p)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PeerId, &mut PeerConnection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|p| (PeerId(i as u8), p)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_slots(&self) -> usize {
        N - self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{device_name, AddressKind};

    fn peer(link: u16, class: DeviceClass) -> PeerConnection {
        PeerConnection::new(
            LinkHandle(link),
            PeerAddress::new(AddressKind::Public, [link as u8, 1, 2, 3, 4, 5]),
            class,
            device_name("peer"),
        )
    }

    #[test]
    fn insert_lookup_remove() {
        let mut t: PeerTable = PeerTable::new();
        let id = t.insert(peer(7, DeviceClass::PrimaryPeripheral)).unwrap();
        assert_eq!(t.by_link(LinkHandle(7)), Some(id));
        assert_eq!(t.by_class(DeviceClass::PrimaryPeripheral), Some(id));
        assert_eq!(t.remove(id).map(|p| p.link), Some(LinkHandle(7)));
        assert!(t.is_empty());
        assert!(t.remove(id).is_none());
    }

    #[test]
    fn table_capacity() {
        let mut t: PeerTable<2> = PeerTable::new();
        t.insert(peer(1, DeviceClass::AccessoryLeft)).unwrap();
        t.insert(peer(2, DeviceClass::AccessoryRight)).unwrap();
        assert_eq!(t.free_slots(), 0);
        assert_eq!(
            t.insert(peer(3, DeviceClass::PrimaryPeripheral)),
            Err(BleError::NoFreeSlot)
        );
    }

    #[test]
    fn duplicate_link_rejected() {
        let mut t: PeerTable = PeerTable::new();
        t.insert(peer(1, DeviceClass::PrimaryPeripheral)).unwrap();
        assert_eq!(t.insert(peer(1, DeviceClass::AccessoryLeft)), Err(BleError::Busy));
    }

    #[test]
    fn removing_default_clears_it() {
        let mut t: PeerTable = PeerTable::new();
        let id = t.insert(peer(1, DeviceClass::PrimaryPeripheral)).unwrap();
        t.set_default(id);
        assert_eq!(t.default_peer().map(|p| p.link), Some(LinkHandle(1)));
        t.remove(id);
        assert_eq!(t.default_id(), None);
    }

    #[test]
    fn slot_reuse_starts_clean() {
        let mut t: PeerTable = PeerTable::new();
        let id = t.insert(peer(1, DeviceClass::PrimaryPeripheral)).unwrap();
        t.get_mut(id).unwrap().readiness.mark(Stage::Uart);
        t.remove(id);
        let id2 = t.insert(peer(2, DeviceClass::PrimaryPeripheral)).unwrap();
        assert_eq!(id, id2);
        assert_eq!(t.get(id2).unwrap().readiness, Readiness::default());
    }

    #[test]
    fn readiness_needs_uart_and_hid() {
        let mut r = Readiness::default();
        r.mark(Stage::Hid);
        r.mark(Stage::Battery);
        assert!(!r.is_ready());
        r.mark(Stage::Uart);
        assert!(r.is_ready());
    }
}

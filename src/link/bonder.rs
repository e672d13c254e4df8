//! SoftDevice security handler with persistent link keys.
//!
//! Keys handed over by the SoftDevice after pairing are kept in RAM here
//! and mirrored to flash by the storage task.  The bond *metadata* (name,
//! last seen) lives in the library's `BondRegistry`; this table only knows
//! keys and identity addresses, and only the registry decides which bond
//! to evict.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use defmt::{info, warn};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use nrf_softdevice::ble::security::{IoCapabilities, SecurityHandler};
use nrf_softdevice::ble::{
    Connection, EncryptionInfo, IdentityKey, IdentityResolutionKey, MasterId, SecurityMode,
};
use nrf_softdevice::raw;

use mouthpad_usb::ble::central::CentralEvent;
use mouthpad_usb::ble::{LinkHandle, PeerAddress};
use mouthpad_usb::bonds::{KeyTable, LinkKeys, KEY_TABLE_SLOTS};

use super::{dispatch, peer_address, sd_address};
use crate::storage;

#[derive(Clone, Copy)]
struct PeerBond {
    master_id: MasterId,
    key: EncryptionInfo,
    peer_id: IdentityKey,
}

impl PeerBond {
    fn address(&self) -> PeerAddress {
        peer_address(self.peer_id.addr)
    }

    fn to_keys(self) -> LinkKeys {
        LinkKeys {
            address: self.address(),
            ediv: self.master_id.ediv,
            rand: self.master_id.rand,
            ltk: self.key.ltk,
            ltk_flags: self.key.flags,
            irk: self.peer_id.irk.as_raw().irk,
        }
    }

    fn from_keys(keys: &LinkKeys) -> Self {
        Self {
            master_id: MasterId {
                ediv: keys.ediv,
                rand: keys.rand,
            },
            key: EncryptionInfo {
                ltk: keys.ltk,
                flags: keys.ltk_flags,
            },
            peer_id: IdentityKey {
                irk: IdentityResolutionKey::from_raw(raw::ble_gap_irk_t { irk: keys.irk }),
                addr: sd_address(&keys.address),
            },
        }
    }
}

pub struct Bonder {
    peers: Mutex<CriticalSectionRawMutex, RefCell<KeyTable<PeerBond>>>,
    dirty: AtomicBool,
}

static BONDER: Bonder = Bonder::new();

pub fn bonder() -> &'static Bonder {
    &BONDER
}

impl Bonder {
    const fn new() -> Self {
        Self {
            peers: Mutex::new(RefCell::new(KeyTable::new())),
            dirty: AtomicBool::new(false),
        }
    }

    /// Identity addresses we hold keys for.
    pub fn addresses(&self) -> heapless::Vec<PeerAddress, KEY_TABLE_SLOTS> {
        self.peers
            .lock(|peers| peers.borrow().addresses().copied().collect())
    }

    /// Key set per table position, for the storage task.
    pub fn snapshot(&self) -> [Option<LinkKeys>; KEY_TABLE_SLOTS] {
        self.peers.lock(|peers| {
            let peers = peers.borrow();
            core::array::from_fn(|i| peers.get(i).map(|(_, p)| p.to_keys()))
        })
    }

    /// Install keys read back from flash.
    pub fn restore(&self, keys: &LinkKeys) {
        self.peers.lock(|peers| {
            let mut peers = peers.borrow_mut();
            if peers.contains(&keys.address) {
                return;
            }
            if peers.insert(keys.address, PeerBond::from_keys(keys)).is_err() {
                warn!("link key table full, dropping stored keys");
            }
        });
    }

    pub fn forget(&self, address: &PeerAddress) {
        let removed = self.peers.lock(|peers| peers.borrow_mut().remove(address));
        if removed {
            info!("link keys deleted");
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn forget_all(&self) {
        self.peers.lock(|peers| peers.borrow_mut().clear());
        self.dirty.store(true, Ordering::Relaxed);
        info!("all link keys deleted");
    }

    /// True once after any key change.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}

impl SecurityHandler for Bonder {
    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::None
    }

    fn can_bond(&self, _conn: &Connection) -> bool {
        true
    }

    fn on_bonded(
        &self,
        conn: &Connection,
        master_id: MasterId,
        key: EncryptionInfo,
        peer_id: IdentityKey,
    ) {
        let stored = self.peers.lock(|peers| {
            let mut peers = peers.borrow_mut();
            if let Some(existing) = peers.find_mut(|p| p.master_id == master_id) {
                existing.key = key;
                existing.peer_id = peer_id;
                return true;
            }
            // lands in the spare entry; the registry's eviction frees one
            let bond = PeerBond {
                master_id,
                key,
                peer_id,
            };
            peers.insert(bond.address(), bond).is_ok()
        });
        if stored {
            self.dirty.store(true, Ordering::Relaxed);
            storage::request_flush();
        } else {
            warn!("link key table full, keys for this bond not kept");
        }

        match conn.handle() {
            Some(handle) => dispatch(CentralEvent::Bonded {
                link: LinkHandle(handle),
            }),
            None => warn!("bonded on a closed link"),
        }
    }

    fn get_key(&self, _conn: &Connection, master_id: MasterId) -> Option<EncryptionInfo> {
        self.peers.lock(|peers| {
            peers
                .borrow()
                .iter()
                .find_map(|(_, p)| (p.master_id == master_id).then_some(p.key))
        })
    }

    fn get_peripheral_key(&self, conn: &Connection) -> Option<(MasterId, EncryptionInfo)> {
        self.peers.lock(|peers| {
            peers.borrow().iter().find_map(|(_, p)| {
                p.peer_id
                    .is_match(conn.peer_address())
                    .then_some((p.master_id, p.key))
            })
        })
    }

    fn on_security_update(&self, _conn: &Connection, mode: SecurityMode) {
        info!("BLE security mode updated: {}", mode);
    }
}

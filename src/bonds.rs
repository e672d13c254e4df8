//! Bonded-device registry.
//!
//! A fixed table of the peripherals we hold link keys for, with display
//! name and last-seen time.  Every mutation queues a [`PersistOp`] for the
//! firmware's flash task to apply; the registry itself never touches flash
//! so it can be exercised on the host.
//!
//! Record layout in flash (one map item per slot):
//!   `[addr kind][6 addr bytes][last_seen u64 LE][name_len][name bytes...]`

use crate::ble::{device_name, DeviceName, PeerAddress, PEER_ADDRESS_LEN};
use crate::config::{BOND_NAME_MAX, MAX_PAIRED_DEVICES};
use crate::error::RegistryError;

/// Header bytes ahead of the name: address + last seen + name length.
const RECORD_HEADER_LEN: usize = PEER_ADDRESS_LEN + 8 + 1;

/// Largest serialized [`BondRecord`].
pub const BOND_RECORD_MAX_SIZE: usize = RECORD_HEADER_LEN + BOND_NAME_MAX;

/// A bonded device as stored in flash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BondRecord {
    pub address: PeerAddress,
    /// Empty until the name becomes known.
    pub name: DeviceName,
    /// Milliseconds at last connection, on a clock that keeps counting
    /// across reboots (see [`BondRegistry::restore`]).
    pub last_seen: u64,
}

impl BondRecord {
    pub fn new(address: PeerAddress, name: &str, last_seen: u64) -> Self {
        Self {
            address,
            name: device_name(name),
            last_seen,
        }
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    /// Serialize to bytes for flash storage. Returns 0 if `buf` is too small.
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        let name = self.name.as_bytes();
        let total = RECORD_HEADER_LEN + name.len();
        if buf.len() < total {
            return 0;
        }
        buf[..PEER_ADDRESS_LEN].copy_from_slice(&self.address.to_bytes());
        buf[PEER_ADDRESS_LEN..PEER_ADDRESS_LEN + 8].copy_from_slice(&self.last_seen.to_le_bytes());
        buf[RECORD_HEADER_LEN - 1] = name.len() as u8;
        buf[RECORD_HEADER_LEN..total].copy_from_slice(name);
        total
    }

    /// Deserialize from bytes.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < RECORD_HEADER_LEN {
            return None;
        }
        let address = PeerAddress::from_bytes(&data[..PEER_ADDRESS_LEN])?;
        let mut seen = [0u8; 8];
        seen.copy_from_slice(&data[PEER_ADDRESS_LEN..PEER_ADDRESS_LEN + 8]);
        let name_len = data[RECORD_HEADER_LEN - 1] as usize;
        if name_len > BOND_NAME_MAX || data.len() < RECORD_HEADER_LEN + name_len {
            return None;
        }
        let name = core::str::from_utf8(&data[RECORD_HEADER_LEN..RECORD_HEADER_LEN + name_len]).ok()?;
        Some(Self {
            address,
            name: device_name(name),
            last_seen: u64::from_le_bytes(seen),
        })
    }
}

/// Serialized size of [`LinkKeys`].
pub const LINK_KEYS_SIZE: usize = PEER_ADDRESS_LEN + 2 + 8 + 16 + 1 + 16;

/// Link-layer keys for one bond, as handed over by the radio stack.
///
/// Layout: `[identity addr 7][ediv u16 LE][rand 8][ltk 16][ltk flags][irk 16]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkKeys {
    /// Identity address of the peer.
    pub address: PeerAddress,
    pub ediv: u16,
    pub rand: [u8; 8],
    pub ltk: [u8; 16],
    pub ltk_flags: u8,
    pub irk: [u8; 16],
}

impl LinkKeys {
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        if buf.len() < LINK_KEYS_SIZE {
            return 0;
        }
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            buf[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&self.address.to_bytes());
        put(&self.ediv.to_le_bytes());
        put(&self.rand);
        put(&self.ltk);
        put(&[self.ltk_flags]);
        put(&self.irk);
        LINK_KEYS_SIZE
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < LINK_KEYS_SIZE {
            return None;
        }
        let address = PeerAddress::from_bytes(&data[..PEER_ADDRESS_LEN])?;
        let (ediv, rest) = data[PEER_ADDRESS_LEN..].split_at(2);
        let (rand, rest) = rest.split_at(8);
        let (ltk, rest) = rest.split_at(16);
        let (flags, rest) = rest.split_at(1);
        let mut keys = Self {
            address,
            ediv: u16::from_le_bytes([ediv[0], ediv[1]]),
            rand: [0; 8],
            ltk: [0; 16],
            ltk_flags: flags[0],
            irk: [0; 16],
        };
        keys.rand.copy_from_slice(rand);
        keys.ltk.copy_from_slice(ltk);
        keys.irk.copy_from_slice(&rest[..16]);
        Some(keys)
    }
}

/// Entries in a [`KeyTable`]: one per bond plus a spare.
///
/// Fresh keys land in the spare before the registry has chosen its
/// eviction victim; forgetting the victim brings the table back to
/// `MAX_PAIRED_DEVICES`.
pub const KEY_TABLE_SLOTS: usize = MAX_PAIRED_DEVICES + 1;

/// Link keys per identity address, in insertion order.
///
/// The table never picks a victim itself.  Eviction is the
/// [`BondRegistry`]'s call, so both tables always agree on who is bonded.
pub struct KeyTable<T, const N: usize = KEY_TABLE_SLOTS> {
    entries: heapless::Vec<(PeerAddress, T), N>,
}

impl<T, const N: usize> Default for KeyTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> KeyTable<T, N> {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.entries.iter().any(|(a, _)| a == address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &PeerAddress> {
        self.entries.iter().map(|(a, _)| a)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddress, &T)> {
        self.entries.iter().map(|(a, v)| (a, v))
    }

    /// Entry at table position `index`, as mirrored to flash.
    pub fn get(&self, index: usize) -> Option<(&PeerAddress, &T)> {
        self.entries.get(index).map(|(a, v)| (a, v))
    }

    pub fn find_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.entries.iter_mut().find(|(_, v)| pred(v)).map(|(_, v)| v)
    }

    /// Add or replace the keys for `address`.
    ///
    /// A full table hands `value` back instead of dropping another bond.
    pub fn insert(&mut self, address: PeerAddress, value: T) -> Result<(), T> {
        if let Some((_, slot)) = self.entries.iter_mut().find(|(a, _)| *a == address) {
            *slot = value;
            return Ok(());
        }
        self.entries.push((address, value)).map_err(|(_, v)| v)
    }

    pub fn remove(&mut self, address: &PeerAddress) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(a, _)| a != address);
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Flash work produced by registry mutations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistOp {
    /// Wipe every bond record (and the link keys that go with them).
    EraseAll,
    Store { slot: usize, record: BondRecord },
    Erase { slot: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SlotOp {
    Store(BondRecord),
    Erase,
}

/// Pending flash work, newest state per slot, `EraseAll` first.
pub struct PendingOps<const N: usize> {
    erase_all: bool,
    slots: [Option<SlotOp>; N],
    next: usize,
}

impl<const N: usize> PendingOps<N> {
    fn new() -> Self {
        Self {
            erase_all: false,
            slots: core::array::from_fn(|_| None),
            next: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.erase_all && self.slots[self.next.min(N)..].iter().all(Option::is_none)
    }
}

impl<const N: usize> Iterator for PendingOps<N> {
    type Item = PersistOp;

    fn next(&mut self) -> Option<PersistOp> {
        if self.erase_all {
            self.erase_all = false;
            return Some(PersistOp::EraseAll);
        }
        while self.next < N {
            let slot = self.next;
            self.next += 1;
            match self.slots[slot].take() {
                Some(SlotOp::Store(record)) => return Some(PersistOp::Store { slot, record }),
                Some(SlotOp::Erase) => return Some(PersistOp::Erase { slot }),
                None => {}
            }
        }
        None
    }
}

/// Result of [`BondRegistry::upsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Upsert {
    pub slot: usize,
    /// Address whose record was dropped to make room.
    pub evicted: Option<PeerAddress>,
}

/// In-memory bond table, synced with flash through [`PersistOp`]s.
pub struct BondRegistry<const N: usize = MAX_PAIRED_DEVICES> {
    slots: [Option<BondRecord>; N],
    pending: PendingOps<N>,
    /// Added to every `now`; past every stamp restored from flash.
    stamp_base: u64,
}

impl<const N: usize> Default for BondRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BondRegistry<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            pending: PendingOps::new(),
            stamp_base: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot_of(&self, address: &PeerAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.address == *address))
    }

    pub fn is_bonded(&self, address: &PeerAddress) -> bool {
        self.slot_of(address).is_some()
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&BondRecord> {
        self.slot_of(address).and_then(|i| self.slots[i].as_ref())
    }

    /// Bonded devices, in slot order.
    pub fn list(&self) -> impl Iterator<Item = &BondRecord> {
        self.slots.iter().flatten()
    }

    /// Most recently seen bond, if any.
    pub fn most_recent(&self) -> Option<&BondRecord> {
        self.list().max_by_key(|r| r.last_seen)
    }

    /// Record a completed bond, or refresh an existing one.
    ///
    /// A full table evicts the least-recently-seen record.  An empty `name`
    /// keeps whatever name an existing record already carries.
    pub fn upsert(&mut self, address: PeerAddress, name: &str, now: u64) -> Upsert {
        let now = self.stamp(now);
        if let Some(slot) = self.slot_of(&address) {
            if let Some(record) = self.slots[slot].as_mut() {
                if !name.is_empty() {
                    record.name = device_name(name);
                }
                record.last_seen = now;
            }
            info!("bond refreshed in slot {}", slot);
            self.queue_store(slot);
            return Upsert { slot, evicted: None };
        }

        let (slot, evicted) = match self.slots.iter().position(Option::is_none) {
            Some(free) => (free, None),
            None => {
                let victim = self.least_recent_slot();
                let old = self.slots[victim].take().map(|r| r.address);
                warn!("bond table full - evicting slot {}", victim);
                (victim, old)
            }
        };
        self.slots[slot] = Some(BondRecord::new(address, name, now));
        self.queue_store(slot);
        info!("bond added in slot {} - now storing {}", slot, self.len());
        Upsert { slot, evicted }
    }

    fn least_recent_slot(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map_or(0, |r| r.last_seen))
            .map_or(0, |(i, _)| i)
    }

    /// Update the last-seen time of an existing bond.
    pub fn touch(&mut self, address: &PeerAddress, now: u64) -> bool {
        let now = self.stamp(now);
        let Some(slot) = self.slot_of(address) else {
            return false;
        };
        if let Some(record) = self.slots[slot].as_mut() {
            record.last_seen = now;
        }
        self.queue_store(slot);
        true
    }

    /// Fill in a name learned after the bond was recorded.
    pub fn set_name(&mut self, address: &PeerAddress, name: &str) -> bool {
        let Some(slot) = self.slot_of(address) else {
            return false;
        };
        if let Some(record) = self.slots[slot].as_mut() {
            record.name = device_name(name);
        }
        self.queue_store(slot);
        true
    }

    pub fn remove(&mut self, address: &PeerAddress) -> Option<BondRecord> {
        let slot = self.slot_of(address)?;
        let record = self.slots[slot].take();
        self.pending.slots[slot] = Some(SlotOp::Erase);
        record
    }

    pub fn clear_all(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.pending = PendingOps::new();
        self.pending.erase_all = true;
        info!("all bonds cleared");
    }

    /// Load a record read back from flash at boot. Does not queue a write.
    ///
    /// The uptime clock restarts at zero on every boot, so later stamps are
    /// shifted past the newest restored one to keep LRU order intact.
    pub fn restore(&mut self, slot: usize, record: BondRecord) -> Result<(), RegistryError> {
        if slot >= N {
            return Err(RegistryError::InvalidSlot);
        }
        self.stamp_base = self.stamp_base.max(record.last_seen.saturating_add(1));
        if let Some(existing) = self.slot_of(&record.address) {
            // Two slots claim one address: keep the fresher copy.
            let keep_new = self.slots[existing]
                .as_ref()
                .is_some_and(|r| r.last_seen < record.last_seen);
            if !keep_new {
                self.pending.slots[slot] = Some(SlotOp::Erase);
                return Err(RegistryError::Corrupt);
            }
            self.slots[existing] = None;
            self.pending.slots[existing] = Some(SlotOp::Erase);
        }
        self.slots[slot] = Some(record);
        Ok(())
    }

    /// Align the table with the addresses the radio stack holds keys for.
    ///
    /// Records without keys are dropped; keys without a record get a
    /// nameless record so the name is fetched on the next connection.
    pub fn reconcile(&mut self, bonded: &[PeerAddress], now: u64) {
        let now = self.stamp(now);
        for slot in 0..N {
            let stale = self.slots[slot]
                .as_ref()
                .is_some_and(|r| !bonded.contains(&r.address));
            if stale {
                warn!("bond slot {} has no link keys, dropping", slot);
                self.slots[slot] = None;
                self.pending.slots[slot] = Some(SlotOp::Erase);
            }
        }
        for address in bonded {
            if self.is_bonded(address) {
                continue;
            }
            match self.slots.iter().position(Option::is_none) {
                Some(slot) => {
                    info!("bond slot {} recovered from link keys", slot);
                    self.slots[slot] = Some(BondRecord::new(*address, "", now));
                    self.queue_store(slot);
                }
                None => warn!("no room to recover a bond from link keys"),
            }
        }
    }

    /// Bonded but name still unknown.
    pub fn needs_name(&self, address: &PeerAddress) -> bool {
        self.get(address).is_some_and(|r| !r.has_name())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hand over the queued flash work.
    pub fn take_pending(&mut self) -> PendingOps<N> {
        core::mem::replace(&mut self.pending, PendingOps::new())
    }

    fn stamp(&self, now: u64) -> u64 {
        self.stamp_base.saturating_add(now)
    }

    fn queue_store(&mut self, slot: usize) {
        if let Some(record) = self.slots[slot].clone() {
            self.pending.slots[slot] = Some(SlotOp::Store(record));
        }
    }
}

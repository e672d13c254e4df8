//! Per-address evidence gathered while scanning.
//!
//! A peripheral's HID UUID, NUS UUID and name can arrive in different
//! advertisement fragments (advertisement vs. scan response).  The pool
//! merges them per address until the candidate carries everything it needs.
//! Both tables recycle their least-recently-seen entry when full.

use super::adv_parser::ServiceSet;
use super::{device_name, DeviceName, PeerAddress};
use crate::config::{NAME_CACHE_SIZE, QUALIFICATION_POOL_SIZE};

/// Accumulated evidence for one advertising address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub address: PeerAddress,
    pub services: ServiceSet,
    pub name: Option<DeviceName>,
    pub rssi: i8,
    pub last_seen_ms: u64,
}

impl Candidate {
    /// True once every service in `required` has been advertised.
    pub fn has_all(&self, required: ServiceSet) -> bool {
        self.services.contains(required)
    }
}

/// Fixed-size table of [`Candidate`]s.
pub struct QualificationPool<const N: usize = QUALIFICATION_POOL_SIZE> {
    entries: [Option<Candidate>; N],
}

impl<const N: usize> Default for QualificationPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> QualificationPool<N> {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| None),
        }
    }

    /// Merge one fragment into the entry for `address`.
    ///
    /// Creates the entry if needed, reusing the stalest one when full.
    pub fn observe(
        &mut self,
        address: PeerAddress,
        services: ServiceSet,
        name: Option<&str>,
        rssi: i8,
        now_ms: u64,
    ) -> &Candidate {
        let idx = self.slot_for(&address);
        let entry = self.entries[idx].get_or_insert_with(|| Candidate {
            address,
            services: ServiceSet::empty(),
            name: None,
            rssi,
            last_seen_ms: now_ms,
        });
        entry.services.insert(services);
        if let Some(n) = name {
            entry.name = Some(device_name(n));
        }
        entry.rssi = rssi;
        entry.last_seen_ms = now_ms;
        entry
    }

    fn slot_for(&mut self, address: &PeerAddress) -> usize {
        if let Some(i) = self.position(address) {
            return i;
        }
        if let Some(i) = self.entries.iter().position(Option::is_none) {
            return i;
        }
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.as_ref().map_or(0, |c| c.last_seen_ms))
            .map_or(0, |(i, _)| i);
        debug!("qualification pool full, recycling slot {}", victim);
        self.entries[victim] = None;
        victim
    }

    fn position(&self, address: &PeerAddress) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|c| c.address == *address))
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&Candidate> {
        self.position(address)
            .and_then(|i| self.entries[i].as_ref())
    }

    pub fn forget(&mut self, address: &PeerAddress) {
        if let Some(i) = self.position(address) {
            self.entries[i] = None;
        }
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Names seen in advertisements, kept even for addresses that never
/// qualified so a later nameless fragment can still be labelled.
pub struct NameCache<const N: usize = NAME_CACHE_SIZE> {
    entries: [Option<(PeerAddress, DeviceName, u64)>; N],
}

impl<const N: usize> Default for NameCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> NameCache<N> {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| None),
        }
    }

    pub fn remember(&mut self, address: PeerAddress, name: &str, now_ms: u64) {
        let idx = self
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|(a, _, _)| *a == address))
            .or_else(|| self.entries.iter().position(Option::is_none))
            .unwrap_or_else(|| {
                self.entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.as_ref().map_or(0, |(_, _, t)| *t))
                    .map_or(0, |(i, _)| i)
            });
        self.entries[idx] = Some((address, device_name(name), now_ms));
    }

    pub fn lookup(&self, address: &PeerAddress) -> Option<&DeviceName> {
        self.entries.iter().flatten().find_map(|(a, n, _)| (a == address).then_some(n))
    }
}

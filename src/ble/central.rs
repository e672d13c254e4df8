//! BLE central connection manager.
//!
//! A synchronous state machine: the radio glue feeds it [`CentralEvent`]s
//! together with the current monotonic time, and it answers by issuing
//! requests through [`CentralRadio`] and queuing [`Notice`]s for the rest of
//! the firmware (USB bridge, flash task).
//!
//! ```text
//! Disconnected ──start──▶ Scanning ──qualified adv──▶ Connecting
//!      ▲                     ▲                            │
//!      │                     └───── connect failed ───────┤
//!      └────────── disconnected ◀── Connected ◀───────────┘
//! ```
//!
//! Only the primary peripheral (the HID mouthpiece) drives the top-level
//! state; accessory links come and go underneath it.

use heapless::Deque;

use super::adv_parser::{advertised_services, extract_device_name};
use super::device_class::{classify, DeviceClass};
use super::discovery::{ChainKind, DiscoveryOrchestrator, Outcome, Stage, Step};
use super::peers::{PeerConnection, PeerId, PeerTable};
use super::qualification::{NameCache, QualificationPool};
use super::{device_name, CentralRadio, DeviceName, LinkHandle, PeerAddress};
use crate::bonds::BondRegistry;
use crate::config::CentralConfig;
use crate::relay::LinkStatus;

/// Outstanding notices kept before the oldest is dropped.
pub const NOTICE_QUEUE_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CentralState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanMode {
    /// Reconnect to bonded peers, pairing a new one only when none shows up.
    Normal,
    /// Pair a new peer; bonded ones are ignored.
    Additional,
}

/// One received advertisement or scan-response fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvReport<'a> {
    pub address: PeerAddress,
    pub rssi: i8,
    pub connectable: bool,
    pub data: &'a [u8],
}

/// Inputs to the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CentralEvent<'a> {
    /// Radio is up; begin scanning.
    Start,
    Advertisement(AdvReport<'a>),
    /// The scan ended without being asked to.
    ScanStopped,
    Connected {
        link: LinkHandle,
        address: PeerAddress,
    },
    ConnectFailed {
        address: PeerAddress,
    },
    Disconnected {
        link: LinkHandle,
        reason: u8,
    },
    /// Link encrypted with existing keys.
    Encrypted {
        link: LinkHandle,
    },
    /// Pairing finished and a bond was stored.
    Bonded {
        link: LinkHandle,
    },
    SecurityFailed {
        link: LinkHandle,
    },
    Discovery {
        link: LinkHandle,
        stage: Stage,
        outcome: Outcome,
    },
    /// `None` if the exchange failed.
    MtuExchanged {
        link: LinkHandle,
        mtu: Option<u16>,
    },
    /// `None` if the sample failed.
    Rssi {
        link: LinkHandle,
        rssi: Option<i8>,
    },
    /// Device name read over GATT after connecting.
    PeerName {
        link: LinkHandle,
        name: &'a str,
    },
    /// Periodic housekeeping.
    Tick,
    RequestAdditionalPairing,
    ClearBonds,
}

/// Outputs of the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Notice {
    ScanStarted(ScanMode),
    Connected { peer: PeerId, class: DeviceClass },
    /// UART and HID both usable on the primary link.
    Ready { peer: PeerId },
    DiscoveryComplete { peer: PeerId },
    Disconnected { peer: PeerId, reason: u8 },
    /// Send the USB release-all burst.
    ReleaseInputs,
    /// Bond table has flash work pending.
    BondsChanged,
}

struct PendingLink {
    address: PeerAddress,
    class: DeviceClass,
    name: DeviceName,
    name_is_fallback: bool,
    rssi: i8,
}

#[derive(Clone, Copy)]
struct ScanSession {
    started_ms: u64,
    bonded_heard: bool,
}

impl ScanSession {
    fn new(now_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            bonded_heard: false,
        }
    }
}

pub struct ConnectionManager {
    config: CentralConfig,
    state: CentralState,
    mode: ScanMode,
    mode_since_ms: u64,
    scanning: bool,
    session: ScanSession,
    pending: Option<PendingLink>,
    pool: QualificationPool,
    names: NameCache,
    peers: PeerTable,
    discovery: DiscoveryOrchestrator,
    bonds: BondRegistry,
    notices: Deque<Notice, NOTICE_QUEUE_LEN>,
}

impl ConnectionManager {
    pub fn new(config: CentralConfig, bonds: BondRegistry) -> Self {
        Self {
            config,
            state: CentralState::Disconnected,
            mode: ScanMode::Normal,
            mode_since_ms: 0,
            scanning: false,
            session: ScanSession::new(0),
            pending: None,
            pool: QualificationPool::new(),
            names: NameCache::new(),
            peers: PeerTable::new(),
            discovery: DiscoveryOrchestrator::new(),
            bonds,
            notices: Deque::new(),
        }
    }

    pub fn state(&self) -> CentralState {
        self.state
    }

    pub fn scan_mode(&self) -> ScanMode {
        self.mode
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn bonds(&self) -> &BondRegistry {
        &self.bonds
    }

    pub fn bonds_mut(&mut self) -> &mut BondRegistry {
        &mut self.bonds
    }

    /// The connection whose HID input reaches USB.
    pub fn primary(&self) -> Option<&PeerConnection> {
        self.peers.default_peer()
    }

    /// Reports from `link` may be forwarded.
    pub fn is_link_active(&self, link: LinkHandle) -> bool {
        self.peers.by_link(link).is_some()
    }

    /// Link to write host UART data to, once its UART service is known.
    pub fn uart_link(&self) -> Option<LinkHandle> {
        self.primary()
            .filter(|p| p.readiness.uart)
            .map(|p| p.link)
    }

    pub fn status(&self) -> LinkStatus {
        match self.primary() {
            Some(p) => LinkStatus {
                connected: p.ready_signalled,
                rssi: p.rssi,
            },
            None => LinkStatus {
                connected: false,
                rssi: None,
            },
        }
    }

    pub fn next_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    /// Feed one event.
    pub fn handle<R: CentralRadio>(&mut self, event: CentralEvent<'_>, now_ms: u64, radio: &mut R) {
        match event {
            CentralEvent::Start => self.resume_scanning(now_ms, radio),
            CentralEvent::Advertisement(report) => self.on_advertisement(&report, now_ms, radio),
            CentralEvent::ScanStopped => {
                warn!("scan stopped by the radio");
                self.scanning = false;
                self.resume_scanning(now_ms, radio);
            }
            CentralEvent::Connected { link, address } => {
                self.on_connected(link, address, now_ms, radio)
            }
            CentralEvent::ConnectFailed { address } => {
                if self.pending.as_ref().is_some_and(|p| p.address == address) {
                    warn!("connection attempt failed");
                    self.pending = None;
                }
                self.resume_scanning(now_ms, radio);
            }
            CentralEvent::Disconnected { link, reason } => {
                self.on_disconnected(link, reason, now_ms, radio)
            }
            CentralEvent::Encrypted { link } => {
                if let Some(address) = self.address_of(link) {
                    info!("link encrypted");
                    self.bonds.touch(&address, now_ms);
                }
            }
            CentralEvent::Bonded { link } => self.on_bonded(link, now_ms, radio),
            CentralEvent::SecurityFailed { link } => {
                if self.is_link_active(link) {
                    warn!("link security failed, disconnecting");
                    if let Err(e) = radio.disconnect(link) {
                        warn!("disconnect request failed: {:?}", e);
                    }
                }
            }
            CentralEvent::Discovery {
                link,
                stage,
                outcome,
            } => self.on_discovery(link, stage, outcome, radio),
            CentralEvent::MtuExchanged { link, mtu } => self.on_mtu(link, mtu, radio),
            CentralEvent::Rssi { link, rssi } => {
                if let Some(peer) = self.peers.by_link(link).and_then(|id| self.peers.get_mut(id)) {
                    match rssi {
                        Some(v) => peer.rssi = Some(v),
                        None => debug!("rssi sample failed"),
                    }
                }
            }
            CentralEvent::PeerName { link, name } => self.on_peer_name(link, name, now_ms),
            CentralEvent::Tick => self.on_tick(now_ms, radio),
            CentralEvent::RequestAdditionalPairing => self.start_additional_pairing(now_ms, radio),
            CentralEvent::ClearBonds => self.clear_bonds(radio),
        }

        if self.bonds.has_pending() && !self.notices.iter().any(|n| *n == Notice::BondsChanged) {
            self.push(Notice::BondsChanged);
        }
    }

    fn push(&mut self, notice: Notice) {
        if self.notices.is_full() {
            warn!("notice queue full, dropping oldest");
            self.notices.pop_front();
        }
        let _ = self.notices.push_back(notice);
    }

    fn address_of(&self, link: LinkHandle) -> Option<PeerAddress> {
        let id = self.peers.by_link(link)?;
        self.peers.get(id).map(|p| p.address)
    }

    fn settle_state(&mut self) {
        self.state = if self.peers.default_id().is_some() {
            CentralState::Connected
        } else if self.pending.is_some() {
            CentralState::Connecting
        } else if self.scanning {
            CentralState::Scanning
        } else {
            CentralState::Disconnected
        };
    }

    // Scanning

    /// Accessories are only hunted while one arm is missing its partner.
    fn scan_needed(&self) -> bool {
        if self.pending.is_some() || self.peers.free_slots() == 0 {
            return false;
        }
        if self.primary().is_none() {
            return true;
        }
        let left = self.peers.by_class(DeviceClass::AccessoryLeft).is_some();
        let right = self.peers.by_class(DeviceClass::AccessoryRight).is_some();
        self.config.accessory_support && left != right
    }

    fn resume_scanning<R: CentralRadio>(&mut self, now_ms: u64, radio: &mut R) {
        if !self.scanning && self.scan_needed() {
            match radio.start_scan() {
                Ok(()) => {
                    info!("scanning ({:?})", self.mode);
                    self.scanning = true;
                    self.session = ScanSession::new(now_ms);
                    self.pool.clear();
                    self.push(Notice::ScanStarted(self.mode));
                }
                Err(e) => warn!("scan start failed: {:?}, retrying", e),
            }
        }
        self.settle_state();
    }

    fn stop_scanning<R: CentralRadio>(&mut self, radio: &mut R) {
        if self.scanning {
            if let Err(e) = radio.stop_scan() {
                warn!("scan stop failed: {:?}", e);
            }
            self.scanning = false;
        }
    }

    fn expire_additional_mode(&mut self, now_ms: u64) {
        if self.mode == ScanMode::Additional
            && now_ms.saturating_sub(self.mode_since_ms) >= self.config.additional_scan_timeout_ms
        {
            info!("additional pairing window closed");
            self.mode = ScanMode::Normal;
        }
    }

    /// Forget every bond and drop every link; peers must pair again.
    fn clear_bonds<R: CentralRadio>(&mut self, radio: &mut R) {
        self.bonds.clear_all();
        if let Err(e) = radio.delete_all_bonds() {
            warn!("could not delete link keys: {:?}", e);
        }
        for (_, peer) in self.peers.iter() {
            if let Err(e) = radio.disconnect(peer.link) {
                warn!("disconnect request failed: {:?}", e);
            }
        }
    }

    fn start_additional_pairing<R: CentralRadio>(&mut self, now_ms: u64, radio: &mut R) {
        info!("additional pairing requested");
        self.mode = ScanMode::Additional;
        self.mode_since_ms = now_ms;
        self.session = ScanSession::new(now_ms);
        self.pool.clear();
        if let Some(link) = self.primary().map(|p| p.link) {
            // the new peer needs the primary slot
            if let Err(e) = radio.disconnect(link) {
                warn!("disconnect request failed: {:?}", e);
            }
        } else if self.scanning {
            self.push(Notice::ScanStarted(self.mode));
        } else {
            self.resume_scanning(now_ms, radio);
        }
    }

    fn on_advertisement<R: CentralRadio>(
        &mut self,
        report: &AdvReport<'_>,
        now_ms: u64,
        radio: &mut R,
    ) {
        if !self.scanning || self.pending.is_some() {
            return;
        }
        self.expire_additional_mode(now_ms);

        let address = report.address;
        let adv_name = extract_device_name(report.data);
        if let Some(name) = &adv_name {
            self.names.remember(address, name, now_ms);
        }
        let bonded = self.bonds.is_bonded(&address);
        if bonded {
            self.session.bonded_heard = true;
        }
        if self.peers.by_address(&address).is_some() {
            return;
        }

        let services = advertised_services(report.data);
        let candidate = self
            .pool
            .observe(address, services, adv_name.as_deref(), report.rssi, now_ms)
            .clone();
        if !report.connectable {
            return;
        }

        let name = candidate
            .name
            .clone()
            .or_else(|| self.names.lookup(&address).cloned());
        let left_taken = self.peers.by_class(DeviceClass::AccessoryLeft).is_some();
        let class = classify(name.as_deref(), candidate.services, left_taken);
        if !self.class_wanted(class) || !candidate.has_all(class.required_services()) {
            return;
        }
        if class == DeviceClass::PrimaryPeripheral && !self.admits(bonded, now_ms) {
            return;
        }
        self.initiate(address, class, name, candidate.rssi, now_ms, radio);
    }

    fn class_wanted(&self, class: DeviceClass) -> bool {
        if self.peers.free_slots() == 0 {
            return false;
        }
        match class {
            DeviceClass::Unknown => false,
            DeviceClass::PrimaryPeripheral => self.primary().is_none(),
            DeviceClass::AccessoryLeft | DeviceClass::AccessoryRight => {
                self.config.accessory_support && self.peers.by_class(class).is_none()
            }
        }
    }

    /// Bonded-first admission for the primary slot.
    fn admits(&self, bonded: bool, now_ms: u64) -> bool {
        match self.mode {
            ScanMode::Additional => {
                if bonded {
                    debug!("additional pairing: skipping bonded peer");
                }
                !bonded
            }
            ScanMode::Normal => {
                if bonded || self.bonds.is_empty() {
                    return true;
                }
                let waited = now_ms.saturating_sub(self.session.started_ms)
                    >= self.config.bonded_preference_window_ms;
                !self.session.bonded_heard && waited
            }
        }
    }

    fn initiate<R: CentralRadio>(
        &mut self,
        address: PeerAddress,
        class: DeviceClass,
        name: Option<DeviceName>,
        rssi: i8,
        now_ms: u64,
        radio: &mut R,
    ) {
        let name = name.or_else(|| {
            self.bonds
                .get(&address)
                .filter(|r| r.has_name())
                .map(|r| r.name.clone())
        });
        let (name, name_is_fallback) = match name {
            Some(n) => (n, false),
            None => (address.short_name(), true),
        };

        self.stop_scanning(radio);
        match radio.connect(&address) {
            Ok(()) => {
                info!("connecting to {} ({:?})", name.as_str(), class);
                self.pool.forget(&address);
                self.pending = Some(PendingLink {
                    address,
                    class,
                    name,
                    name_is_fallback,
                    rssi,
                });
            }
            Err(e) => warn!("connect request failed: {:?}", e),
        }
        self.resume_scanning(now_ms, radio);
    }

    // Link lifecycle

    fn on_connected<R: CentralRadio>(
        &mut self,
        link: LinkHandle,
        address: PeerAddress,
        now_ms: u64,
        radio: &mut R,
    ) {
        let pending = match self.pending.take() {
            Some(p) if p.address == address => p,
            other => {
                self.pending = other;
                warn!("unexpected connection, dropping it");
                if let Err(e) = radio.disconnect(link) {
                    warn!("disconnect request failed: {:?}", e);
                }
                return;
            }
        };

        let class = pending.class;
        let mut peer = PeerConnection::new(link, address, class, pending.name);
        peer.name_is_fallback = pending.name_is_fallback;
        peer.rssi = Some(pending.rssi);
        peer.next_rssi_poll_ms = now_ms + self.config.rssi_poll_interval_ms;
        let id = match self.peers.insert(peer) {
            Ok(id) => id,
            Err(e) => {
                warn!("no room for new link: {:?}", e);
                if let Err(e) = radio.disconnect(link) {
                    warn!("disconnect request failed: {:?}", e);
                }
                self.resume_scanning(now_ms, radio);
                return;
            }
        };
        info!("connected as {:?}", class);
        self.push(Notice::Connected { peer: id, class });

        let chain = if class.is_accessory() {
            ChainKind::Accessory
        } else {
            self.peers.set_default(id);
            self.refresh_bond(id, now_ms);
            if let Err(e) = radio.exchange_mtu(link) {
                warn!("MTU exchange request failed: {:?}", e);
            }
            if let Err(e) = radio.request_security(link) {
                warn!("security request failed: {:?}, continuing discovery", e);
            }
            ChainKind::Primary
        };
        let step = self.discovery.begin(id, chain);
        self.run_step(id, step, radio);
        self.resume_scanning(now_ms, radio);
    }

    fn refresh_bond(&mut self, id: PeerId, now_ms: u64) {
        let Some(peer) = self.peers.get(id) else {
            return;
        };
        let address = peer.address;
        if !self.bonds.touch(&address, now_ms) {
            return;
        }
        if !peer.name_is_fallback && self.bonds.needs_name(&address) {
            let name = peer.name.clone();
            self.bonds.set_name(&address, &name);
        }
    }

    fn on_disconnected<R: CentralRadio>(
        &mut self,
        link: LinkHandle,
        reason: u8,
        now_ms: u64,
        radio: &mut R,
    ) {
        let Some(id) = self.peers.by_link(link) else {
            debug!("disconnect for unknown link");
            return;
        };
        self.discovery.cancel(id);
        self.peers.remove(id);
        info!("disconnected (reason {:#x})", reason);
        self.push(Notice::Disconnected { peer: id, reason });
        self.push(Notice::ReleaseInputs);
        self.resume_scanning(now_ms, radio);
    }

    fn on_bonded<R: CentralRadio>(&mut self, link: LinkHandle, now_ms: u64, radio: &mut R) {
        let Some(peer) = self.peers.by_link(link).and_then(|id| self.peers.get(id)) else {
            return;
        };
        let address = peer.address;
        let name = if peer.name_is_fallback {
            DeviceName::new()
        } else {
            peer.name.clone()
        };
        let outcome = self.bonds.upsert(address, &name, now_ms);
        if let Some(old) = outcome.evicted {
            if let Err(e) = radio.delete_bond(&old) {
                warn!("could not delete evicted link keys: {:?}", e);
            }
        }
        if self.mode == ScanMode::Additional {
            info!("new device bonded, back to normal scanning");
            self.mode = ScanMode::Normal;
        }
    }

    fn on_peer_name(&mut self, link: LinkHandle, name: &str, now_ms: u64) {
        if name.is_empty() {
            return;
        }
        let Some(peer) = self.peers.by_link(link).and_then(|id| self.peers.get_mut(id)) else {
            return;
        };
        if peer.name_is_fallback {
            peer.name = device_name(name);
            peer.name_is_fallback = false;
        }
        let address = peer.address;
        self.names.remember(address, name, now_ms);
        if self.bonds.needs_name(&address) {
            info!("filling in bonded device name");
            self.bonds.set_name(&address, name);
        }
    }

    // Discovery

    fn run_step<R: CentralRadio>(&mut self, id: PeerId, mut step: Step, radio: &mut R) {
        loop {
            let Some(link) = self.peers.get(id).map(|p| p.link) else {
                return;
            };
            let stage = match step {
                Step::Complete => {
                    info!("discovery complete");
                    self.push(Notice::DiscoveryComplete { peer: id });
                    return;
                }
                Step::Run(stage) => stage,
            };
            let issued = match stage {
                Stage::Mtu => radio.exchange_mtu(link),
                _ => radio.discover(link, stage),
            };
            match issued {
                Ok(()) => return,
                Err(e) => {
                    warn!("could not start {:?}: {:?}", stage, e);
                    match self.discovery.advance(id, stage, Outcome::Error) {
                        Some(next) => step = next,
                        None => return,
                    }
                }
            }
        }
    }

    fn on_discovery<R: CentralRadio>(
        &mut self,
        link: LinkHandle,
        stage: Stage,
        outcome: Outcome,
        radio: &mut R,
    ) {
        let Some(id) = self.peers.by_link(link) else {
            debug!("discovery result for a closed link");
            return;
        };
        let Some(step) = self.discovery.advance(id, stage, outcome) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(id) {
            if outcome == Outcome::Found {
                peer.readiness.mark(stage);
            }
            let primary = peer.class == DeviceClass::PrimaryPeripheral;
            if primary && peer.readiness.is_ready() && !peer.ready_signalled {
                peer.ready_signalled = true;
                info!("UART and HID ready");
                self.push(Notice::Ready { peer: id });
            }
        }
        self.run_step(id, step, radio);
    }

    fn on_mtu<R: CentralRadio>(&mut self, link: LinkHandle, mtu: Option<u16>, radio: &mut R) {
        let Some(id) = self.peers.by_link(link) else {
            return;
        };
        match (mtu, self.peers.get_mut(id)) {
            (Some(m), Some(peer)) => {
                info!("ATT MTU {}", m);
                peer.mtu = m;
            }
            _ => warn!("MTU exchange failed"),
        }
        if self.discovery.current(id) == Some(Stage::Mtu) {
            let outcome = if mtu.is_some() {
                Outcome::Found
            } else {
                Outcome::Error
            };
            self.on_discovery(link, Stage::Mtu, outcome, radio);
        }
    }

    // Housekeeping

    fn on_tick<R: CentralRadio>(&mut self, now_ms: u64, radio: &mut R) {
        self.expire_additional_mode(now_ms);
        let interval = self.config.rssi_poll_interval_ms;
        for (_, peer) in self.peers.iter_mut() {
            if now_ms >= peer.next_rssi_poll_ms {
                peer.next_rssi_poll_ms = now_ms + interval;
                if let Err(e) = radio.request_rssi(peer.link) {
                    debug!("rssi request failed: {:?}", e);
                }
            }
        }
        if !self.scanning {
            self.resume_scanning(now_ms, radio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adv_parser::{
        AD_TYPE_COMPLETE_NAME, AD_TYPE_COMPLETE_UUID128, AD_TYPE_COMPLETE_UUID16,
        NUS_SERVICE_UUID128,
    };
    use crate::ble::AddressKind;
    use crate::error::BleError;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        StartScan,
        StopScan,
        Connect(PeerAddress),
        Disconnect(LinkHandle),
        Security(LinkHandle),
        Discover(LinkHandle, Stage),
        Mtu(LinkHandle),
        Rssi(LinkHandle),
        DeleteBond(PeerAddress),
        DeleteAll,
    }

    #[derive(Default)]
    struct FakeRadio {
        calls: Vec<Call>,
        fail_security: bool,
        fail_discover: Option<Stage>,
    }

    impl FakeRadio {
        fn take(&mut self) -> Vec<Call> {
            core::mem::take(&mut self.calls)
        }
    }

    impl CentralRadio for FakeRadio {
        fn start_scan(&mut self) -> Result<(), BleError> {
            self.calls.push(Call::StartScan);
            Ok(())
        }
        fn stop_scan(&mut self) -> Result<(), BleError> {
            self.calls.push(Call::StopScan);
            Ok(())
        }
        fn connect(&mut self, address: &PeerAddress) -> Result<(), BleError> {
            self.calls.push(Call::Connect(*address));
            Ok(())
        }
        fn disconnect(&mut self, link: LinkHandle) -> Result<(), BleError> {
            self.calls.push(Call::Disconnect(link));
            Ok(())
        }
        fn request_security(&mut self, link: LinkHandle) -> Result<(), BleError> {
            self.calls.push(Call::Security(link));
            if self.fail_security {
                Err(BleError::SecurityFailed)
            } else {
                Ok(())
            }
        }
        fn discover(&mut self, link: LinkHandle, stage: Stage) -> Result<(), BleError> {
            self.calls.push(Call::Discover(link, stage));
            if self.fail_discover == Some(stage) {
                Err(BleError::DiscoveryFailed)
            } else {
                Ok(())
            }
        }
        fn exchange_mtu(&mut self, link: LinkHandle) -> Result<(), BleError> {
            self.calls.push(Call::Mtu(link));
            Ok(())
        }
        fn request_rssi(&mut self, link: LinkHandle) -> Result<(), BleError> {
            self.calls.push(Call::Rssi(link));
            Ok(())
        }
        fn delete_bond(&mut self, address: &PeerAddress) -> Result<(), BleError> {
            self.calls.push(Call::DeleteBond(*address));
            Ok(())
        }
        fn delete_all_bonds(&mut self) -> Result<(), BleError> {
            self.calls.push(Call::DeleteAll);
            Ok(())
        }
    }

    const LINK: LinkHandle = LinkHandle(1);

    fn addr(n: u8) -> PeerAddress {
        PeerAddress::new(AddressKind::RandomStatic, [n, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE])
    }

    fn hid_fragment() -> Vec<u8> {
        vec![0x03, AD_TYPE_COMPLETE_UUID16, 0x12, 0x18]
    }

    fn nus_fragment(name: &str) -> Vec<u8> {
        let mut ad = vec![17, AD_TYPE_COMPLETE_UUID128];
        ad.extend_from_slice(&NUS_SERVICE_UUID128);
        if !name.is_empty() {
            ad.push(name.len() as u8 + 1);
            ad.push(AD_TYPE_COMPLETE_NAME);
            ad.extend_from_slice(name.as_bytes());
        }
        ad
    }

    fn full_adv(name: &str) -> Vec<u8> {
        let mut ad = hid_fragment();
        ad.extend_from_slice(&nus_fragment(name));
        ad
    }

    fn adv<'a>(address: PeerAddress, data: &'a [u8]) -> CentralEvent<'a> {
        CentralEvent::Advertisement(AdvReport {
            address,
            rssi: -55,
            connectable: true,
            data,
        })
    }

    fn started(bonds: BondRegistry) -> (ConnectionManager, FakeRadio) {
        let mut m = ConnectionManager::new(CentralConfig::default(), bonds);
        let mut r = FakeRadio::default();
        m.handle(CentralEvent::Start, 0, &mut r);
        (m, r)
    }

    fn drain(m: &mut ConnectionManager) -> Vec<Notice> {
        core::iter::from_fn(|| m.next_notice()).collect()
    }

    /// Scan, qualify and connect `address` as the primary peripheral.
    fn connect_primary(m: &mut ConnectionManager, r: &mut FakeRadio, address: PeerAddress, now: u64) {
        let data = full_adv("MouthPad");
        m.handle(adv(address, &data), now, r);
        m.handle(CentralEvent::Connected { link: LINK, address }, now + 10, r);
    }

    #[test]
    fn start_scans_in_normal_mode() {
        let (mut m, mut r) = started(BondRegistry::new());
        assert_eq!(m.state(), CentralState::Scanning);
        assert_eq!(r.take(), vec![Call::StartScan]);
        assert_eq!(drain(&mut m), vec![Notice::ScanStarted(ScanMode::Normal)]);
    }

    #[test]
    fn fragments_qualify_across_adverts() {
        let (mut m, mut r) = started(BondRegistry::new());
        r.take();
        let hid = hid_fragment();
        m.handle(adv(addr(1), &hid), 5, &mut r);
        assert_eq!(m.state(), CentralState::Scanning);
        let nus = nus_fragment("MouthPad");
        m.handle(adv(addr(1), &nus), 6, &mut r);
        assert_eq!(m.state(), CentralState::Connecting);
        assert_eq!(r.take(), vec![Call::StopScan, Call::Connect(addr(1))]);
    }

    #[test]
    fn non_connectable_fragment_does_not_connect() {
        let (mut m, mut r) = started(BondRegistry::new());
        let data = full_adv("MouthPad");
        m.handle(
            CentralEvent::Advertisement(AdvReport {
                address: addr(1),
                rssi: -40,
                connectable: false,
                data: &data,
            }),
            5,
            &mut r,
        );
        assert_eq!(m.state(), CentralState::Scanning);
        // evidence is kept; the next connectable fragment completes it
        let empty: [u8; 0] = [];
        m.handle(adv(addr(1), &empty), 6, &mut r);
        assert_eq!(m.state(), CentralState::Connecting);
    }

    #[test]
    fn hid_only_device_is_not_qualified() {
        let (mut m, mut r) = started(BondRegistry::new());
        let hid = hid_fragment();
        m.handle(adv(addr(1), &hid), 5, &mut r);
        assert_eq!(m.state(), CentralState::Scanning);
    }

    #[test]
    fn connect_runs_security_mtu_and_primary_chain() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 5);
        assert_eq!(m.state(), CentralState::Connected);
        let calls = r.take();
        assert!(calls.contains(&Call::Mtu(LINK)));
        assert!(calls.contains(&Call::Security(LINK)));
        assert_eq!(calls.last(), Some(&Call::Discover(LINK, Stage::Uart)));
        let notices = drain(&mut m);
        assert!(notices.contains(&Notice::Connected {
            peer: PeerId::new(0),
            class: DeviceClass::PrimaryPeripheral
        }));
    }

    #[test]
    fn failed_security_request_still_discovers() {
        let (mut m, mut r) = started(BondRegistry::new());
        r.fail_security = true;
        connect_primary(&mut m, &mut r, addr(1), 5);
        assert_eq!(r.take().last(), Some(&Call::Discover(LINK, Stage::Uart)));
        assert_eq!(m.state(), CentralState::Connected);
    }

    #[test]
    fn ready_fires_once_after_uart_and_hid() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 5);
        drain(&mut m);
        let disc = |stage, outcome| CentralEvent::Discovery {
            link: LINK,
            stage,
            outcome,
        };
        m.handle(disc(Stage::Uart, Outcome::Found), 20, &mut r);
        assert!(!m.status().connected);
        assert_eq!(m.uart_link(), Some(LINK));
        m.handle(disc(Stage::Hid, Outcome::Found), 21, &mut r);
        m.handle(disc(Stage::Battery, Outcome::NotFound), 22, &mut r);
        m.handle(disc(Stage::DeviceInfo, Outcome::Error), 23, &mut r);
        let notices = drain(&mut m);
        let peer = PeerId::new(0);
        assert_eq!(
            notices,
            vec![Notice::Ready { peer }, Notice::DiscoveryComplete { peer }]
        );
        assert!(m.status().connected);
    }

    #[test]
    fn discovery_start_failure_advances_chain() {
        let (mut m, mut r) = started(BondRegistry::new());
        r.fail_discover = Some(Stage::Hid);
        connect_primary(&mut m, &mut r, addr(1), 5);
        r.take();
        m.handle(
            CentralEvent::Discovery {
                link: LINK,
                stage: Stage::Uart,
                outcome: Outcome::Found,
            },
            20,
            &mut r,
        );
        assert_eq!(
            r.take(),
            vec![
                Call::Discover(LINK, Stage::Hid),
                Call::Discover(LINK, Stage::Battery)
            ]
        );
    }

    #[test]
    fn disconnect_releases_inputs_and_rescans() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 5);
        drain(&mut m);
        r.take();
        m.handle(
            CentralEvent::Disconnected {
                link: LINK,
                reason: 0x13,
            },
            100,
            &mut r,
        );
        assert!(!m.is_link_active(LINK));
        assert_eq!(m.state(), CentralState::Scanning);
        assert_eq!(r.take(), vec![Call::StartScan]);
        let notices = drain(&mut m);
        assert_eq!(notices[0], Notice::Disconnected {
            peer: PeerId::new(0),
            reason: 0x13
        });
        assert_eq!(notices[1], Notice::ReleaseInputs);
    }

    #[test]
    fn late_discovery_after_disconnect_is_ignored() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 5);
        m.handle(CentralEvent::Disconnected { link: LINK, reason: 8 }, 50, &mut r);
        r.take();
        drain(&mut m);
        m.handle(
            CentralEvent::Discovery {
                link: LINK,
                stage: Stage::Uart,
                outcome: Outcome::Found,
            },
            60,
            &mut r,
        );
        assert!(r.take().is_empty());
        assert!(drain(&mut m).is_empty());
    }

    #[test]
    fn connect_failure_returns_to_scanning() {
        let (mut m, mut r) = started(BondRegistry::new());
        let data = full_adv("MouthPad");
        m.handle(adv(addr(1), &data), 5, &mut r);
        r.take();
        m.handle(CentralEvent::ConnectFailed { address: addr(1) }, 50, &mut r);
        assert_eq!(m.state(), CentralState::Scanning);
        assert_eq!(r.take(), vec![Call::StartScan]);
    }

    #[test]
    fn bonded_peer_preferred_during_window() {
        let mut bonds = BondRegistry::new();
        bonds.upsert(addr(1), "Mine", 0);
        let (mut m, mut r) = started(bonds);
        let data = full_adv("Stranger");
        m.handle(adv(addr(2), &data), 1_000, &mut r);
        assert_eq!(m.state(), CentralState::Scanning);
        let mine = full_adv("Mine");
        m.handle(adv(addr(1), &mine), 1_100, &mut r);
        assert_eq!(m.state(), CentralState::Connecting);
        assert!(r.take().contains(&Call::Connect(addr(1))));
    }

    #[test]
    fn unbonded_peer_accepted_after_window_if_no_bonded_heard() {
        let mut bonds = BondRegistry::new();
        bonds.upsert(addr(1), "Mine", 0);
        let (mut m, mut r) = started(bonds);
        let data = full_adv("Stranger");
        m.handle(adv(addr(2), &data), 3_500, &mut r);
        assert_eq!(m.state(), CentralState::Connecting);
        assert!(r.take().contains(&Call::Connect(addr(2))));
    }

    #[test]
    fn unbonded_peer_rejected_once_bonded_heard() {
        let mut bonds = BondRegistry::new();
        bonds.upsert(addr(1), "Mine", 0);
        let (mut m, mut r) = started(bonds);
        // bonded device heard, but its fragment is not connectable
        let mine = full_adv("Mine");
        m.handle(
            CentralEvent::Advertisement(AdvReport {
                address: addr(1),
                rssi: -70,
                connectable: false,
                data: &mine,
            }),
            100,
            &mut r,
        );
        let data = full_adv("Stranger");
        m.handle(adv(addr(2), &data), 5_000, &mut r);
        assert_eq!(m.state(), CentralState::Scanning);
    }

    #[test]
    fn additional_mode_ignores_bonded_and_times_out() {
        let mut bonds = BondRegistry::new();
        bonds.upsert(addr(1), "Mine", 0);
        let (mut m, mut r) = started(bonds);
        m.handle(CentralEvent::RequestAdditionalPairing, 100, &mut r);
        assert_eq!(m.scan_mode(), ScanMode::Additional);
        let mine = full_adv("Mine");
        m.handle(adv(addr(1), &mine), 200, &mut r);
        assert_eq!(m.state(), CentralState::Scanning);
        m.handle(CentralEvent::Tick, 10_100, &mut r);
        assert_eq!(m.scan_mode(), ScanMode::Normal);
    }

    #[test]
    fn additional_mode_ends_on_bonding_and_evicts() {
        let mut bonds = BondRegistry::new();
        for i in 1..=4 {
            bonds.upsert(addr(i), "old", i as u64);
        }
        let (mut m, mut r) = started(bonds);
        m.handle(CentralEvent::RequestAdditionalPairing, 100, &mut r);
        connect_primary(&mut m, &mut r, addr(9), 200);
        r.take();
        m.handle(CentralEvent::Bonded { link: LINK }, 300, &mut r);
        assert_eq!(m.scan_mode(), ScanMode::Normal);
        assert!(m.bonds().is_bonded(&addr(9)));
        assert!(!m.bonds().is_bonded(&addr(1)));
        assert_eq!(r.take(), vec![Call::DeleteBond(addr(1))]);
        assert!(drain(&mut m).contains(&Notice::BondsChanged));
    }

    #[test]
    fn additional_pairing_while_connected_drops_primary() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 5);
        r.take();
        m.handle(CentralEvent::RequestAdditionalPairing, 50, &mut r);
        assert_eq!(r.take(), vec![Call::Disconnect(LINK)]);
    }

    #[test]
    fn security_failure_disconnects() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 5);
        r.take();
        m.handle(CentralEvent::SecurityFailed { link: LINK }, 50, &mut r);
        assert_eq!(r.take(), vec![Call::Disconnect(LINK)]);
    }

    #[test]
    fn address_fallback_name_then_filled_in() {
        let (mut m, mut r) = started(BondRegistry::new());
        let data = full_adv("");
        m.handle(adv(addr(1), &data), 5, &mut r);
        m.handle(
            CentralEvent::Connected {
                link: LINK,
                address: addr(1),
            },
            10,
            &mut r,
        );
        assert_eq!(m.primary().unwrap().name, addr(1).short_name());
        m.handle(CentralEvent::Bonded { link: LINK }, 20, &mut r);
        assert!(m.bonds().needs_name(&addr(1)));
        m.handle(
            CentralEvent::PeerName {
                link: LINK,
                name: "MouthPad",
            },
            30,
            &mut r,
        );
        assert_eq!(m.primary().unwrap().name.as_str(), "MouthPad");
        assert!(!m.bonds().needs_name(&addr(1)));
    }

    #[test]
    fn cached_name_used_when_qualifying_fragment_has_none() {
        let (mut m, mut r) = started(BondRegistry::new());
        let named = [5, AD_TYPE_COMPLETE_NAME, b'M', b'P', b'a', b'd'];
        m.handle(
            CentralEvent::Advertisement(AdvReport {
                address: addr(1),
                rssi: -50,
                connectable: false,
                data: &named,
            }),
            5,
            &mut r,
        );
        let data = full_adv("");
        m.handle(adv(addr(1), &data), 6, &mut r);
        m.handle(
            CentralEvent::Connected {
                link: LINK,
                address: addr(1),
            },
            10,
            &mut r,
        );
        assert_eq!(m.primary().unwrap().name.as_str(), "MPad");
    }

    #[test]
    fn rssi_polled_on_interval() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 0);
        r.take();
        m.handle(CentralEvent::Tick, 500, &mut r);
        assert!(!r.take().contains(&Call::Rssi(LINK)));
        m.handle(CentralEvent::Tick, 1_010, &mut r);
        assert_eq!(r.take(), vec![Call::Rssi(LINK)]);
        m.handle(
            CentralEvent::Rssi {
                link: LINK,
                rssi: Some(-66),
            },
            1_020,
            &mut r,
        );
        assert_eq!(m.status().rssi, Some(-66));
    }

    #[test]
    fn accessories_use_short_chain_and_do_not_take_primary() {
        let (mut m, mut r) = started(BondRegistry::new());
        let left = nus_fragment("Even G1_7_L_39");
        m.handle(adv(addr(5), &left), 5, &mut r);
        assert!(r.take().contains(&Call::Connect(addr(5))));
        let arm = LinkHandle(7);
        m.handle(
            CentralEvent::Connected {
                link: arm,
                address: addr(5),
            },
            10,
            &mut r,
        );
        assert!(m.primary().is_none());
        let calls = r.take();
        assert!(calls.contains(&Call::Discover(arm, Stage::Uart)));
        assert!(!calls.contains(&Call::Security(arm)));
        // still hunting for the primary
        assert!(m.is_scanning());
        m.handle(
            CentralEvent::Discovery {
                link: arm,
                stage: Stage::Uart,
                outcome: Outcome::Found,
            },
            20,
            &mut r,
        );
        assert_eq!(r.take(), vec![Call::Mtu(arm)]);
        m.handle(CentralEvent::MtuExchanged { link: arm, mtu: Some(247) }, 30, &mut r);
        let notices = drain(&mut m);
        assert!(notices.contains(&Notice::DiscoveryComplete { peer: PeerId::new(0) }));
        assert!(!notices.iter().any(|n| matches!(n, Notice::Ready { .. })));
    }

    #[test]
    fn clear_bonds_wipes_registry_and_keys() {
        let mut bonds = BondRegistry::new();
        bonds.upsert(addr(1), "Mine", 0);
        let (mut m, mut r) = started(bonds);
        r.take();
        drain(&mut m);
        m.handle(CentralEvent::ClearBonds, 10, &mut r);
        assert!(m.bonds().is_empty());
        assert_eq!(r.take(), vec![Call::DeleteAll]);
        assert_eq!(drain(&mut m), vec![Notice::BondsChanged]);
    }

    #[test]
    fn clear_bonds_drops_every_link() {
        let (mut m, mut r) = started(BondRegistry::new());
        connect_primary(&mut m, &mut r, addr(1), 0);
        r.take();
        m.handle(CentralEvent::ClearBonds, 50, &mut r);
        assert_eq!(r.take(), vec![Call::DeleteAll, Call::Disconnect(LINK)]);
    }
}

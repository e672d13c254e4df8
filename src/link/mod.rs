//! SoftDevice central glue.
//!
//! The connection manager from the library is synchronous; this module is
//! where radio callbacks are turned into [`CentralEvent`]s and where the
//! manager's requests are turned into work for the async tasks:
//!
//! - [`scanner`] runs the GAP scan while the manager wants one;
//! - [`slot`] owns one `Connection` per task and performs security,
//!   discovery, MTU and RSSI requests for it;
//! - [`bonder`] is the SoftDevice security handler holding link keys.
//!
//! All shared state sits behind one critical-section mutex.  Nothing awaits
//! while holding it; requests leave through channels and signals.

pub mod bonder;
pub mod clients;
pub mod scanner;
pub mod slot;

use core::cell::RefCell;

use defmt::{debug, info, warn};
use embassy_nrf::usb::vbus_detect::SoftwareVbusDetect;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant, Ticker};
use heapless::Vec;
use nrf_softdevice::ble::{Address, AddressType};
use nrf_softdevice::{raw, SocEvent, Softdevice};

use mouthpad_usb::ble::central::{CentralEvent, ConnectionManager, Notice};
use mouthpad_usb::ble::discovery::Stage;
use mouthpad_usb::ble::{AddressKind, CentralRadio, LinkHandle, PeerAddress};
use mouthpad_usb::bridge::{PeerUart, UsbBridge};
use mouthpad_usb::config::{BLE_ATT_MTU, MAX_CONNECTIONS};
use mouthpad_usb::error::BleError;

use self::scanner::ScanControl;
use self::slot::{SlotCommand, NUS_WRITE_MAX};
use crate::{storage, usb};

/// Housekeeping period for RSSI polls and scan retries.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// State touched by both the radio tasks and the USB tasks.
pub struct Shared {
    pub manager: ConnectionManager,
    pub bridge: UsbBridge,
}

static SHARED: Mutex<CriticalSectionRawMutex, RefCell<Option<Shared>>> =
    Mutex::new(RefCell::new(None));

/// Hand the manager to the glue.  Called once from `main`.
pub fn install(manager: ConnectionManager) {
    SHARED.lock(|cell| {
        cell.replace(Some(Shared {
            manager,
            bridge: UsbBridge::new(),
        }))
    });
}

/// Run `f` on the shared state.  `None` before [`install`].
pub fn with_shared<R>(f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
    SHARED.lock(|cell| cell.borrow_mut().as_mut().map(f))
}

pub fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// Feed one radio event to the connection manager and route its notices.
pub fn dispatch(event: CentralEvent<'_>) {
    let handled = with_shared(|shared| {
        shared.manager.handle(event, now_ms(), &mut LinkRadio);
        route_notices(&mut shared.manager);
    });
    if handled.is_none() {
        warn!("radio event before the manager was installed");
    }
}

/// Act on everything the manager has queued for the outside world.
pub fn route_notices(manager: &mut ConnectionManager) {
    while let Some(notice) = manager.next_notice() {
        match notice {
            Notice::ReleaseInputs => usb::request_release(),
            Notice::BondsChanged => storage::request_flush(),
            Notice::Ready { peer } => info!("peer {} ready for input", peer.index()),
            Notice::DiscoveryComplete { peer } => {
                info!("peer {} discovery complete", peer.index())
            }
            other => debug!("notice: {}", other),
        }
    }
}

/// Periodic [`CentralEvent::Tick`] source.
#[embassy_executor::task]
pub async fn tick_task() -> ! {
    let mut ticker = Ticker::every(TICK_INTERVAL);
    loop {
        ticker.next().await;
        dispatch(CentralEvent::Tick);
    }
}

/// Runs the SoftDevice event loop and forwards USB power events to the
/// USB driver's VBUS detector.
#[embassy_executor::task]
pub async fn softdevice_task(sd: &'static Softdevice, vbus: &'static SoftwareVbusDetect) -> ! {
    unsafe {
        raw::sd_power_usbpwrrdy_enable(1);
        raw::sd_power_usbdetected_enable(1);
        raw::sd_power_usbremoved_enable(1);
    }
    info!("SoftDevice running");
    sd.run_with_callback(|event| match event {
        SocEvent::PowerUsbDetected => vbus.detected(true),
        SocEvent::PowerUsbRemoved => vbus.detected(false),
        SocEvent::PowerUsbPowerReady => vbus.ready(),
        _ => {}
    })
    .await
}

/// Enable the SoftDevice for central-only operation with room for every
/// link the manager may hold.
pub fn init_softdevice() -> &'static mut Softdevice {
    let config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_XTAL as u8,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_20_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: MAX_CONNECTIONS as u8,
            event_length: 6,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: BLE_ATT_MTU }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 0,
            periph_role_count: 0,
            central_role_count: MAX_CONNECTIONS as u8,
            central_sec_count: MAX_CONNECTIONS as u8,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        ..Default::default()
    };
    Softdevice::enable(&config)
}

// Address conversions

pub fn peer_address(address: Address) -> PeerAddress {
    let kind = match address.address_type() {
        AddressType::Public => AddressKind::Public,
        AddressType::RandomStatic => AddressKind::RandomStatic,
        AddressType::RandomPrivateResolvable => AddressKind::RandomPrivateResolvable,
        AddressType::RandomPrivateNonResolvable | AddressType::Anonymous => {
            AddressKind::RandomPrivateNonResolvable
        }
    };
    PeerAddress::new(kind, address.bytes())
}

pub fn sd_address(address: &PeerAddress) -> Address {
    let kind = match address.kind {
        AddressKind::Public => AddressType::Public,
        AddressKind::RandomStatic => AddressType::RandomStatic,
        AddressKind::RandomPrivateResolvable => AddressType::RandomPrivateResolvable,
        AddressKind::RandomPrivateNonResolvable => AddressType::RandomPrivateNonResolvable,
    };
    Address::new(kind, address.bytes)
}

/// [`CentralRadio`] for the firmware: every request becomes a message for
/// the scanner or the slot task that owns the link.
pub struct LinkRadio;

impl LinkRadio {
    fn to_link(&self, link: LinkHandle, cmd: SlotCommand) -> Result<(), BleError> {
        let slot = slot::slot_of(link).ok_or(BleError::NotConnected)?;
        slot::send(slot, cmd)
    }
}

impl CentralRadio for LinkRadio {
    fn start_scan(&mut self) -> Result<(), BleError> {
        scanner::control(ScanControl::Start);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), BleError> {
        scanner::control(ScanControl::Stop);
        Ok(())
    }

    fn connect(&mut self, address: &PeerAddress) -> Result<(), BleError> {
        let slot = slot::claim(address).ok_or(BleError::NoFreeSlot)?;
        slot::send(slot, SlotCommand::Connect(*address)).inspect_err(|_| slot::release(slot))
    }

    fn disconnect(&mut self, link: LinkHandle) -> Result<(), BleError> {
        self.to_link(link, SlotCommand::Disconnect)
    }

    fn request_security(&mut self, link: LinkHandle) -> Result<(), BleError> {
        self.to_link(link, SlotCommand::Secure)
    }

    fn discover(&mut self, link: LinkHandle, stage: Stage) -> Result<(), BleError> {
        self.to_link(link, SlotCommand::Discover(stage))
    }

    fn exchange_mtu(&mut self, link: LinkHandle) -> Result<(), BleError> {
        self.to_link(link, SlotCommand::ExchangeMtu)
    }

    fn request_rssi(&mut self, link: LinkHandle) -> Result<(), BleError> {
        self.to_link(link, SlotCommand::ReadRssi)
    }

    fn delete_bond(&mut self, address: &PeerAddress) -> Result<(), BleError> {
        bonder::bonder().forget(address);
        storage::request_flush();
        Ok(())
    }

    fn delete_all_bonds(&mut self) -> Result<(), BleError> {
        bonder::bonder().forget_all();
        storage::request_flush();
        Ok(())
    }
}

impl PeerUart for LinkRadio {
    fn send(&mut self, link: LinkHandle, data: &[u8]) -> Result<(), BleError> {
        let slot = slot::slot_of(link).ok_or(BleError::NotConnected)?;
        for chunk in data.chunks(NUS_WRITE_MAX) {
            let chunk = Vec::from_slice(chunk).map_err(|_| BleError::Busy)?;
            slot::send(slot, SlotCommand::UartWrite(chunk))?;
        }
        Ok(())
    }
}

//! GATT clients for the services a MouthPad exposes.
//!
//! NUS, Battery and Device Information are plain `gatt_client` structs.
//! HID is discovered by hand: it has one Report characteristic per report
//! ID, each tagged by a Report Reference descriptor, which the derive
//! macro cannot express.

use core::cell::OnceCell;

use defmt::{debug, info, warn};
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, Characteristic, Client, Descriptor, DiscoverError};
use nrf_softdevice::ble::{Connection, HvxType, Uuid};

use mouthpad_usb::error::BleError;
use mouthpad_usb::hid::protocol_mode::{negotiate, ProtocolDecision, ProtocolMode};

/// Largest NUS notification we accept (ATT MTU 247 minus header).
pub const NUS_NOTIFY_MAX: usize = 244;

/// Largest HID notification copied out of the event; the translator
/// drops anything that does not fit a USB report.
pub const HID_NOTIFY_MAX: usize = 32;

/// Report characteristics tracked per HID service.
const MAX_HID_REPORTS: usize = 8;

const UUID_HID_REPORT: Uuid = Uuid::new_16(0x2a4d);
const UUID_PROTOCOL_MODE: Uuid = Uuid::new_16(0x2a4e);
const UUID_BOOT_MOUSE_INPUT: Uuid = Uuid::new_16(0x2a33);
const UUID_CCCD: Uuid = Uuid::new_16(0x2902);
const UUID_REPORT_REFERENCE: Uuid = Uuid::new_16(0x2908);

const REPORT_TYPE_INPUT: u8 = 1;
const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];

/// Nordic UART Service.
#[nrf_softdevice::gatt_client(uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e")]
pub struct NusClient {
    /// Host → peer.
    #[characteristic(uuid = "6e400002-b5a3-f393-e0a9-e50e24dcca9e", write, write_without_response)]
    pub rx: Vec<u8, NUS_NOTIFY_MAX>,

    /// Peer → host.
    #[characteristic(uuid = "6e400003-b5a3-f393-e0a9-e50e24dcca9e", notify)]
    pub tx: Vec<u8, NUS_NOTIFY_MAX>,
}

#[nrf_softdevice::gatt_client(uuid = "180f")]
pub struct BatteryClient {
    #[characteristic(uuid = "2a19", read, notify)]
    pub battery_level: u8,
}

#[nrf_softdevice::gatt_client(uuid = "180a")]
pub struct DeviceInfoClient {
    #[characteristic(uuid = "2a29", read)]
    pub manufacturer_name: Vec<u8, 32>,

    #[characteristic(uuid = "2a24", read)]
    pub model_number: Vec<u8, 32>,
}

struct ReportChar {
    value: u16,
    cccd: Option<u16>,
    reference: Option<u16>,
    /// Filled from the Report Reference descriptor.
    report_id: u8,
    input: bool,
}

/// Notification from the HID service.
pub enum HidEvent {
    Input {
        report_id: u8,
        data: Vec<u8, HID_NOTIFY_MAX>,
    },
    BootMouse(Vec<u8, HID_NOTIFY_MAX>),
}

/// HID-over-GATT client (service 0x1812).
pub struct HidClient {
    conn: Connection,
    reports: Vec<ReportChar, MAX_HID_REPORTS>,
    /// Boot Mouse Input value and CCCD handles.
    boot_mouse: Option<(u16, Option<u16>)>,
    protocol_mode: Option<u16>,
    mode: ProtocolMode,
}

fn find_descriptor(descriptors: &[Descriptor], uuid: Uuid) -> Option<u16> {
    descriptors
        .iter()
        .find(|d| d.uuid == Some(uuid))
        .map(|d| d.handle)
}

impl Client for HidClient {
    type Event = HidEvent;

    fn uuid() -> Uuid {
        Uuid::new_16(0x1812)
    }

    fn new_undiscovered(conn: Connection) -> Self {
        Self {
            conn,
            reports: Vec::new(),
            boot_mouse: None,
            protocol_mode: None,
            mode: ProtocolMode::Report,
        }
    }

    fn discovered_characteristic(&mut self, characteristic: &Characteristic, descriptors: &[Descriptor]) {
        let uuid = characteristic.uuid;
        if uuid == Some(UUID_HID_REPORT) {
            let report = ReportChar {
                value: characteristic.handle_value,
                cccd: find_descriptor(descriptors, UUID_CCCD),
                reference: find_descriptor(descriptors, UUID_REPORT_REFERENCE),
                report_id: 0,
                input: false,
            };
            if self.reports.push(report).is_err() {
                warn!("too many HID report characteristics, ignoring one");
            }
        } else if uuid == Some(UUID_BOOT_MOUSE_INPUT) {
            self.boot_mouse = Some((
                characteristic.handle_value,
                find_descriptor(descriptors, UUID_CCCD),
            ));
        } else if uuid == Some(UUID_PROTOCOL_MODE) {
            self.protocol_mode = Some(characteristic.handle_value);
        }
    }

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        if self.reports.is_empty() && self.boot_mouse.is_none() {
            return Err(DiscoverError::ServiceIncomplete);
        }
        Ok(())
    }

    fn on_hvx(&self, _conn: &Connection, type_: HvxType, handle: u16, data: &[u8]) -> Option<HidEvent> {
        if type_ != HvxType::Notification {
            return None;
        }
        let Ok(data) = Vec::from_slice(data) else {
            warn!("HID notification of {} bytes dropped", data.len());
            return None;
        };
        if let Some(report) = self.reports.iter().find(|r| r.value == handle) {
            return Some(HidEvent::Input {
                report_id: report.report_id,
                data,
            });
        }
        match self.boot_mouse {
            Some((value, _)) if value == handle => Some(HidEvent::BootMouse(data)),
            _ => None,
        }
    }
}

impl HidClient {
    /// Read every Report Reference descriptor to learn report IDs and types.
    pub async fn read_report_references(&mut self) {
        let conn = self.conn.clone();
        for report in self.reports.iter_mut() {
            let Some(handle) = report.reference else {
                continue;
            };
            let mut buf = [0u8; 2];
            match gatt_client::read(&conn, handle, &mut buf).await {
                Ok(2) => {
                    report.report_id = buf[0];
                    report.input = buf[1] == REPORT_TYPE_INPUT;
                    debug!("HID report id {} type {}", buf[0], buf[1]);
                }
                Ok(n) => warn!("short report reference ({} bytes)", n),
                Err(e) => warn!("report reference read failed: {:?}", e),
            }
        }
    }

    async fn current_mode(&self) -> ProtocolMode {
        let Some(handle) = self.protocol_mode else {
            // the characteristic is optional; without it the peer is in report mode
            return ProtocolMode::Report;
        };
        let mut buf = [0u8; 1];
        match gatt_client::read(&self.conn, handle, &mut buf).await {
            Ok(1) => ProtocolMode::from_byte(buf[0]).unwrap_or(ProtocolMode::Report),
            _ => {
                warn!("protocol mode read failed, assuming report");
                ProtocolMode::Report
            }
        }
    }

    /// Pick boot or report protocol and write it to the peer if needed.
    pub async fn negotiate_protocol(&mut self) -> ProtocolDecision {
        let current = self.current_mode().await;
        let has_report = self.reports.iter().any(|r| r.input && r.cccd.is_some());
        let has_boot = self.boot_mouse.is_some_and(|(_, cccd)| cccd.is_some());
        let decision = negotiate(current, has_report, has_boot);
        if let (ProtocolDecision::SwitchTo(mode), Some(handle)) = (decision, self.protocol_mode) {
            if let Err(e) =
                gatt_client::write_without_response(&self.conn, handle, &[mode.as_byte()]).await
            {
                warn!("protocol mode write failed: {:?}", e);
            }
        }
        self.mode = decision.effective_mode(current);
        decision
    }

    /// Enable notifications for the inputs of the negotiated mode.
    pub async fn subscribe(&self) -> Result<(), BleError> {
        let mut enabled = 0;
        match self.mode {
            ProtocolMode::Report => {
                for report in self.reports.iter().filter(|r| r.input) {
                    if let Some(cccd) = report.cccd {
                        gatt_client::write(&self.conn, cccd, &CCCD_NOTIFY)
                            .await
                            .map_err(|_| BleError::NotifyFailed)?;
                        enabled += 1;
                    }
                }
            }
            ProtocolMode::Boot => {
                if let Some((_, Some(cccd))) = self.boot_mouse {
                    gatt_client::write(&self.conn, cccd, &CCCD_NOTIFY)
                        .await
                        .map_err(|_| BleError::NotifyFailed)?;
                    enabled += 1;
                }
            }
        }
        info!("HID notifications enabled on {} characteristic(s)", enabled);
        if enabled == 0 {
            return Err(BleError::NotifyFailed);
        }
        Ok(())
    }
}

/// Notification on a connected link, from whichever service sent it.
pub enum LinkNotification {
    Hid(HidEvent),
    Uart(Vec<u8, NUS_NOTIFY_MAX>),
}

/// Clients discovered so far on one link, fanned into a single
/// `gatt_client::run` loop.
///
/// This client is never discovered itself; the services it wraps are
/// discovered one by one and installed as the chain progresses.
pub struct LinkClients {
    pub nus: OnceCell<NusClient>,
    pub hid: OnceCell<HidClient>,
}

impl LinkClients {
    pub const fn new() -> Self {
        Self {
            nus: OnceCell::new(),
            hid: OnceCell::new(),
        }
    }
}

impl Client for LinkClients {
    type Event = LinkNotification;

    fn uuid() -> Uuid {
        NusClient::uuid()
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self::new()
    }

    fn discovered_characteristic(&mut self, _characteristic: &Characteristic, _descriptors: &[Descriptor]) {}

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        Err(DiscoverError::ServiceNotFound)
    }

    fn on_hvx(&self, conn: &Connection, type_: HvxType, handle: u16, data: &[u8]) -> Option<LinkNotification> {
        if let Some(event) = self.hid.get().and_then(|c| c.on_hvx(conn, type_, handle, data)) {
            return Some(LinkNotification::Hid(event));
        }
        match self.nus.get().and_then(|c| c.on_hvx(conn, type_, handle, data))? {
            NusClientEvent::TxNotification(data) => Some(LinkNotification::Uart(data)),
        }
    }
}

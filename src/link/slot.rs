//! Per-connection tasks.
//!
//! Each slot task owns at most one `Connection`.  It waits for a connect
//! request, runs `connect_with_security`, then serves the manager's
//! requests for that link (security, discovery stages, MTU, RSSI, UART
//! writes) while a `gatt_client::run` loop delivers notifications to the
//! USB bridge.  When the link drops the slot reports it and goes idle.

use core::cell::{Cell, RefCell};

use defmt::{debug, info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Channel, Receiver};
use embassy_time::{Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, DiscoverError};
use nrf_softdevice::ble::{central, Connection, EncryptError, SecurityMode};
use nrf_softdevice::raw;
use nrf_softdevice::Softdevice;

use mouthpad_usb::ble::central::CentralEvent;
use mouthpad_usb::ble::discovery::{Outcome, Stage};
use mouthpad_usb::ble::{LinkHandle, PeerAddress};
use mouthpad_usb::config::{
    self, BLE_ATT_MTU, BLE_CONNECT_TIMEOUT, MAX_CONNECTIONS,
};
use mouthpad_usb::error::BleError;
use mouthpad_usb::hid::BleReport;

use super::bonder::bonder;
use super::clients::{
    BatteryClient, DeviceInfoClient, HidClient, HidEvent, LinkClients, LinkNotification, NusClient,
};
use super::scanner::SCAN_LOCK;
use super::{dispatch, now_ms, sd_address, with_shared, Shared};
use crate::usb::{CdcQueue, HidQueue};

/// Largest single write to the peer's UART RX characteristic.
pub const NUS_WRITE_MAX: usize = BLE_ATT_MTU as usize - 3;

const SLOT_QUEUE_LEN: usize = 8;

/// HCI reasons reported with a disconnect.  `gatt_client::run` does not
/// surface the real one, so only the direction is known.
const REASON_LOCAL_HOST: u8 = 0x16;
const REASON_REMOTE_USER: u8 = 0x13;

pub enum SlotCommand {
    Connect(PeerAddress),
    Disconnect,
    Secure,
    Discover(Stage),
    ExchangeMtu,
    ReadRssi,
    UartWrite(Vec<u8, NUS_WRITE_MAX>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Connecting,
    Linked(LinkHandle),
}

static SLOTS: Mutex<CriticalSectionRawMutex, RefCell<[SlotState; MAX_CONNECTIONS]>> =
    Mutex::new(RefCell::new([SlotState::Free; MAX_CONNECTIONS]));

static COMMANDS: [Channel<CriticalSectionRawMutex, SlotCommand, SLOT_QUEUE_LEN>; MAX_CONNECTIONS] =
    [const { Channel::new() }; MAX_CONNECTIONS];

fn set_state(slot: usize, state: SlotState) {
    SLOTS.lock(|slots| slots.borrow_mut()[slot] = state);
}

/// Reserve an idle slot for a connection attempt.
pub fn claim(address: &PeerAddress) -> Option<usize> {
    let slot = SLOTS.lock(|slots| {
        let mut slots = slots.borrow_mut();
        let slot = slots.iter().position(|s| *s == SlotState::Free)?;
        slots[slot] = SlotState::Connecting;
        Some(slot)
    })?;
    debug!("slot {} claimed for {}", slot, address.to_text().as_str());
    Some(slot)
}

pub fn release(slot: usize) {
    set_state(slot, SlotState::Free);
}

pub fn slot_of(link: LinkHandle) -> Option<usize> {
    SLOTS.lock(|slots| {
        slots
            .borrow()
            .iter()
            .position(|s| *s == SlotState::Linked(link))
    })
}

pub fn send(slot: usize, cmd: SlotCommand) -> Result<(), BleError> {
    COMMANDS[slot].try_send(cmd).map_err(|_| {
        warn!("slot {} queue full", slot);
        BleError::Busy
    })
}

async fn connect(sd: &'static Softdevice, address: &PeerAddress) -> Option<Connection> {
    let target = sd_address(address);
    let whitelist = [&target];
    let conn_cfg = central::ConnectConfig {
        scan_config: central::ScanConfig {
            whitelist: Some(&whitelist),
            timeout: BLE_CONNECT_TIMEOUT,
            ..Default::default()
        },
        conn_params: raw::ble_gap_conn_params_t {
            min_conn_interval: config::BLE_CONN_INTERVAL_MIN,
            max_conn_interval: config::BLE_CONN_INTERVAL_MAX,
            slave_latency: config::BLE_SLAVE_LATENCY,
            conn_sup_timeout: config::BLE_SUP_TIMEOUT,
        },
        ..Default::default()
    };

    let _guard = SCAN_LOCK.lock().await;
    match central::connect_with_security(sd, &conn_cfg, bonder()).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("connect failed: {:?}", e);
            None
        }
    }
}

#[embassy_executor::task(pool_size = MAX_CONNECTIONS)]
pub async fn slot_task(sd: &'static Softdevice, slot: usize) -> ! {
    let commands = COMMANDS[slot].receiver();
    loop {
        let address = match commands.receive().await {
            SlotCommand::Connect(address) => address,
            _ => {
                debug!("slot {} idle, dropping stale command", slot);
                continue;
            }
        };

        let Some((conn, handle)) = connect(sd, &address)
            .await
            .and_then(|conn| conn.handle().map(|h| (conn, h)))
        else {
            release(slot);
            dispatch(CentralEvent::ConnectFailed { address });
            continue;
        };

        let link = LinkHandle(handle);
        set_state(slot, SlotState::Linked(link));
        info!("slot {} linked (handle {})", slot, handle);
        conn.start_rssi();
        dispatch(CentralEvent::Connected { link, address });

        let session = Session::new(conn, link);
        let reason = session.run(&commands).await;

        while commands.try_receive().is_ok() {}
        release(slot);
        dispatch(CentralEvent::Disconnected { link, reason });
    }
}

struct Session {
    conn: Connection,
    link: LinkHandle,
    clients: LinkClients,
    closing: Cell<bool>,
}

impl Session {
    fn new(conn: Connection, link: LinkHandle) -> Self {
        Self {
            conn,
            link,
            clients: LinkClients::new(),
            closing: Cell::new(false),
        }
    }

    /// Serve until the link is gone; returns the disconnect reason.
    async fn run(
        &self,
        commands: &Receiver<'static, CriticalSectionRawMutex, SlotCommand, SLOT_QUEUE_LEN>,
    ) -> u8 {
        let listen = gatt_client::run(&self.conn, &self.clients, |n| self.on_notification(n));
        match select(listen, self.serve(commands)).await {
            Either::First(_disconnected) => {}
            Either::Second(()) => {}
        }
        if self.closing.get() {
            REASON_LOCAL_HOST
        } else {
            REASON_REMOTE_USER
        }
    }

    async fn serve(
        &self,
        commands: &Receiver<'static, CriticalSectionRawMutex, SlotCommand, SLOT_QUEUE_LEN>,
    ) {
        loop {
            match commands.receive().await {
                SlotCommand::Connect(_) => warn!("connect on a busy slot ignored"),
                SlotCommand::Disconnect => {
                    self.closing.set(true);
                    if self.conn.disconnect().is_err() {
                        // already gone
                        return;
                    }
                }
                SlotCommand::Secure => self.secure().await,
                SlotCommand::Discover(Stage::Mtu) | SlotCommand::ExchangeMtu => {
                    self.exchange_mtu().await
                }
                SlotCommand::Discover(stage) => {
                    let outcome = self.discover(stage).await;
                    debug!("stage {} -> {}", stage, outcome);
                    dispatch(CentralEvent::Discovery {
                        link: self.link,
                        stage,
                        outcome,
                    });
                }
                SlotCommand::ReadRssi => dispatch(CentralEvent::Rssi {
                    link: self.link,
                    rssi: self.conn.rssi(),
                }),
                SlotCommand::UartWrite(data) => match self.clients.nus.get() {
                    Some(nus) => {
                        if let Err(e) = nus.rx_write(&data).await {
                            warn!("UART write failed: {:?}", e);
                        }
                    }
                    None => debug!("UART not discovered, dropping write"),
                },
            }
        }
    }

    async fn secure(&self) {
        let started = match self.conn.encrypt() {
            Ok(()) => true,
            Err(EncryptError::PeerKeysNotFound) => {
                info!("no keys for peer, pairing");
                self.conn.request_pairing().is_ok()
            }
            Err(e) => {
                warn!("encrypt failed: {:?}", e);
                false
            }
        };

        let event = if started && wait_for_secure_link(&self.conn).await {
            CentralEvent::Encrypted { link: self.link }
        } else {
            CentralEvent::SecurityFailed { link: self.link }
        };
        dispatch(event);
    }

    async fn exchange_mtu(&self) {
        let mtu = match gatt_client::att_mtu_exchange(&self.conn, BLE_ATT_MTU).await {
            Ok(()) => Some(BLE_ATT_MTU),
            Err(e) => {
                warn!("MTU exchange failed: {:?}", e);
                None
            }
        };
        dispatch(CentralEvent::MtuExchanged {
            link: self.link,
            mtu,
        });
    }

    async fn discover(&self, stage: Stage) -> Outcome {
        match stage {
            Stage::Uart => {
                let nus: NusClient = match gatt_client::discover(&self.conn).await {
                    Ok(client) => client,
                    Err(e) => return outcome_of(e),
                };
                if let Err(e) = nus.tx_cccd_write(true).await {
                    warn!("UART notify enable failed: {:?}", e);
                    return Outcome::Error;
                }
                let _ = self.clients.nus.set(nus);
                Outcome::Found
            }
            Stage::Hid => {
                let mut hid: HidClient = match gatt_client::discover(&self.conn).await {
                    Ok(client) => client,
                    Err(e) => return outcome_of(e),
                };
                hid.read_report_references().await;
                hid.negotiate_protocol().await;
                // installed first so the earliest notification is routed
                let _ = self.clients.hid.set(hid);
                match self.clients.hid.get() {
                    Some(hid) => match hid.subscribe().await {
                        Ok(()) => Outcome::Found,
                        Err(e) => {
                            warn!("HID subscribe failed: {:?}", e);
                            Outcome::Error
                        }
                    },
                    None => Outcome::Error,
                }
            }
            Stage::Battery => {
                let battery: BatteryClient = match gatt_client::discover(&self.conn).await {
                    Ok(client) => client,
                    Err(e) => return outcome_of(e),
                };
                match battery.battery_level_read().await {
                    Ok(level) => info!("peer battery {}%", level),
                    Err(e) => debug!("battery read failed: {:?}", e),
                }
                Outcome::Found
            }
            Stage::DeviceInfo => {
                let dis: DeviceInfoClient = match gatt_client::discover(&self.conn).await {
                    Ok(client) => client,
                    Err(e) => return outcome_of(e),
                };
                if let Ok(maker) = dis.manufacturer_name_read().await {
                    debug!("peer manufacturer {=[u8]:a}", maker.as_slice());
                }
                if let Ok(model) = dis.model_number_read().await {
                    if let Ok(name) = core::str::from_utf8(&model) {
                        if !name.is_empty() {
                            dispatch(CentralEvent::PeerName {
                                link: self.link,
                                name,
                            });
                        }
                    }
                }
                Outcome::Found
            }
            Stage::Mtu => Outcome::Error,
        }
    }

    fn on_notification(&self, notification: LinkNotification) {
        let link = self.link;
        let now = now_ms();
        with_shared(|shared| {
            let Shared { manager, bridge } = shared;
            match &notification {
                LinkNotification::Hid(HidEvent::Input { report_id, data }) => {
                    let report = BleReport::Input {
                        report_id: *report_id,
                        data,
                    };
                    bridge.forward_report(manager, link, &report, now, &mut HidQueue);
                }
                LinkNotification::Hid(HidEvent::BootMouse(data)) => {
                    bridge.forward_report(manager, link, &BleReport::BootMouse(data), now, &mut HidQueue);
                }
                LinkNotification::Uart(data) => {
                    if let Err(e) = bridge.forward_uart(manager, link, data, &mut CdcQueue) {
                        warn!("UART data not forwarded: {:?}", e);
                    }
                }
            }
        });
    }
}

fn outcome_of(e: DiscoverError) -> Outcome {
    match e {
        DiscoverError::ServiceNotFound => Outcome::NotFound,
        _ => {
            warn!("discovery error: {:?}", e);
            Outcome::Error
        }
    }
}

async fn wait_for_secure_link(conn: &Connection) -> bool {
    for _ in 0..25 {
        match conn.security_mode() {
            SecurityMode::NoAccess | SecurityMode::Open => {
                Timer::after(Duration::from_millis(200)).await
            }
            _ => return true,
        }
    }
    false
}

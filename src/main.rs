//! mouthpad-usb firmware entry point (nRF52840 + S140).
//!
//! Boot order matters:
//!
//! 1. Embassy HAL with every interrupt we own at P2 (P0/P1 belong to the
//!    SoftDevice).
//! 2. SoftDevice enabled before anything touches flash or POWER.
//! 3. USB composite device built and its tasks spawned, so enumeration
//!    starts while the radio comes up.
//! 4. Bonds and link keys loaded from flash and reconciled.
//! 5. Connection manager installed, radio tasks spawned, scan started.

#![no_std]
#![no_main]

mod link;
mod storage;
mod usb;

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_nrf::interrupt::{self, InterruptExt};
use nrf_softdevice::{Flash, Softdevice};
use {defmt_rtt as _, panic_probe as _};

use mouthpad_usb::ble::central::{CentralEvent, ConnectionManager};
use mouthpad_usb::bonds::BondRegistry;
use mouthpad_usb::config::{CentralConfig, MAX_CONNECTIONS};

use crate::link::bonder::bonder;

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("mouthpad-usb starting");

    let mut conf = embassy_nrf::config::Config::default();
    conf.gpiote_interrupt_priority = interrupt::Priority::P2;
    conf.time_interrupt_priority = interrupt::Priority::P2;
    let p = embassy_nrf::init(conf);

    interrupt::USBD.set_priority(interrupt::Priority::P2);

    let sd = link::init_softdevice();

    let parts = usb::init(p.USBD);
    let (cdc_tx, cdc_rx) = parts.cdc.split();

    // Flash goes through the SoftDevice once it is enabled
    let mut flash = Flash::take(sd);
    let sd: &'static Softdevice = sd;

    unwrap!(spawner.spawn(link::softdevice_task(sd, parts.vbus)));
    unwrap!(spawner.spawn(usb::usb_task(parts.device)));
    unwrap!(spawner.spawn(usb::hid_task(parts.hid)));
    unwrap!(spawner.spawn(usb::cdc_rx_task(cdc_rx)));
    unwrap!(spawner.spawn(usb::cdc_tx_task(cdc_tx)));
    unwrap!(spawner.spawn(usb::watchdog_task()));

    let mut registry = BondRegistry::new();
    storage::load(&mut flash, &mut registry).await;
    // drop records whose keys are gone and adopt keys with no record
    registry.reconcile(&bonder().addresses(), link::now_ms());
    info!("{} bonded device(s)", registry.len());

    link::install(ConnectionManager::new(CentralConfig::default(), registry));

    unwrap!(spawner.spawn(storage::storage_task(flash)));
    unwrap!(spawner.spawn(link::scanner::scanner_task(sd)));
    for slot in 0..MAX_CONNECTIONS {
        unwrap!(spawner.spawn(link::slot::slot_task(sd, slot)));
    }
    unwrap!(spawner.spawn(link::tick_task()));

    // reconciliation may have queued flash work
    storage::request_flush();

    link::dispatch(CentralEvent::Start);
    info!("init complete");
}

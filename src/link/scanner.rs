//! BLE GAP scanner.
//!
//! Runs the SoftDevice scan while the connection manager wants one and
//! hands every advertisement to it.  Qualification and the connect decision
//! happen in the manager; this task only moves bytes.

use defmt::{info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use nrf_softdevice::ble::{central, Address};
use nrf_softdevice::Softdevice;

use mouthpad_usb::ble::central::{AdvReport, CentralEvent};

use super::{dispatch, peer_address};

/// Scan interval and window, 0.625 ms units.
const SCAN_INTERVAL: u32 = 160;
const SCAN_WINDOW: u32 = 80;

/// Pause before reporting a failed scan, so a persistent error does not spin.
const SCAN_RETRY_MS: u64 = 200;

#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ScanControl {
    Start,
    Stop,
}

static SCAN_CONTROL: Signal<CriticalSectionRawMutex, ScanControl> = Signal::new();

/// The SoftDevice runs one scan procedure at a time; connection attempts
/// scan too, so they take this lock as well.
pub static SCAN_LOCK: Mutex<CriticalSectionRawMutex, ()> = Mutex::new(());

pub fn control(cmd: ScanControl) {
    SCAN_CONTROL.signal(cmd);
}

async fn wait_for(wanted: ScanControl) {
    while SCAN_CONTROL.wait().await != wanted {}
}

#[embassy_executor::task]
pub async fn scanner_task(sd: &'static Softdevice) -> ! {
    let config = central::ScanConfig {
        // active scan for scan-response names
        active: true,
        interval: SCAN_INTERVAL,
        window: SCAN_WINDOW,
        ..Default::default()
    };

    loop {
        wait_for(ScanControl::Start).await;
        let _guard = SCAN_LOCK.lock().await;
        info!("BLE scan started");

        let scan = central::scan(sd, &config, |params| {
            let data =
                unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };
            let report = AdvReport {
                address: peer_address(Address::from_raw(params.peer_addr)),
                rssi: params.rssi,
                connectable: params.type_.connectable() != 0,
                data,
            };
            dispatch(CentralEvent::Advertisement(report));
            // keep scanning until told to stop
            None::<()>
        });

        match select(scan, wait_for(ScanControl::Stop)).await {
            Either::First(result) => {
                if let Err(e) = result {
                    warn!("BLE scan ended with error: {:?}", e);
                }
                Timer::after_millis(SCAN_RETRY_MS).await;
                dispatch(CentralEvent::ScanStopped);
            }
            Either::Second(()) => info!("BLE scan stopped"),
        }
    }
}

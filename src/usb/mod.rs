//! USB side of the bridge.
//!
//! The nRF52840's built-in USB 2.0 Full-Speed controller is driven by
//! `embassy-usb` as a composite device (see [`device`]):
//!
//! - HID: buttons, motion and consumer reports from the primary MouthPad
//! - CDC-ACM: framed relay messages to and from the peer's UART service
//!
//! Radio-side code never touches an endpoint.  Reports and frames are
//! queued through [`HidQueue`] and [`CdcQueue`], and the tasks here drain
//! the queues onto the wire.

pub mod device;

use defmt::{debug, error, info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use embassy_usb::class::cdc_acm::{Receiver, Sender};
use embassy_usb::class::hid::HidWriter;
use embassy_usb::driver::EndpointError;
use embassy_usb::UsbDevice;
use heapless::Vec;
use nrf_softdevice::raw;

use mouthpad_usb::bridge::{self, CdcSink, HidSink};
use mouthpad_usb::config::{FRAME_MAX_PAYLOAD, FRAME_OVERHEAD, MAX_USB_REPORT_LEN, USB_ENUM_TIMEOUT_MS};
use mouthpad_usb::error::UsbError;
use mouthpad_usb::hid::UsbReport;
use mouthpad_usb::watchdog::{EnumerationWatchdog, RetryCounter, WatchdogVerdict};

use self::device::{UsbDriver, CDC_PACKET_SIZE};
use crate::link::{now_ms, route_notices, with_shared, LinkRadio, Shared};

pub use self::device::init;

/// Reports waiting for the HID IN endpoint.
const HID_QUEUE_LEN: usize = 16;

/// Frames waiting for the CDC IN endpoint.
const CDC_QUEUE_LEN: usize = 4;

pub type CdcFrame = Vec<u8, { FRAME_MAX_PAYLOAD + FRAME_OVERHEAD }>;

static HID_REPORTS: Channel<CriticalSectionRawMutex, UsbReport, HID_QUEUE_LEN> = Channel::new();
static CDC_FRAMES: Channel<CriticalSectionRawMutex, CdcFrame, CDC_QUEUE_LEN> = Channel::new();
static RELEASE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Ask the HID task to play the release-all burst.
pub fn request_release() {
    RELEASE.signal(());
}

/// [`HidSink`] that queues reports for [`hid_task`].
pub struct HidQueue;

impl HidSink for HidQueue {
    fn submit(&mut self, report: &[u8]) -> Result<(), UsbError> {
        if !device::is_configured() {
            return Err(UsbError::NotReady);
        }
        let report = UsbReport::from_bytes(report).ok_or(UsbError::WriteFailed)?;
        HID_REPORTS.try_send(report).map_err(|_| UsbError::QueueFull)
    }
}

/// [`CdcSink`] that queues frames for [`cdc_tx_task`].
pub struct CdcQueue;

impl CdcSink for CdcQueue {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), UsbError> {
        if !device::is_configured() {
            return Err(UsbError::NotReady);
        }
        let frame = Vec::from_slice(frame).map_err(|_| UsbError::WriteFailed)?;
        CDC_FRAMES.try_send(frame).map_err(|_| UsbError::QueueFull)
    }
}

#[embassy_executor::task]
pub async fn usb_task(mut device: UsbDevice<'static, UsbDriver>) -> ! {
    device.run().await
}

/// Drain the HID queue; a release request preempts queued reports.
#[embassy_executor::task]
pub async fn hid_task(mut writer: HidWriter<'static, UsbDriver, MAX_USB_REPORT_LEN>) -> ! {
    writer.ready().await;
    info!("HID endpoint ready");

    loop {
        match select(RELEASE.wait(), HID_REPORTS.receive()).await {
            Either::First(()) => {
                // stale motion must not land after the release
                let mut dropped = 0;
                while HID_REPORTS.try_receive().is_ok() {
                    dropped += 1;
                }
                debug!("release-all ({} queued reports dropped)", dropped);
                for step in bridge::release_burst() {
                    if let Err(e) = writer.write(step.report).await {
                        warn!("release report {} failed: {:?}", step.report[0], e);
                    }
                    if step.delay_after_ms > 0 {
                        Timer::after_millis(step.delay_after_ms).await;
                    }
                }
            }
            Either::Second(report) => {
                if let Err(e) = writer.write(report.as_bytes()).await {
                    warn!("HID write failed: {:?}", e);
                }
            }
        }
    }
}

/// Feed bytes from the host into the bridge's frame decoder.
#[embassy_executor::task]
pub async fn cdc_rx_task(mut rx: Receiver<'static, UsbDriver>) -> ! {
    let mut buf = [0u8; CDC_PACKET_SIZE as usize];
    loop {
        rx.wait_connection().await;
        info!("CDC connected");

        loop {
            match rx.read_packet(&mut buf).await {
                Ok(n) => {
                    let bytes = &buf[..n];
                    with_shared(|Shared { manager, bridge }| {
                        bridge.receive_cdc(bytes, manager, now_ms(), &mut CdcQueue, &mut LinkRadio);
                        route_notices(manager);
                    });
                }
                Err(EndpointError::Disabled) => break,
                Err(EndpointError::BufferOverflow) => warn!("CDC packet too large"),
            }
        }

        // a half-read frame from the old session is garbage now
        with_shared(|shared| shared.bridge.reset_decoder());
        info!("CDC disconnected");
    }
}

/// Write queued frames as full-size packets, ending with a short or
/// zero-length packet so the host sees the transfer boundary.
#[embassy_executor::task]
pub async fn cdc_tx_task(mut tx: Sender<'static, UsbDriver>) -> ! {
    loop {
        let frame = CDC_FRAMES.receive().await;
        if let Err(e) = write_frame(&mut tx, &frame).await {
            warn!("CDC frame of {} bytes dropped: {:?}", frame.len(), e);
        }
    }
}

async fn write_frame(tx: &mut Sender<'static, UsbDriver>, frame: &[u8]) -> Result<(), EndpointError> {
    let packet = CDC_PACKET_SIZE as usize;
    for chunk in frame.chunks(packet) {
        tx.write_packet(chunk).await?;
    }
    if frame.len() % packet == 0 {
        tx.write_packet(&[]).await?;
    }
    Ok(())
}

/// GPREGRET2, through the SoftDevice since it owns the POWER block.
struct Gpregret2;

const GPREGRET2_ID: u32 = 1;

impl RetryCounter for Gpregret2 {
    fn load(&self) -> u8 {
        let mut value = 0u32;
        let ret = unsafe { raw::sd_power_gpregret_get(GPREGRET2_ID, &mut value) };
        if ret != raw::NRF_SUCCESS {
            warn!("GPREGRET2 read failed: {}", ret);
            return 0;
        }
        value as u8
    }

    fn store(&mut self, value: u8) {
        unsafe {
            raw::sd_power_gpregret_clr(GPREGRET2_ID, 0xFF);
            raw::sd_power_gpregret_set(GPREGRET2_ID, value as u32);
        }
    }
}

/// Reset the chip if the host has not configured us in time.
#[embassy_executor::task]
pub async fn watchdog_task() {
    Timer::after_millis(USB_ENUM_TIMEOUT_MS).await;

    let mut watchdog = EnumerationWatchdog::new(Gpregret2);
    match watchdog.check(device::is_configured()) {
        WatchdogVerdict::Satisfied => info!("USB enumeration confirmed"),
        WatchdogVerdict::Reset { attempt } => {
            warn!("resetting for USB enumeration attempt {}", attempt);
            // let RTT drain
            Timer::after_millis(50).await;
            cortex_m::peripheral::SCB::sys_reset();
        }
        WatchdogVerdict::GiveUp => error!("USB never enumerated; running without a host"),
    }
}

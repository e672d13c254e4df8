//! USB composite device: one HID interface plus one CDC-ACM port.
//!
//! Initialises the Embassy USB stack on the nRF52840 hardware USB
//! peripheral.  The HID interface carries report IDs 1-3 from a single
//! report descriptor; the CDC port carries framed relay messages.

use core::sync::atomic::{AtomicBool, Ordering};

use defmt::info;
use embassy_nrf::usb::vbus_detect::SoftwareVbusDetect;
use embassy_nrf::usb::Driver;
use embassy_nrf::{self, bind_interrupts, peripherals};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_usb::class::cdc_acm::{CdcAcmClass, State as CdcState};
use embassy_usb::class::hid::{Config as HidConfig, HidWriter, State as HidState};
use embassy_usb::{Builder, Config, UsbDevice};
use static_cell::StaticCell;

use mouthpad_usb::config::{self, MAX_USB_REPORT_LEN};
use mouthpad_usb::hid::descriptor::REPORT_DESCRIPTOR;

bind_interrupts!(struct Irqs {
    USBD => embassy_nrf::usb::InterruptHandler<peripherals::USBD>;
});

/// The SoftDevice owns POWER, so VBUS state arrives as SoC events and is
/// fed in by the SoftDevice task.
pub type UsbDriver = Driver<'static, peripherals::USBD, &'static SoftwareVbusDetect>;

/// Full-speed bulk packet size for the CDC data endpoints.
pub const CDC_PACKET_SIZE: u16 = 64;

static HID_STATE: StaticCell<HidState> = StaticCell::new();
static CDC_STATE: StaticCell<CdcState> = StaticCell::new();
static USB_CONFIG_DESC: StaticCell<[u8; 256]> = StaticCell::new();
static USB_BOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
static USB_MSOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
static USB_CTRL_BUF: StaticCell<[u8; 128]> = StaticCell::new();
static USB_STATE_HANDLER: StaticCell<UsbStateHandler> = StaticCell::new();
static VBUS: StaticCell<SoftwareVbusDetect> = StaticCell::new();

static CONFIGURED: AtomicBool = AtomicBool::new(false);
static CONFIGURED_SIGNAL: Signal<CriticalSectionRawMutex, bool> = Signal::new();

struct UsbStateHandler;

impl embassy_usb::Handler for UsbStateHandler {
    fn configured(&mut self, configured: bool) {
        CONFIGURED.store(configured, Ordering::Relaxed);
        CONFIGURED_SIGNAL.signal(configured);
        info!("USB configured: {}", configured);
    }

    fn suspended(&mut self, suspended: bool) {
        info!("USB suspended: {}", suspended);
    }
}

/// The host has selected our configuration.
pub fn is_configured() -> bool {
    CONFIGURED.load(Ordering::Relaxed)
}

/// Fires on every configured/deconfigured transition.
pub fn configured_signal() -> &'static Signal<CriticalSectionRawMutex, bool> {
    &CONFIGURED_SIGNAL
}

pub struct UsbParts {
    pub device: UsbDevice<'static, UsbDriver>,
    pub hid: HidWriter<'static, UsbDriver, MAX_USB_REPORT_LEN>,
    pub cdc: CdcAcmClass<'static, UsbDriver>,
    pub vbus: &'static SoftwareVbusDetect,
}

/// Initialise the USB stack and create the composite device.
///
/// Must be called exactly once.  All static buffers are consumed here.
pub fn init(usbd: peripherals::USBD) -> UsbParts {
    // bus powered: VBUS is there whenever we run
    let vbus: &'static SoftwareVbusDetect = VBUS.init(SoftwareVbusDetect::new(true, true));
    let driver = Driver::new(usbd, Irqs, vbus);

    let mut usb_config = Config::new(config::USB_VID, config::USB_PID);
    usb_config.manufacturer = Some(config::USB_MANUFACTURER);
    usb_config.product = Some(config::USB_PRODUCT);
    usb_config.serial_number = Some(config::USB_SERIAL_NUMBER);
    usb_config.max_power = 100; // mA
    usb_config.max_packet_size_0 = 64;
    // IAD so the host binds CDC's two interfaces together
    usb_config.device_class = 0xEF;
    usb_config.device_sub_class = 0x02;
    usb_config.device_protocol = 0x01;
    usb_config.composite_with_iads = true;

    let config_desc = USB_CONFIG_DESC.init([0u8; 256]);
    let bos_desc = USB_BOS_DESC.init([0u8; 256]);
    let msos_desc = USB_MSOS_DESC.init([0u8; 256]);
    let ctrl_buf = USB_CTRL_BUF.init([0u8; 128]);

    let mut builder = Builder::new(
        driver,
        usb_config,
        config_desc,
        bos_desc,
        msos_desc,
        ctrl_buf,
    );

    builder.handler(USB_STATE_HANDLER.init(UsbStateHandler));

    let hid_config = HidConfig {
        report_descriptor: REPORT_DESCRIPTOR,
        request_handler: None,
        poll_ms: config::USB_HID_POLL_MS,
        max_packet_size: MAX_USB_REPORT_LEN as u16,
    };
    let hid = HidWriter::new(&mut builder, HID_STATE.init(HidState::new()), hid_config);

    let cdc = CdcAcmClass::new(&mut builder, CDC_STATE.init(CdcState::new()), CDC_PACKET_SIZE);

    let device = builder.build();

    info!("USB composite device initialised (HID + CDC)");

    UsbParts {
        device,
        hid,
        cdc,
        vbus,
    }
}

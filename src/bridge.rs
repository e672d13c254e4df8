//! BLE ↔ USB plumbing that sits between the connection manager and the
//! USB endpoints.
//!
//! - HID notifications from the primary link are translated and handed to
//!   the HID endpoint, but only while that link is still live.
//! - NUS bytes from the peer go out on CDC wrapped in a frame; frames from
//!   the host are decoded and either answered or passed to the peer.
//! - Disconnects trigger a release-all burst so no button stays stuck.

use crate::ble::central::{CentralEvent, ConnectionManager};
use crate::ble::{CentralRadio, LinkHandle};
use crate::config::{
    FRAME_MAX_PAYLOAD, FRAME_OVERHEAD, RELEASE_ALL_ROUNDS, RELEASE_REPORT_GAP_MS,
    RELEASE_ROUND_GAP_MS,
};
use crate::error::{BleError, Error, UsbError};
use crate::framing::{self, FrameDecoder};
use crate::hid::consumer::CONSUMER_REPORT_ID;
use crate::hid::mouse::{BUTTONS_REPORT_ID, MOTION_REPORT_ID};
use crate::hid::{translate, BleReport};
use crate::relay::{BridgeMessage, HostMessage};

/// Destination for USB HID input reports (report ID in byte 0).
pub trait HidSink {
    fn submit(&mut self, report: &[u8]) -> Result<(), UsbError>;
}

/// Destination for complete CDC frames.
pub trait CdcSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), UsbError>;
}

/// Writer for the peer's UART service.
pub trait PeerUart {
    fn send(&mut self, link: LinkHandle, data: &[u8]) -> Result<(), BleError>;
}

/// Input activity flag for an indicator LED.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Activity {
    last_ms: Option<u64>,
    flagged: bool,
}

impl Activity {
    pub fn mark(&mut self, now_ms: u64) {
        self.last_ms = Some(now_ms);
        self.flagged = true;
    }

    /// True if anything was forwarded since the last call.
    pub fn take(&mut self) -> bool {
        core::mem::take(&mut self.flagged)
    }

    pub fn last_ms(&self) -> Option<u64> {
        self.last_ms
    }
}

/// All-zero reports, one per input report ID.
pub const RELEASE_REPORTS: [&[u8]; 3] = [
    &[BUTTONS_REPORT_ID, 0, 0, 0],
    &[MOTION_REPORT_ID, 0, 0, 0],
    &[CONSUMER_REPORT_ID, 0, 0],
];

/// One write of the release-all burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseStep {
    pub report: &'static [u8],
    /// Pause before the next step.
    pub delay_after_ms: u64,
}

/// The release-all sequence: every report zeroed, repeated for several
/// rounds so a host that misses one write still sees the release.
pub fn release_burst() -> impl Iterator<Item = ReleaseStep> {
    (0..RELEASE_ALL_ROUNDS).flat_map(|round| {
        RELEASE_REPORTS.iter().enumerate().map(move |(i, &report)| {
            let delay_after_ms = if i + 1 < RELEASE_REPORTS.len() {
                RELEASE_REPORT_GAP_MS
            } else if round + 1 < RELEASE_ALL_ROUNDS {
                RELEASE_ROUND_GAP_MS
            } else {
                0
            };
            ReleaseStep {
                report,
                delay_after_ms,
            }
        })
    })
}

pub struct UsbBridge {
    activity: Activity,
    decoder: FrameDecoder,
    msg_buf: [u8; FRAME_MAX_PAYLOAD],
    frame_buf: [u8; FRAME_MAX_PAYLOAD + FRAME_OVERHEAD],
}

impl Default for UsbBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBridge {
    pub const fn new() -> Self {
        Self {
            activity: Activity {
                last_ms: None,
                flagged: false,
            },
            decoder: FrameDecoder::new(),
            msg_buf: [0u8; FRAME_MAX_PAYLOAD],
            frame_buf: [0u8; FRAME_MAX_PAYLOAD + FRAME_OVERHEAD],
        }
    }

    pub fn activity(&mut self) -> &mut Activity {
        &mut self.activity
    }

    /// Translate and submit one HID notification from `link`.
    ///
    /// Returns the number of USB reports accepted by `sink`.
    pub fn forward_report<S: HidSink>(
        &mut self,
        central: &ConnectionManager,
        link: LinkHandle,
        report: &BleReport<'_>,
        now_ms: u64,
        sink: &mut S,
    ) -> usize {
        if !central.is_link_active(link) {
            debug!("dropping report from closed link");
            return 0;
        }
        let mut sent = 0;
        for usb in translate(report) {
            match sink.submit(usb.as_bytes()) {
                Ok(()) => sent += 1,
                Err(e) => warn!("HID report {} not sent: {:?}", usb.report_id(), e),
            }
        }
        if sent > 0 {
            self.activity.mark(now_ms);
        }
        sent
    }

    /// Wrap bytes received on the peer's UART and send them to the host.
    pub fn forward_uart<C: CdcSink>(
        &mut self,
        central: &ConnectionManager,
        link: LinkHandle,
        data: &[u8],
        cdc: &mut C,
    ) -> Result<(), Error> {
        if !central.is_link_active(link) {
            debug!("dropping UART data from closed link");
            return Ok(());
        }
        send_message(
            &BridgeMessage::FromPeer(data),
            &mut self.msg_buf,
            &mut self.frame_buf,
            cdc,
        )
    }

    /// Feed bytes read from the CDC endpoint.
    ///
    /// Host commands are applied to `central` through `radio`; the caller
    /// routes any notices they raise.
    pub fn receive_cdc<C, R>(
        &mut self,
        bytes: &[u8],
        central: &mut ConnectionManager,
        now_ms: u64,
        cdc: &mut C,
        radio: &mut R,
    ) where
        C: CdcSink,
        R: CentralRadio + PeerUart,
    {
        let Self {
            decoder,
            msg_buf,
            frame_buf,
            ..
        } = self;
        decoder.feed(bytes, |payload| match HostMessage::decode(payload) {
            Ok(HostMessage::StatusRequest) => {
                let reply = BridgeMessage::Status(central.status());
                if let Err(e) = send_message(&reply, msg_buf, frame_buf, cdc) {
                    warn!("status reply failed: {:?}", e);
                }
            }
            Ok(HostMessage::ToPeer(data)) => match central.uart_link() {
                Some(link) => {
                    if let Err(e) = radio.send(link, data) {
                        warn!("UART write to peer failed: {:?}", e);
                    }
                }
                None => debug!("no UART peer, dropping {} bytes", data.len()),
            },
            Ok(HostMessage::PairAdditional) => {
                info!("host requested additional pairing");
                central.handle(CentralEvent::RequestAdditionalPairing, now_ms, radio);
            }
            Ok(HostMessage::ClearBonds) => {
                info!("host requested bond wipe");
                central.handle(CentralEvent::ClearBonds, now_ms, radio);
            }
            Err(e) => warn!("host message ignored: {:?}", e),
        });
    }

    pub fn reset_decoder(&mut self) {
        self.decoder.reset();
    }
}

fn send_message<C: CdcSink>(
    msg: &BridgeMessage<'_>,
    msg_buf: &mut [u8],
    frame_buf: &mut [u8],
    cdc: &mut C,
) -> Result<(), Error> {
    let len = msg.encode(msg_buf)?;
    let n = framing::encode(&msg_buf[..len], frame_buf)?;
    cdc.write_frame(&frame_buf[..n])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_burst_shape() {
        let steps: Vec<ReleaseStep> = release_burst().collect();
        assert_eq!(steps.len(), 9);
        let ids: Vec<u8> = steps.iter().map(|s| s.report[0]).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
        let delays: Vec<u64> = steps.iter().map(|s| s.delay_after_ms).collect();
        assert_eq!(delays, vec![10, 10, 20, 10, 10, 20, 10, 10, 0]);
        assert!(steps.iter().all(|s| s.report[1..].iter().all(|&b| b == 0)));
    }

    #[test]
    fn activity_take_clears_flag() {
        let mut a = Activity::default();
        assert!(!a.take());
        a.mark(42);
        assert!(a.take());
        assert!(!a.take());
        assert_eq!(a.last_ms(), Some(42));
    }
}

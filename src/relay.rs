//! Message envelope carried inside CDC frames.
//!
//! Frame payloads are `postcard`-encoded [`HostMessage`]s (host → bridge)
//! and [`BridgeMessage`]s (bridge → host).  The leading byte of a payload
//! is the variant index, so the first byte alone identifies the message:
//!
//! | Byte | Direction     | Message                               |
//! |------|---------------|---------------------------------------|
//! | 0x00 | host → bridge | `StatusRequest`                       |
//! | 0x01 | host → bridge | `ToPeer(bytes)`, varint length prefix |
//! | 0x02 | host → bridge | `PairAdditional`                      |
//! | 0x03 | host → bridge | `ClearBonds`                          |
//! | 0x00 | bridge → host | `Status { connected, rssi }`          |
//! | 0x01 | bridge → host | `FromPeer(bytes)`, varint length prefix |

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, RelayError};

/// Highest variant index a [`HostMessage`] payload may start with.
const LAST_HOST_TAG: u8 = 3;

/// Something the host asked of the bridge.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostMessage<'a> {
    /// Reply with a [`BridgeMessage::Status`].
    StatusRequest,
    /// Forward verbatim to the primary peer's UART service.
    ToPeer(&'a [u8]),
    /// Open a pairing window for one more device.
    PairAdditional,
    /// Forget every bond and drop every link.
    ClearBonds,
}

impl<'a> HostMessage<'a> {
    /// Decode one frame payload.  Trailing bytes make the payload malformed.
    pub fn decode(payload: &'a [u8]) -> Result<Self, RelayError> {
        let &tag = payload.first().ok_or(RelayError::Empty)?;
        if tag > LAST_HOST_TAG {
            return Err(RelayError::UnknownTag(tag));
        }
        match postcard::take_from_bytes::<HostMessage<'a>>(payload) {
            Ok((HostMessage::ToPeer(data), _)) if data.is_empty() => Err(RelayError::Malformed),
            Ok((msg, [])) => Ok(msg),
            _ => Err(RelayError::Malformed),
        }
    }
}

/// Link summary sent in reply to a status request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStatus {
    pub connected: bool,
    /// `None` until the first RSSI sample arrives.
    pub rssi: Option<i8>,
}

/// Something the bridge tells the host.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeMessage<'a> {
    Status(LinkStatus),
    FromPeer(&'a [u8]),
}

impl BridgeMessage<'_> {
    /// Write the encoded payload into `out`, ready for framing.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, FrameError> {
        postcard::to_slice(self, out)
            .map(|used| used.len())
            .map_err(|_| FrameError::BufferTooSmall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_host_messages() {
        assert_eq!(HostMessage::decode(&[0x00]), Ok(HostMessage::StatusRequest));
        assert_eq!(
            HostMessage::decode(&[0x01, 2, b'h', b'i']),
            Ok(HostMessage::ToPeer(b"hi"))
        );
        assert_eq!(HostMessage::decode(&[0x02]), Ok(HostMessage::PairAdditional));
        assert_eq!(HostMessage::decode(&[0x03]), Ok(HostMessage::ClearBonds));
    }

    #[test]
    fn host_encoding_matches_decoder() {
        let mut buf = [0u8; 16];
        let used = postcard::to_slice(&HostMessage::ToPeer(&[7, 8, 9]), &mut buf).unwrap();
        assert_eq!(used, &[0x01, 3, 7, 8, 9]);
        assert_eq!(HostMessage::decode(used), Ok(HostMessage::ToPeer(&[7, 8, 9])));
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        assert_eq!(HostMessage::decode(&[]), Err(RelayError::Empty));
        // empty pass-through
        assert_eq!(HostMessage::decode(&[0x01, 0]), Err(RelayError::Malformed));
        // length prefix longer than the body
        assert_eq!(HostMessage::decode(&[0x01, 5, 1]), Err(RelayError::Malformed));
        // trailing bytes after a unit message
        assert_eq!(HostMessage::decode(&[0x00, 0x00]), Err(RelayError::Malformed));
        assert_eq!(HostMessage::decode(&[0x03, 0x03]), Err(RelayError::Malformed));
        assert_eq!(HostMessage::decode(&[0x7F, 1]), Err(RelayError::UnknownTag(0x7F)));
    }

    #[test]
    fn encode_status() {
        let mut out = [0u8; 8];
        let msg = BridgeMessage::Status(LinkStatus {
            connected: true,
            rssi: Some(-61),
        });
        let n = msg.encode(&mut out).unwrap();
        assert_eq!(&out[..n], &[0x00, 0x01, 0x01, (-61i8) as u8]);
    }

    #[test]
    fn encode_status_without_rssi() {
        let mut out = [0u8; 3];
        let msg = BridgeMessage::Status(LinkStatus {
            connected: false,
            rssi: None,
        });
        assert_eq!(msg.encode(&mut out), Ok(3));
        assert_eq!(out, [0x00, 0x00, 0x00]);
    }

    #[test]
    fn encode_from_peer() {
        let mut out = [0u8; 5];
        let n = BridgeMessage::FromPeer(&[9, 8, 7]).encode(&mut out).unwrap();
        assert_eq!(&out[..n], &[0x01, 3, 9, 8, 7]);
        assert_eq!(
            BridgeMessage::FromPeer(&[1, 2, 3, 4]).encode(&mut out),
            Err(FrameError::BufferTooSmall)
        );
    }

    #[test]
    fn bridge_messages_decode_on_the_host() {
        let mut out = [0u8; 8];
        let n = BridgeMessage::FromPeer(b"ok").encode(&mut out).unwrap();
        let msg: BridgeMessage = postcard::from_bytes(&out[..n]).unwrap();
        assert_eq!(msg, BridgeMessage::FromPeer(b"ok"));
    }
}

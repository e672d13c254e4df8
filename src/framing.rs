//! Framing for the USB CDC byte stream.
//!
//! Wire layout (both directions):
//! ```text
//! 0xAA 0x55 [len_hi] [len_lo] [payload ...] [crc_hi] [crc_lo]
//! ```
//! `len` is the payload byte count, the CRC is CRC-16/CCITT-FALSE
//! (poly 0x1021, init 0xFFFF, no final XOR) over the payload only.
//!
//! The decoder is a byte-at-a-time state machine so it can be fed straight
//! from USB packets of any size.  Bad CRCs and oversize lengths are dropped
//! silently and the decoder hunts for the next magic pair.

use crc::{Crc, CRC_16_IBM_3740};

use crate::config::{FRAME_MAX_PAYLOAD, FRAME_OVERHEAD};
use crate::error::FrameError;

/// First magic byte.
pub const MAGIC1: u8 = 0xAA;

/// Second magic byte.
pub const MAGIC2: u8 = 0x55;

/// CRC-16/CCITT-FALSE, also catalogued as CRC-16/IBM-3740.
const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC over a frame payload.
pub fn checksum(payload: &[u8]) -> u16 {
    CCITT.checksum(payload)
}

/// Total encoded size of a frame carrying `payload_len` bytes.
pub const fn encoded_len(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}

/// Encode `payload` into `out` as one contiguous frame.
///
/// Returns the number of bytes written.  Nothing is written on error, so the
/// caller can hand `out[..n]` to a single endpoint write.
pub fn encode(payload: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
    if payload.len() > FRAME_MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge);
    }
    let total = encoded_len(payload.len());
    if out.len() < total {
        return Err(FrameError::BufferTooSmall);
    }

    let len = payload.len() as u16;
    let crc = checksum(payload);

    out[0] = MAGIC1;
    out[1] = MAGIC2;
    out[2..4].copy_from_slice(&len.to_be_bytes());
    out[4..4 + payload.len()].copy_from_slice(payload);
    out[4 + payload.len()..total].copy_from_slice(&crc.to_be_bytes());
    Ok(total)
}

/// Decoder cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameState {
    SeekMagic1,
    SeekMagic2,
    LengthHi,
    LengthLo,
    Payload,
    CrcHi,
    CrcLo,
}

/// Counters kept by a decoder, mainly for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameStats {
    /// Frames delivered to the consumer.
    pub frames: u32,
    /// Frames dropped on CRC mismatch.
    pub crc_errors: u32,
    /// Frames aborted because the length exceeded the buffer.
    pub oversize: u32,
}

/// Streaming frame decoder with an `N`-byte payload buffer.
pub struct FrameDecoder<const N: usize = FRAME_MAX_PAYLOAD> {
    state: FrameState,
    buffer: [u8; N],
    expected: usize,
    pos: usize,
    rx_crc: u16,
    stats: FrameStats,
}

impl<const N: usize> Default for FrameDecoder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameDecoder<N> {
    /// Create a decoder waiting for the first magic byte.
    pub const fn new() -> Self {
        Self {
            state: FrameState::SeekMagic1,
            buffer: [0u8; N],
            expected: 0,
            pos: 0,
            rx_crc: 0,
            stats: FrameStats {
                frames: 0,
                crc_errors: 0,
                oversize: 0,
            },
        }
    }

    /// Current cursor position.
    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Drop any partial frame and hunt for the next magic pair.
    pub fn reset(&mut self) {
        self.state = FrameState::SeekMagic1;
        self.expected = 0;
        self.pos = 0;
        self.rx_crc = 0;
    }

    /// Feed one byte.
    ///
    /// Returns the payload of a frame completed by this byte.  The slice
    /// borrows the decoder's buffer and is valid until the next call.
    pub fn push_byte(&mut self, byte: u8) -> Option<&[u8]> {
        match self.state {
            FrameState::SeekMagic1 => {
                if byte == MAGIC1 {
                    self.state = FrameState::SeekMagic2;
                }
            }
            FrameState::SeekMagic2 => {
                self.state = match byte {
                    MAGIC2 => FrameState::LengthHi,
                    // A repeated first magic byte may open the real frame.
                    MAGIC1 => FrameState::SeekMagic2,
                    _ => FrameState::SeekMagic1,
                };
            }
            FrameState::LengthHi => {
                self.expected = (byte as usize) << 8;
                self.state = FrameState::LengthLo;
            }
            FrameState::LengthLo => {
                self.expected |= byte as usize;
                self.pos = 0;
                if self.expected > N {
                    debug!("frame length {} exceeds {}", self.expected, N);
                    self.stats.oversize = self.stats.oversize.wrapping_add(1);
                    self.reset();
                } else if self.expected == 0 {
                    self.state = FrameState::CrcHi;
                } else {
                    self.state = FrameState::Payload;
                }
            }
            FrameState::Payload => {
                self.buffer[self.pos] = byte;
                self.pos += 1;
                if self.pos == self.expected {
                    self.state = FrameState::CrcHi;
                }
            }
            FrameState::CrcHi => {
                self.rx_crc = (byte as u16) << 8;
                self.state = FrameState::CrcLo;
            }
            FrameState::CrcLo => {
                self.rx_crc |= byte as u16;
                let len = self.expected;
                let crc_ok = checksum(&self.buffer[..len]) == self.rx_crc;
                self.reset();
                if crc_ok {
                    self.stats.frames = self.stats.frames.wrapping_add(1);
                    return Some(&self.buffer[..len]);
                }
                debug!("frame crc mismatch, {} bytes dropped", len);
                self.stats.crc_errors = self.stats.crc_errors.wrapping_add(1);
            }
        }
        None
    }

    /// Feed a chunk, calling `on_frame` for every completed payload.
    pub fn feed<F>(&mut self, bytes: &[u8], mut on_frame: F)
    where
        F: FnMut(&[u8]),
    {
        for &b in bytes {
            if let Some(payload) = self.push_byte(b) {
                on_frame(payload);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; encoded_len(payload.len())];
        let n = encode(payload, &mut out).unwrap();
        out.truncate(n);
        out
    }

    fn decode_all<const N: usize>(dec: &mut FrameDecoder<N>, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        dec.feed(bytes, |p| frames.push(p.to_vec()));
        frames
    }

    #[test]
    fn crc_matches_ccitt_false_check_value() {
        // Catalogue check value for "123456789".
        assert_eq!(checksum(b"123456789"), 0x29B1);
    }

    #[test]
    fn encode_layout_is_big_endian() {
        let bytes = frame(&[0x01, 0x02, 0x03]);
        let crc = checksum(&[0x01, 0x02, 0x03]);
        assert_eq!(
            bytes,
            vec![0xAA, 0x55, 0x00, 0x03, 0x01, 0x02, 0x03, (crc >> 8) as u8, crc as u8]
        );
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let payload = vec![0u8; FRAME_MAX_PAYLOAD + 1];
        let mut out = vec![0u8; encoded_len(payload.len())];
        assert_eq!(encode(&payload, &mut out), Err(FrameError::PayloadTooLarge));
    }

    #[test]
    fn encode_rejects_short_buffer() {
        let mut out = [0u8; 5];
        assert_eq!(encode(&[1, 2], &mut out), Err(FrameError::BufferTooSmall));
    }

    #[test]
    fn round_trip_across_lengths() {
        let mut dec: FrameDecoder = FrameDecoder::new();
        for len in [0usize, 1, 2, 63, 64, 65, 255, 256, FRAME_MAX_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let frames = decode_all(&mut dec, &frame(&payload));
            assert_eq!(frames, vec![payload], "len {}", len);
        }
        assert_eq!(dec.state(), FrameState::SeekMagic1);
    }

    #[test]
    fn single_bit_flip_in_payload_or_crc_is_rejected_then_resyncs() {
        let payload = [0x10, 0x20, 0x30, 0x40, 0x50];
        let good = frame(&payload);
        // Bits in payload and CRC fields only.
        for byte in 4..good.len() {
            for bit in 0..8 {
                let mut corrupt = good.clone();
                corrupt[byte] ^= 1 << bit;
                let mut stream = corrupt;
                stream.extend_from_slice(&good);

                let mut dec: FrameDecoder<64> = FrameDecoder::new();
                let frames = decode_all(&mut dec, &stream);
                assert_eq!(frames, vec![payload.to_vec()], "byte {} bit {}", byte, bit);
                assert_eq!(dec.stats().crc_errors, 1);
            }
        }
    }

    #[test]
    fn repeated_magic1_keeps_seeking_magic2() {
        let mut dec: FrameDecoder<16> = FrameDecoder::new();
        let mut stream = vec![0xAA, 0xAA, 0xAA];
        stream.extend_from_slice(&frame(&[0x42])[1..]);
        assert_eq!(decode_all(&mut dec, &stream), vec![vec![0x42]]);
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut dec: FrameDecoder<16> = FrameDecoder::new();
        let mut stream = vec![0x00, 0x55, 0xAA, 0x12, 0xFF];
        stream.extend_from_slice(&frame(&[9, 8, 7]));
        assert_eq!(decode_all(&mut dec, &stream), vec![vec![9, 8, 7]]);
    }

    #[test]
    fn oversize_length_aborts_to_seek() {
        let mut dec: FrameDecoder<4> = FrameDecoder::new();
        for b in [0xAA, 0x55, 0x00, 0x05] {
            assert!(dec.push_byte(b).is_none());
        }
        assert_eq!(dec.state(), FrameState::SeekMagic1);
        assert_eq!(dec.stats().oversize, 1);

        // Next frame still decodes.
        assert_eq!(decode_all(&mut dec, &frame(&[1, 2, 3, 4])), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut dec: FrameDecoder = FrameDecoder::new();
        let mut stream = frame(b"hello");
        stream.extend_from_slice(&frame(b"world"));

        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            dec.feed(chunk, |p| frames.push(p.to_vec()));
        }
        assert_eq!(frames, vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(dec.stats().frames, 2);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut dec: FrameDecoder<16> = FrameDecoder::new();
        let f = frame(&[1, 2, 3]);
        dec.feed(&f[..5], |_| panic!("no frame expected"));
        assert_eq!(dec.state(), FrameState::Payload);
        dec.reset();
        assert_eq!(decode_all(&mut dec, &f), vec![vec![1, 2, 3]]);
    }
}

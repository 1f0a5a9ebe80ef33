//! Inbound frame reassembly.
//!
//! Notifications deliver arbitrary slices of the adapter's byte stream. The reassembler
//! accumulates them and cuts out complete `55 A9` frames:
//!
//! ```text
//! 55 A9 | dlc_hi dlc_lo | payload (dlc bytes) | crc
//! ```
//!
//! Bytes that cannot start a frame are dropped one at a time. Checksums are not checked here;
//! see [`InboundFrame::checksum_ok`].

use core::fmt;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::crc::Crc8;
use crate::frame::{INBOUND_HEADER, fmt_hex};

/// Header plus DLC.
pub const INBOUND_PREAMBLE_LEN: usize = 4;
pub const DEFAULT_MAX_BUFFER: usize = 4096;

/// A complete inbound frame as cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame(Vec<u8>);

impl InboundFrame {
    /// Wraps bytes that are already known to form one frame.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < INBOUND_PREAMBLE_LEN + 1 || !bytes.starts_with(&INBOUND_HEADER) {
            return None;
        }
        let dlc = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() != INBOUND_PREAMBLE_LEN + dlc + 1 {
            return None;
        }
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn data_len(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    /// Bytes between the DLC and the checksum.
    pub fn payload(&self) -> &[u8] {
        &self.0[INBOUND_PREAMBLE_LEN..self.0.len() - 1]
    }

    pub fn checksum(&self) -> u8 {
        self.0[self.0.len() - 1]
    }

    pub fn checksum_ok(&self, crc: Crc8) -> bool {
        crc.checksum(&self.0[INBOUND_HEADER.len()..self.0.len() - 1]) == self.checksum()
    }
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(f, &self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekingHeader,
    Accumulating { total: usize },
}

pub struct Reassembler {
    buffer: BytesMut,
    state: State,
    max_buffer: usize,
    discarded: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    /// `max_buffer` bounds the bytes held while no frame can be resolved. Frames whose DLC
    /// would not fit are treated as noise.
    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            state: State::SeekingHeader,
            max_buffer: max_buffer.max(INBOUND_PREAMBLE_LEN + 1),
            discarded: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.enforce_bound();
    }

    /// Extracts the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<InboundFrame> {
        loop {
            match self.state {
                State::SeekingHeader => {
                    if self.buffer.len() < INBOUND_PREAMBLE_LEN {
                        return None;
                    }
                    if self.buffer[..2] != INBOUND_HEADER {
                        debug!(byte = self.buffer[0], "dropping byte before header");
                        self.buffer.advance(1);
                        self.discarded += 1;
                        continue;
                    }
                    let dlc = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
                    let total = INBOUND_PREAMBLE_LEN + dlc + 1;
                    if total > self.max_buffer {
                        warn!(dlc, "malformed stream: frame length exceeds buffer limit");
                        self.buffer.advance(1);
                        self.discarded += 1;
                        continue;
                    }
                    self.state = State::Accumulating { total };
                }
                State::Accumulating { total } => {
                    if self.buffer.len() < total {
                        return None;
                    }
                    let frame = self.buffer.split_to(total).to_vec();
                    self.state = State::SeekingHeader;
                    return Some(InboundFrame(frame));
                }
            }
        }
    }

    pub fn drain_frames(&mut self) -> Vec<InboundFrame> {
        core::iter::from_fn(|| self.next_frame()).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes dropped so far, either while resynchronising or by a buffer reset.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::SeekingHeader;
    }

    fn enforce_bound(&mut self) {
        if self.buffer.len() <= self.max_buffer {
            return;
        }
        if self.buffer.windows(2).any(|w| w == INBOUND_HEADER) {
            return;
        }
        // A trailing 0x55 may still be the first half of a header.
        let keep = usize::from(self.buffer.last() == Some(&INBOUND_HEADER[0]));
        let dropped = self.buffer.len() - keep;
        warn!(dropped, "malformed stream: no header within buffer limit, resetting");
        self.buffer.advance(dropped);
        self.discarded += dropped as u64;
        self.state = State::SeekingHeader;
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resynchronises_after_garbage() {
        let mut r = Reassembler::new();
        r.feed(&[0x00, 0x55, 0xA9, 0x00, 0x01, 0xAB, 0xCC]);
        let frame = r.next_frame().unwrap();
        assert_eq!(frame.as_bytes(), &[0x55, 0xA9, 0x00, 0x01, 0xAB, 0xCC]);
        assert_eq!(frame.payload(), &[0xAB]);
        assert_eq!(frame.checksum(), 0xCC);
        assert!(r.next_frame().is_none());
        assert_eq!(r.len(), 0);
        assert_eq!(r.discarded(), 1);
    }

    #[test]
    fn split_delivery_matches_whole_delivery() {
        let bytes = hex::decode("55A900056280110A0B7F").unwrap();

        let mut whole = Reassembler::new();
        whole.feed(&bytes);
        let expected = whole.next_frame().unwrap();

        for split in 1..bytes.len() {
            let mut r = Reassembler::new();
            r.feed(&bytes[..split]);
            assert!(r.next_frame().is_none(), "split at {}", split);
            r.feed(&bytes[split..]);
            assert_eq!(r.next_frame().as_ref(), Some(&expected), "split at {}", split);
        }
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut r = Reassembler::new();
        r.feed(&hex::decode("55A90001FF0055A90001FE00").unwrap());
        let frames = r.drain_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload(), &[0xFF]);
        assert_eq!(frames[1].payload(), &[0xFE]);
    }

    #[test]
    fn leftover_is_kept_for_next_call() {
        let mut r = Reassembler::new();
        r.feed(&hex::decode("55A90001FF0055A900").unwrap());
        assert!(r.next_frame().is_some());
        assert!(r.next_frame().is_none());
        assert_eq!(r.len(), 3);
        r.feed(&[0x02, 0x50, 0x03, 0x99]);
        assert_eq!(r.next_frame().unwrap().payload(), &[0x50, 0x03]);
    }

    #[test]
    fn short_buffer_is_not_discarded() {
        let mut r = Reassembler::new();
        r.feed(&[0x12, 0x55, 0xA9]);
        assert!(r.next_frame().is_none());
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn header_split_by_garbage_resyncs() {
        let mut r = Reassembler::new();
        r.feed(&hex::decode("55005555A9000162AA").unwrap());
        assert_eq!(r.next_frame().unwrap().payload(), &[0x62]);
        assert_eq!(r.discarded(), 3);
    }

    #[test]
    fn empty_payload_frame() {
        let mut r = Reassembler::new();
        r.feed(&hex::decode("55A9000000").unwrap());
        let frame = r.next_frame().unwrap();
        assert_eq!(frame.data_len(), 0);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn garbage_beyond_limit_resets_buffer() {
        let mut r = Reassembler::with_max_buffer(16);
        r.feed(&[0x00; 20]);
        assert!(r.is_empty());
        assert_eq!(r.discarded(), 20);

        r.feed(&hex::decode("55A90001FF00").unwrap());
        assert_eq!(r.next_frame().unwrap().payload(), &[0xFF]);
    }

    #[test]
    fn trailing_header_byte_survives_reset() {
        let mut r = Reassembler::with_max_buffer(8);
        r.feed(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x55]);
        assert_eq!(r.len(), 1);
        r.feed(&hex::decode("A90001FF00").unwrap());
        assert_eq!(r.next_frame().unwrap().payload(), &[0xFF]);
    }

    #[test]
    fn oversized_dlc_is_noise() {
        let mut r = Reassembler::with_max_buffer(16);
        r.feed(&hex::decode("55A9FFFF55A90001FF00").unwrap());
        assert_eq!(r.next_frame().unwrap().payload(), &[0xFF]);
        assert_eq!(r.discarded(), 4);
    }

    #[test]
    fn checksum_check_is_opt_in() {
        let good = InboundFrame::from_bytes(vec![0x55, 0xA9, 0x00, 0x01, 0xFF, 0x79]).unwrap();
        assert!(good.checksum_ok(Crc8::COMMAND));

        // Acknowledgments seen from real adapters carry 0x00 here.
        let ack = InboundFrame::from_bytes(vec![0x55, 0xA9, 0x00, 0x01, 0xFF, 0x00]).unwrap();
        assert!(!ack.checksum_ok(Crc8::COMMAND));
        assert!(!ack.checksum_ok(Crc8::SEGMENT));
    }

    #[test]
    fn from_bytes_validates_length() {
        assert!(InboundFrame::from_bytes(vec![0x55, 0xA9, 0x00, 0x02, 0x01, 0x00]).is_none());
        assert!(InboundFrame::from_bytes(vec![0xAA, 0xA6, 0x00, 0x01, 0x01, 0x00]).is_none());
    }
}

//! Outbound frame construction.
//!
//! Every outbound frame starts with `AA A6` and ends with a CRC-8 computed over all bytes
//! between the header and the checksum itself. Two body layouts exist:
//!
//! ```text
//! command mode:   AA A6 | cmd | len_hi len_lo | payload (len bytes)       | crc
//! segmented mode: AA A6 | idx | tot_hi tot_lo | slice (capacity, FF pad) | crc
//! ```

use core::fmt;

use thiserror::Error;

use crate::command::AdapterCommand;
use crate::crc::Crc8;

pub const OUTBOUND_HEADER: [u8; 2] = [0xAA, 0xA6];
pub const INBOUND_HEADER: [u8; 2] = [0x55, 0xA9];

pub const CMD_UDS_SMALL: u8 = 0x00;
pub const CMD_UDS_LARGE: u8 = 0x01;
/// Payloads at least this long are sent with [`CMD_UDS_LARGE`].
pub const LARGE_PAYLOAD_THRESHOLD: usize = 128;

pub const SEGMENT_CAPACITY: usize = 16;
pub const SEGMENT_FILL: u8 = 0xFF;

/// Header + command/index byte + 2-byte length field.
const PREAMBLE_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    TooLong { len: usize, max: usize },
    #[error("frame does not start with the AA A6 header")]
    MissingHeader,
    #[error("segment capacity must be non-zero")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short, need at least {needed} bytes")]
    TooShort { needed: usize },
    #[error("unexpected frame header")]
    BadHeader,
    #[error("length field says {expected} bytes, frame carries {got}")]
    BadLength { expected: usize, got: usize },
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{got:02X}")]
    BadChecksum { expected: u8, got: u8 },
    #[error("segment {index} out of order")]
    SegmentOrder { index: u8 },
}

/// A complete outbound frame, checksum included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(f, &self.0)
    }
}

pub(crate) fn fmt_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{:02X}", b)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEncoder {
    pub command_crc: Crc8,
    pub segment_crc: Crc8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            command_crc: Crc8::COMMAND,
            segment_crc: Crc8::SEGMENT,
        }
    }
}

impl FrameEncoder {
    pub fn new(command_crc: Crc8, segment_crc: Crc8) -> Self {
        Self {
            command_crc,
            segment_crc,
        }
    }

    /// Appends the checksum to a literal frame that already carries the `AA A6` header.
    pub fn encode_fixed(&self, bytes: &[u8]) -> Result<Frame, EncodeError> {
        if !bytes.starts_with(&OUTBOUND_HEADER) {
            return Err(EncodeError::MissingHeader);
        }
        Ok(seal(self.command_crc, bytes.to_vec()))
    }

    pub fn encode_config<C: AdapterCommand>(&self, cmd: &C) -> Frame {
        let mut body = Vec::with_capacity(PREAMBLE_LEN + cmd.payload_len() + 1);
        body.extend_from_slice(&OUTBOUND_HEADER);
        body.push(C::COMMAND);
        body.extend_from_slice(&C::LENGTH.to_be_bytes());
        cmd.write_fields(&mut body);
        seal(self.command_crc, body)
    }

    pub fn encode_uds_payload(&self, payload: &[u8]) -> Result<Frame, EncodeError> {
        let len = u16::try_from(payload.len()).map_err(|_| EncodeError::TooLong {
            len: payload.len(),
            max: u16::MAX as usize,
        })?;
        let cmd = if payload.len() >= LARGE_PAYLOAD_THRESHOLD {
            CMD_UDS_LARGE
        } else {
            CMD_UDS_SMALL
        };

        let mut body = Vec::with_capacity(PREAMBLE_LEN + payload.len() + 1);
        body.extend_from_slice(&OUTBOUND_HEADER);
        body.push(cmd);
        body.extend_from_slice(&len.to_be_bytes());
        body.extend_from_slice(payload);
        Ok(seal(self.command_crc, body))
    }

    pub fn segments<'a>(
        &self,
        blob: &'a [u8],
        capacity: usize,
    ) -> Result<SegmentTx<'a>, EncodeError> {
        SegmentTx::new(self.segment_crc, blob, capacity)
    }

    /// Splits `blob` into `ceil(len / capacity)` indexed frames. An empty blob yields no frames.
    pub fn encode_segments(&self, blob: &[u8], capacity: usize) -> Result<Vec<Frame>, EncodeError> {
        Ok(self.segments(blob, capacity)?.collect())
    }
}

fn seal(crc: Crc8, mut body: Vec<u8>) -> Frame {
    let checksum = crc.checksum(&body[OUTBOUND_HEADER.len()..]);
    body.push(checksum);
    Frame(body)
}

/// Iterator over the indexed frames of a segmented transfer.
pub struct SegmentTx<'a> {
    crc: Crc8,
    data: &'a [u8],
    capacity: usize,
    total: [u8; 2],
    next_index: u8,
    offset: usize,
}

impl<'a> SegmentTx<'a> {
    fn new(crc: Crc8, data: &'a [u8], capacity: usize) -> Result<Self, EncodeError> {
        if capacity == 0 {
            return Err(EncodeError::ZeroCapacity);
        }
        let max = (u16::MAX as usize).min(capacity * u8::MAX as usize);
        if data.len() > max {
            return Err(EncodeError::TooLong {
                len: data.len(),
                max,
            });
        }
        Ok(Self {
            crc,
            data,
            capacity,
            total: (data.len() as u16).to_be_bytes(),
            next_index: 1,
            offset: 0,
        })
    }

    pub fn count_total(&self) -> usize {
        self.data.len().div_ceil(self.capacity)
    }
}

impl Iterator for SegmentTx<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.offset >= self.data.len() {
            return None;
        }

        let end = (self.offset + self.capacity).min(self.data.len());
        let slice = &self.data[self.offset..end];

        let mut body = Vec::with_capacity(PREAMBLE_LEN + self.capacity + 1);
        body.extend_from_slice(&OUTBOUND_HEADER);
        body.push(self.next_index);
        body.extend_from_slice(&self.total);
        body.extend_from_slice(slice);
        body.resize(PREAMBLE_LEN + self.capacity, SEGMENT_FILL);

        self.offset = end;
        self.next_index = self.next_index.wrapping_add(1);

        Some(seal(self.crc, body))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.data.len() - self.offset).div_ceil(self.capacity);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SegmentTx<'_> {}

fn check_outbound(frame: &[u8], crc: Crc8) -> Result<(), DecodeError> {
    if frame.len() < PREAMBLE_LEN + 1 {
        return Err(DecodeError::TooShort {
            needed: PREAMBLE_LEN + 1,
        });
    }
    if !frame.starts_with(&OUTBOUND_HEADER) {
        return Err(DecodeError::BadHeader);
    }
    let (body, tail) = frame.split_at(frame.len() - 1);
    let expected = crc.checksum(&body[OUTBOUND_HEADER.len()..]);
    if tail[0] != expected {
        return Err(DecodeError::BadChecksum {
            expected,
            got: tail[0],
        });
    }
    Ok(())
}

/// Returns the command byte and payload of a command-mode frame.
pub fn decode_payload(frame: &[u8], crc: Crc8) -> Result<(u8, &[u8]), DecodeError> {
    check_outbound(frame, crc)?;
    let len = u16::from_be_bytes([frame[3], frame[4]]) as usize;
    let payload = &frame[PREAMBLE_LEN..frame.len() - 1];
    if payload.len() != len {
        return Err(DecodeError::BadLength {
            expected: len,
            got: payload.len(),
        });
    }
    Ok((frame[2], payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub index: u8,
    pub total_len: u16,
    /// The fixed-capacity slice, padding included.
    pub data: &'a [u8],
}

pub fn decode_segment(frame: &[u8], crc: Crc8) -> Result<Segment<'_>, DecodeError> {
    check_outbound(frame, crc)?;
    Ok(Segment {
        index: frame[2],
        total_len: u16::from_be_bytes([frame[3], frame[4]]),
        data: &frame[PREAMBLE_LEN..frame.len() - 1],
    })
}

/// Concatenates segment slices in index order and trims the padding using the shared total.
pub fn reassemble_segments<F: AsRef<[u8]>>(frames: &[F], crc: Crc8) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut total = None;
    for (i, f) in frames.iter().enumerate() {
        let seg = decode_segment(f.as_ref(), crc)?;
        if seg.index as usize != i + 1 {
            return Err(DecodeError::SegmentOrder { index: seg.index });
        }
        let t = *total.get_or_insert(seg.total_len);
        if t != seg.total_len {
            return Err(DecodeError::BadLength {
                expected: t as usize,
                got: seg.total_len as usize,
            });
        }
        out.extend_from_slice(seg.data);
    }
    let total = total.unwrap_or(0) as usize;
    if out.len() < total {
        return Err(DecodeError::BadLength {
            expected: total,
            got: out.len(),
        });
    }
    out.truncate(total);
    Ok(out)
}

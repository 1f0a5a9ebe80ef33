//! In-process adapter that answers like a BLE-CAN dongle with one ECU behind it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::command::{CMD_CAN_CONFIG, CMD_FLOW_CONTROL, FLOWCONTROL_DONE, RECONFIG_DONE};
use crate::crc::Crc8;
use crate::error::TransportError;
use crate::frame::{
    CMD_UDS_LARGE, CMD_UDS_SMALL, FrameEncoder, INBOUND_HEADER, OUTBOUND_HEADER,
    SEGMENT_CAPACITY, decode_payload, decode_segment, reassemble_segments,
};
use crate::inbound::{self, Inbound, segment_ack};
use crate::session::{Session, SessionConfig, Transport};
use crate::uds::{self, UdsErrorCode, did};

const SEGMENT_FRAME_LEN: usize = 5 + SEGMENT_CAPACITY + 1;

pub struct SimAdapter {
    tx: mpsc::Sender<Vec<u8>>,
    encoder: FrameEncoder,
    dids: BTreeMap<u16, Vec<u8>>,
    fail_writes: u32,
    mute: u32,
    chunk_size: Option<usize>,
    noise: Vec<u8>,
    written: Vec<Vec<u8>>,
    segments: Vec<Vec<u8>>,
}

impl SimAdapter {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        let mut dids = BTreeMap::new();
        dids.insert(did::VIN, b"WVWZZZ1JZXW000001".to_vec());
        dids.insert(did::ECU_SERIAL, b"SN0042".to_vec());
        dids.insert(did::SOFTWARE_VERSION, b"0815".to_vec());
        dids.insert(0x0174, vec![0x00, 0x2A]);
        Self {
            tx,
            encoder: FrameEncoder::default(),
            dids,
            fail_writes: 0,
            mute: 0,
            chunk_size: None,
            noise: Vec::new(),
            written: Vec::new(),
            segments: Vec::new(),
        }
    }

    /// Wires a fresh adapter to a session over a new notification channel.
    pub fn session(config: SessionConfig) -> Session<SimAdapter> {
        let (tx, inbound): (_, Inbound) =
            inbound::channel(inbound::DEFAULT_CHANNEL_CAPACITY, config.max_buffer);
        Session::new(SimAdapter::new(tx), inbound, config)
    }

    pub fn with_did(mut self, id: u16, value: impl Into<Vec<u8>>) -> Self {
        self.dids.insert(id, value.into());
        self
    }

    /// The next `n` writes fail.
    pub fn fail_next_writes(&mut self, n: u32) {
        self.fail_writes = n;
    }

    /// The next `n` accepted writes get no answer.
    pub fn mute_next(&mut self, n: u32) {
        self.mute = n;
    }

    /// Splits every notification into chunks of at most `size` bytes.
    pub fn set_chunk_size(&mut self, size: Option<usize>) {
        self.chunk_size = size.filter(|&s| s > 0);
    }

    /// Bytes sent ahead of every reply.
    pub fn set_noise(&mut self, noise: impl Into<Vec<u8>>) {
        self.noise = noise.into();
    }

    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    /// Blob rebuilt from the segment frames received so far.
    pub fn received_blob(&self) -> Option<Vec<u8>> {
        reassemble_segments(&self.segments, self.encoder.segment_crc).ok()
    }

    fn reply_for(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if !frame.starts_with(&OUTBOUND_HEADER) || frame.len() < 6 {
            warn!(frame = %hex::encode_upper(frame), "ignoring frame without header");
            return None;
        }

        if frame.len() == SEGMENT_FRAME_LEN && frame[2] != 0 {
            if let Ok(seg) = decode_segment(frame, self.encoder.segment_crc) {
                debug!(index = seg.index, total = seg.total_len, "segment received");
                // A retransmission replaces the copy whose ACK got lost.
                if self.segments.last().is_some_and(|last| last[2] == seg.index) {
                    self.segments.pop();
                }
                self.segments.push(frame.to_vec());
                return Some(segment_ack(seg.index).to_vec());
            }
        }

        let crc = self.encoder.command_crc;
        if crc.checksum(&frame[OUTBOUND_HEADER.len()..frame.len() - 1]) != frame[frame.len() - 1] {
            warn!(frame = %hex::encode_upper(frame), "ignoring frame with bad checksum");
            return None;
        }
        match frame[2] {
            CMD_CAN_CONFIG => Some(RECONFIG_DONE.to_vec()),
            CMD_FLOW_CONTROL => Some(FLOWCONTROL_DONE.to_vec()),
            CMD_UDS_SMALL | CMD_UDS_LARGE => match decode_payload(frame, crc) {
                Ok((_, payload)) => Some(inbound_frame(crc, &self.answer(payload))),
                Err(e) => {
                    warn!(error = %e, "malformed request");
                    None
                }
            },
            other => {
                warn!(command = other, "unknown adapter command");
                None
            }
        }
    }

    fn answer(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sid) = request.first() else {
            return negative(0x00, UdsErrorCode::IncorrectMessageLengthOrInvalidFormat);
        };
        match (sid, &request[1..]) {
            (uds::SID_TESTER_PRESENT, [sub, ..]) => vec![uds::SID_TESTER_PRESENT_RESP, *sub],
            (uds::SID_DIAGNOSTIC_SESSION_CONTROL, [session, ..]) => vec![
                uds::SID_DIAGNOSTIC_SESSION_CONTROL_RESP,
                *session,
                0x00,
                0x32,
                0x01,
                0xF4,
            ],
            (uds::SID_RDBI_REQ, [hi, lo, ..]) => {
                let id = u16::from_be_bytes([*hi, *lo]);
                match self.dids.get(&id) {
                    Some(value) => {
                        let mut resp = vec![uds::SID_RDBI_RESP, *hi, *lo];
                        resp.extend_from_slice(value);
                        resp
                    }
                    None => negative(sid, UdsErrorCode::RequestOutOfRange),
                }
            }
            (uds::SID_ROUTINE_CONTROL, [sub, rid_hi, rid_lo, ..]) => {
                vec![uds::SID_ROUTINE_CONTROL_RESP, *sub, *rid_hi, *rid_lo, 0x00]
            }
            (uds::SID_READ_DTC_INFORMATION, [report, ..]) => {
                vec![uds::SID_READ_DTC_INFORMATION + 0x40, *report, 0xFF]
            }
            (
                uds::SID_TESTER_PRESENT
                | uds::SID_DIAGNOSTIC_SESSION_CONTROL
                | uds::SID_RDBI_REQ
                | uds::SID_ROUTINE_CONTROL
                | uds::SID_READ_DTC_INFORMATION,
                _,
            ) => negative(sid, UdsErrorCode::IncorrectMessageLengthOrInvalidFormat),
            _ => negative(sid, UdsErrorCode::ServiceNotSupported),
        }
    }

    fn deliver(&self, reply: Vec<u8>) {
        let mut bytes = self.noise.clone();
        bytes.extend_from_slice(&reply);
        let size = self.chunk_size.unwrap_or(bytes.len().max(1));
        for chunk in bytes.chunks(size) {
            if self.tx.try_send(chunk.to_vec()).is_err() {
                warn!("notification channel full or closed, dropping reply");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SimAdapter {
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.written.push(frame.to_vec());
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(TransportError::Write("simulated write failure".into()));
        }
        if self.tx.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let Some(reply) = self.reply_for(frame) else {
            return Ok(());
        };
        if self.mute > 0 {
            self.mute -= 1;
            debug!("muted reply");
            return Ok(());
        }
        self.deliver(reply);
        Ok(())
    }
}

fn negative(sid: u8, code: UdsErrorCode) -> Vec<u8> {
    vec![uds::SID_NEG_RESPONSE, sid, code.as_u8()]
}

/// `55 A9 len payload crc`, with the checksum taken over the length and payload.
pub fn inbound_frame(crc: Crc8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.extend_from_slice(&INBOUND_HEADER);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(crc.checksum(&out[INBOUND_HEADER.len()..]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CanFilterConfig;

    fn adapter() -> (SimAdapter, Inbound) {
        let (tx, inbound) = inbound::channel(16, 4096);
        (SimAdapter::new(tx), inbound)
    }

    async fn next_payload(inbound: &mut Inbound) -> Vec<u8> {
        inbound
            .try_take_frame(std::time::Duration::from_secs(1))
            .await
            .unwrap()
            .payload()
            .to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn answers_rdbi() {
        let (mut sim, mut inbound) = adapter();
        let frame = sim
            .encoder
            .encode_uds_payload(&uds::read_data_by_identifier(did::VIN))
            .unwrap();
        sim.write(frame.as_bytes()).await.unwrap();
        let payload = next_payload(&mut inbound).await;
        assert_eq!(&payload[..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&payload[3..], b"WVWZZZ1JZXW000001");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_did_is_out_of_range() {
        let (mut sim, mut inbound) = adapter();
        let frame = sim
            .encoder
            .encode_uds_payload(&uds::read_data_by_identifier(0x1234))
            .unwrap();
        sim.write(frame.as_bytes()).await.unwrap();
        assert_eq!(next_payload(&mut inbound).await, vec![0x7F, 0x22, 0x31]);
    }

    #[tokio::test(start_paused = true)]
    async fn config_frame_gets_literal_ack() {
        let (mut sim, mut inbound) = adapter();
        let frame = sim.encoder.encode_config(&CanFilterConfig::default());
        sim.write(frame.as_bytes()).await.unwrap();
        inbound
            .wait_for_pattern(&RECONFIG_DONE, std::time::Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn segment_gets_indexed_ack() {
        let (mut sim, mut inbound) = adapter();
        let frames = sim.encoder.encode_segments(&[0x42; 20], 16).unwrap();
        for f in &frames {
            sim.write(f.as_bytes()).await.unwrap();
        }
        inbound
            .wait_for_indexed_ack(2, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sim.received_blob().unwrap(), vec![0x42; 20]);
    }

    #[test]
    fn replies_carry_valid_checksum() {
        let frame = inbound_frame(Crc8::COMMAND, &[0x7E, 0x00]);
        assert_eq!(&frame[..4], &[0x55, 0xA9, 0x00, 0x02]);
        let parsed = crate::reassembler::InboundFrame::from_bytes(frame).unwrap();
        assert!(parsed.checksum_ok(Crc8::COMMAND));
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_service() {
        let (mut sim, mut inbound) = adapter();
        let frame = sim.encoder.encode_uds_payload(&[0x2E, 0xF1, 0x90]).unwrap();
        sim.write(frame.as_bytes()).await.unwrap();
        assert_eq!(next_payload(&mut inbound).await, vec![0x7F, 0x2E, 0x11]);
    }
}

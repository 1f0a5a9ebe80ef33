//! Send, wait, retry.
//!
//! A [`Session`] owns one transport and the consuming end of its notification channel. Only one
//! frame is in flight at a time. For every frame it:
//!
//! 1. sleeps `backoff_base + retries * backoff_step`,
//! 2. writes the frame (a failed write counts as a failed attempt and skips the wait),
//! 3. waits for the acknowledgment selected by [`AckMode`],
//!
//! and gives up after `max_attempts`. A sequence stops at its first failed frame.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::command::{AdapterCommand, CanFilterConfig, FlowControlConfig};
use crate::crc::Crc8;
use crate::error::{AttemptError, Result, SessionError, TransportError};
use crate::frame::{Frame, FrameEncoder, OUTBOUND_HEADER, SEGMENT_CAPACITY};
use crate::inbound::{Inbound, InboundError};
use crate::reassembler::{DEFAULT_MAX_BUFFER, InboundFrame};
use crate::uds::{self, UdsResponse};

#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, frame: &[u8]) -> std::result::Result<(), TransportError>;
}

/// What counts as an acknowledgment for a written frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    /// Any complete `55 A9` frame; its content is not checked.
    AnyFrame,
    /// `55 A9 03 <index>` where index is the segment index byte of the written frame.
    IndexedAck,
    /// This exact byte sequence anywhere in the notification stream.
    Literal(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// Accept every framed response.
    #[default]
    Ignore,
    /// Drop responses whose trailing byte is not the CRC of the DLC and payload.
    Verify(Crc8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_attempts: u32,
    pub response_timeout: Duration,
    /// Timeout for [`AckMode::Literal`] waits.
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_step: Duration,
    /// Pause after each write, for links that write without response.
    pub post_write_delay: Option<Duration>,
    pub inbound_checksum: ChecksumPolicy,
    pub max_buffer: usize,
    /// Pause between configuration commands.
    pub step_delay: Duration,
    /// Pause after the last configuration command.
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            response_timeout: Duration::from_millis(2000),
            ack_timeout: Duration::from_millis(5000),
            backoff_base: Duration::from_millis(100),
            backoff_step: Duration::from_millis(50),
            post_write_delay: None,
            inbound_checksum: ChecksumPolicy::Ignore,
            max_buffer: DEFAULT_MAX_BUFFER,
            step_delay: Duration::from_millis(200),
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    pub fn backoff(&self, retries: u32) -> Duration {
        self.backoff_base + self.backoff_step * retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// `response` is set for [`AckMode::AnyFrame`] only.
    Acked { response: Option<InboundFrame> },
    Failed(AttemptError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOutcome {
    /// 1-based position in the sequence
    pub index: usize,
    pub attempts: u32,
    /// Failed attempts before the outcome was decided.
    pub retries: u32,
    pub status: FrameStatus,
}

impl FrameOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self.status, FrameStatus::Acked { .. })
    }

    pub fn response(&self) -> Option<&InboundFrame> {
        match &self.status {
            FrameStatus::Acked { response } => response.as_ref(),
            FrameStatus::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceReport {
    pub outcomes: Vec<FrameOutcome>,
    /// Index of the frame that stopped the sequence.
    pub failed: Option<usize>,
}

impl SequenceReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    pub fn into_result(self) -> Result<Vec<FrameOutcome>> {
        match self.outcomes.last() {
            Some(FrameOutcome {
                index,
                attempts,
                status: FrameStatus::Failed(cause),
                ..
            }) => Err(SessionError::FrameFailed {
                index: *index,
                attempts: *attempts,
                cause: cause.clone(),
            }),
            _ => Ok(self.outcomes),
        }
    }
}

pub struct Session<T> {
    transport: T,
    inbound: Inbound,
    encoder: FrameEncoder,
    config: SessionConfig,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, inbound: Inbound, config: SessionConfig) -> Self {
        Self {
            transport,
            inbound,
            encoder: FrameEncoder::default(),
            config,
        }
    }

    pub fn with_encoder(mut self, encoder: FrameEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn encoder(&self) -> &FrameEncoder {
        &self.encoder
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn inbound(&self) -> &Inbound {
        &self.inbound
    }

    pub fn into_parts(self) -> (T, Inbound) {
        (self.transport, self.inbound)
    }

    /// Drives one frame through write/wait/retry until it is acknowledged or out of attempts.
    pub async fn transact(&mut self, index: usize, frame: &Frame, ack: &AckMode) -> FrameOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut cause = AttemptError::AckTimeout(self.ack_window(ack));

        while attempts < max_attempts {
            let retries = attempts;
            sleep(self.config.backoff(retries)).await;
            if attempts == 0 {
                // Late replies to an earlier frame must not answer this one.
                self.inbound.discard_pending();
            }
            attempts += 1;

            debug!(index, attempt = attempts, max_attempts, %frame, "writing frame");
            if let Err(e) = self.transport.write(frame.as_bytes()).await {
                warn!(index, attempt = attempts, error = %e, "write failed");
                cause = AttemptError::TransportWrite(e);
                continue;
            }
            if let Some(delay) = self.config.post_write_delay {
                sleep(delay).await;
            }

            match self.await_ack(frame, ack).await {
                Ok(response) => {
                    info!(index, attempts, "frame acknowledged");
                    return FrameOutcome {
                        index,
                        attempts,
                        retries,
                        status: FrameStatus::Acked { response },
                    };
                }
                Err(InboundError::Closed) => {
                    cause = AttemptError::Closed;
                    break;
                }
                Err(InboundError::Timeout) => {
                    warn!(index, attempt = attempts, max_attempts, "no acknowledgment, retrying");
                    cause = AttemptError::AckTimeout(self.ack_window(ack));
                }
            }
        }

        error!(index, attempts, %cause, "frame failed");
        FrameOutcome {
            index,
            attempts,
            retries: attempts,
            status: FrameStatus::Failed(cause),
        }
    }

    /// Runs `frames` in order, stopping at the first frame that exhausts its attempts.
    pub async fn run_sequence(&mut self, frames: &[Frame], ack: &AckMode) -> SequenceReport {
        self.run_sequence_with_progress(frames, ack, |_, _| {}).await
    }

    pub async fn run_sequence_with_progress(
        &mut self,
        frames: &[Frame],
        ack: &AckMode,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> SequenceReport {
        let mut report = SequenceReport::default();
        for (i, frame) in frames.iter().enumerate() {
            progress(i, frames.len());
            let outcome = self.transact(i + 1, frame, ack).await;
            let acked = outcome.is_acked();
            report.outcomes.push(outcome);
            if !acked {
                report.failed = Some(i + 1);
                warn!(index = i + 1, total = frames.len(), "sequence aborted");
                return report;
            }
        }
        progress(frames.len(), frames.len());
        report
    }

    /// Applies CAN filter and flow control settings, each confirmed by its literal ack.
    pub async fn configure(
        &mut self,
        can: &CanFilterConfig,
        flow: &FlowControlConfig,
    ) -> Result<()> {
        self.configure_step(1, can).await?;
        sleep(self.config.step_delay).await;
        self.configure_step(2, flow).await?;
        sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn configure_step<C: AdapterCommand>(&mut self, index: usize, cmd: &C) -> Result<()> {
        let frame = self.encoder.encode_config(cmd);
        info!(step = C::NAME, %frame, "sending configuration");
        let outcome = self
            .transact(index, &frame, &AckMode::Literal(C::ACK.to_vec()))
            .await;
        single(outcome)?;
        info!(step = C::NAME, "configuration confirmed");
        Ok(())
    }

    /// Sends one UDS request and classifies the adapter's framed response.
    pub async fn request(&mut self, payload: &[u8]) -> Result<UdsResponse> {
        self.request_at(1, payload).await
    }

    async fn request_at(&mut self, index: usize, payload: &[u8]) -> Result<UdsResponse> {
        let frame = self.encoder.encode_uds_payload(payload)?;
        let outcome = self.transact(index, &frame, &AckMode::AnyFrame).await;
        let response = single(outcome)?
            .response()
            .map(uds::interpret)
            .unwrap_or(UdsResponse::NoData);
        Ok(response)
    }

    /// Sends named requests in order and stops at the first one that gets no response.
    pub async fn run_requests<S: AsRef<str>>(
        &mut self,
        requests: &[(S, Vec<u8>)],
    ) -> Result<Vec<UdsResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for (i, (name, payload)) in requests.iter().enumerate() {
            let name = name.as_ref();
            info!(request = name, index = i + 1, total = requests.len(), "sending request");
            let response = self.request_at(i + 1, payload).await?;
            info!(request = name, %response, "request completed");
            responses.push(response);
        }
        Ok(responses)
    }

    /// Splits `blob` into indexed segments and sends them, each confirmed by its indexed ACK.
    pub async fn send_segmented(
        &mut self,
        blob: &[u8],
        progress: impl FnMut(usize, usize) + Send,
    ) -> Result<SequenceReport> {
        let frames = self.encoder.encode_segments(blob, SEGMENT_CAPACITY)?;
        info!(bytes = blob.len(), segments = frames.len(), "segmented transfer");
        let report = self
            .run_sequence_with_progress(&frames, &AckMode::IndexedAck, progress)
            .await;
        Ok(report)
    }

    async fn await_ack(
        &mut self,
        frame: &Frame,
        ack: &AckMode,
    ) -> std::result::Result<Option<InboundFrame>, InboundError> {
        match ack {
            AckMode::AnyFrame => {
                let deadline = Instant::now() + self.config.response_timeout;
                loop {
                    let reply = self.inbound.take_frame_by(deadline).await?;
                    if let ChecksumPolicy::Verify(crc) = self.config.inbound_checksum {
                        if !reply.checksum_ok(crc) {
                            warn!(%reply, "dropping response with bad checksum");
                            continue;
                        }
                    }
                    debug!(%reply, response = %uds::interpret(&reply), "response");
                    return Ok(Some(reply));
                }
            }
            AckMode::IndexedAck => self
                .inbound
                .wait_for_indexed_ack(segment_index(frame), self.config.response_timeout)
                .await
                .map(|_| None),
            AckMode::Literal(pattern) => self
                .inbound
                .wait_for_pattern(pattern, self.config.ack_timeout)
                .await
                .map(|_| None),
        }
    }

    fn ack_window(&self, ack: &AckMode) -> Duration {
        match ack {
            AckMode::Literal(_) => self.config.ack_timeout,
            _ => self.config.response_timeout,
        }
    }
}

/// Index byte a segment frame carries after the `AA A6` header.
fn segment_index(frame: &Frame) -> u8 {
    frame.as_bytes().get(OUTBOUND_HEADER.len()).copied().unwrap_or(0)
}

fn single(outcome: FrameOutcome) -> Result<FrameOutcome> {
    match outcome.status {
        FrameStatus::Acked { .. } => Ok(outcome),
        FrameStatus::Failed(cause) => Err(SessionError::FrameFailed {
            index: outcome.index,
            attempts: outcome.attempts,
            cause,
        }),
    }
}

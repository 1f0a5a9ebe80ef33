//! Waiting on the adapter's notification stream.
//!
//! The transport pushes notification payloads into a bounded channel; [`Inbound`] is the
//! consuming end. All waits take a timeout that is fixed when the wait starts and is not
//! extended by incoming data.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::frame::INBOUND_HEADER;
use crate::reassembler::{InboundFrame, Reassembler};

/// Literal-match windows longer than this are cut down to their tail.
const PATTERN_WINDOW_MAX: usize = 50;
const PATTERN_WINDOW_KEEP: usize = 20;

/// Second byte after the header in a segment acknowledgment.
pub const SEGMENT_ACK_TYPE: u8 = 0x03;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InboundError {
    #[error("timed out waiting for notification")]
    Timeout,
    #[error("notification stream closed")]
    Closed,
}

pub fn segment_ack(index: u8) -> [u8; 4] {
    [INBOUND_HEADER[0], INBOUND_HEADER[1], SEGMENT_ACK_TYPE, index]
}

/// Creates the notification channel. The sender goes to the transport's notification handler.
pub fn channel(capacity: usize, max_buffer: usize) -> (mpsc::Sender<Vec<u8>>, Inbound) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Inbound::new(rx, Reassembler::with_max_buffer(max_buffer)))
}

pub struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    reassembler: Reassembler,
}

impl Inbound {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, reassembler: Reassembler) -> Self {
        Self { rx, reassembler }
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Waits for the next complete `55 A9` frame.
    pub async fn try_take_frame(&mut self, timeout: Duration) -> Result<InboundFrame, InboundError> {
        self.take_frame_by(Instant::now() + timeout).await
    }

    pub async fn take_frame_by(&mut self, deadline: Instant) -> Result<InboundFrame, InboundError> {
        loop {
            if let Some(frame) = self.reassembler.next_frame() {
                debug!(%frame, "complete inbound frame");
                return Ok(frame);
            }
            let chunk = self.recv_by(deadline).await?;
            self.reassembler.feed(&chunk);
        }
    }

    /// Waits until `pattern` shows up anywhere in the bytes received from now on.
    pub async fn wait_for_pattern(
        &mut self,
        pattern: &[u8],
        timeout: Duration,
    ) -> Result<(), InboundError> {
        let deadline = Instant::now() + timeout;
        let mut window: Vec<u8> = Vec::new();
        loop {
            let chunk = self.recv_by(deadline).await?;
            window.extend_from_slice(&chunk);
            if contains(&window, pattern) {
                return Ok(());
            }
            if window.len() > PATTERN_WINDOW_MAX {
                let keep = PATTERN_WINDOW_KEEP.max(pattern.len().saturating_sub(1));
                window.drain(..window.len().saturating_sub(keep));
            }
        }
    }

    pub async fn wait_for_indexed_ack(
        &mut self,
        index: u8,
        timeout: Duration,
    ) -> Result<(), InboundError> {
        self.wait_for_pattern(&segment_ack(index), timeout).await
    }

    /// Drops queued notifications and any partial frame.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = self.reassembler.len();
        while let Ok(chunk) = self.rx.try_recv() {
            dropped += chunk.len();
        }
        self.reassembler.clear();
        if dropped > 0 {
            debug!(dropped, "discarded stale inbound bytes");
        }
        dropped
    }

    async fn recv_by(&mut self, deadline: Instant) -> Result<Vec<u8>, InboundError> {
        match timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(chunk)) => {
                trace!(len = chunk.len(), bytes = %hex::encode_upper(&chunk), "notification");
                Ok(chunk)
            }
            Ok(None) => Err(InboundError::Closed),
            Err(_) => Err(InboundError::Timeout),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

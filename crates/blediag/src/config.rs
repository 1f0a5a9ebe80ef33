//! TOML configuration for the adapter link.
//!
//! Every field is optional; missing fields fall back to the values that work with the common
//! `X_ble_OBD2` dongles on a 500 kbit/s diagnostic bus.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use blecan::command::{CanFilterConfig, FlowControlConfig};
use blecan::crc::Crc8;
use blecan::session::{ChecksumPolicy, SessionConfig};
use serde::Deserialize;
use uuid::{Uuid, uuid};

pub const WRITE_UUID: Uuid = uuid!("0000FFF2-0000-1000-8000-00805F9B34FB");
pub const NOTIFY_UUID: Uuid = uuid!("0000FFF1-0000-1000-8000-00805F9B34FB");
pub const DEVICE_NAME: &str = "X_ble_OBD2";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Peripheral address or platform id; takes precedence over `name`
    pub address: Option<String>,
    pub name: String,
    pub write_uuid: Uuid,
    pub notify_uuid: Uuid,
    /// Use acknowledged GATT writes. Without them every write is followed by a short pause.
    pub write_with_response: bool,
    pub scan_secs: u64,
    /// Pause between subscribing to notifications and the first write.
    pub notify_settle_ms: u64,
    pub session: SessionSettings,
    pub can: CanSettings,
    pub flow: FlowSettings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            name: DEVICE_NAME.to_string(),
            write_uuid: WRITE_UUID,
            notify_uuid: NOTIFY_UUID,
            write_with_response: !cfg!(target_os = "macos"),
            scan_secs: 5,
            notify_settle_ms: 500,
            session: SessionSettings::default(),
            can: CanSettings::default(),
            flow: FlowSettings::default(),
        }
    }
}

impl DeviceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn notify_settle(&self) -> Duration {
        Duration::from_millis(self.notify_settle_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        let post_write_delay = match s.post_write_delay_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None if !self.write_with_response => Some(Duration::from_millis(50)),
            None => None,
        };
        SessionConfig {
            max_attempts: s.max_attempts,
            response_timeout: Duration::from_millis(s.response_timeout_ms),
            ack_timeout: Duration::from_millis(s.ack_timeout_ms),
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            backoff_step: Duration::from_millis(s.backoff_step_ms),
            post_write_delay,
            inbound_checksum: if s.verify_checksum {
                ChecksumPolicy::Verify(Crc8::COMMAND)
            } else {
                ChecksumPolicy::Ignore
            },
            max_buffer: s.max_buffer,
            step_delay: Duration::from_millis(s.step_delay_ms),
            settle_delay: Duration::from_millis(s.settle_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub max_attempts: u32,
    pub response_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_step_ms: u64,
    pub post_write_delay_ms: Option<u64>,
    pub verify_checksum: bool,
    pub max_buffer: usize,
    pub step_delay_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let d = SessionConfig::default();
        Self {
            max_attempts: d.max_attempts,
            response_timeout_ms: d.response_timeout.as_millis() as u64,
            ack_timeout_ms: d.ack_timeout.as_millis() as u64,
            backoff_base_ms: d.backoff_base.as_millis() as u64,
            backoff_step_ms: d.backoff_step.as_millis() as u64,
            post_write_delay_ms: None,
            verify_checksum: false,
            max_buffer: d.max_buffer,
            step_delay_ms: d.step_delay.as_millis() as u64,
            settle_delay_ms: d.settle_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanSettings {
    pub filter_count: u8,
    pub can_channel: u8,
    pub baud_rate_kbps: u16,
    pub diag_can_id: u32,
    pub diag_req_can_id: u32,
    pub filter_mask: u32,
}

impl Default for CanSettings {
    fn default() -> Self {
        let d = CanFilterConfig::default();
        Self {
            filter_count: d.filter_count,
            can_channel: d.can_channel,
            baud_rate_kbps: d.baud_rate_kbps,
            diag_can_id: d.diag_can_id,
            diag_req_can_id: d.diag_req_can_id,
            filter_mask: d.filter_mask,
        }
    }
}

impl From<&CanSettings> for CanFilterConfig {
    fn from(s: &CanSettings) -> Self {
        Self {
            filter_count: s.filter_count,
            can_channel: s.can_channel,
            baud_rate_kbps: s.baud_rate_kbps,
            diag_can_id: s.diag_can_id,
            diag_req_can_id: s.diag_req_can_id,
            filter_mask: s.filter_mask,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub uds_request_enable: bool,
    pub reply_flow_control: bool,
    pub block_size: u8,
    pub st_min_ms: u8,
    pub pad_value: u8,
}

impl Default for FlowSettings {
    fn default() -> Self {
        let d = FlowControlConfig::default();
        Self {
            uds_request_enable: d.uds_request_enable,
            reply_flow_control: d.reply_flow_control,
            block_size: d.block_size,
            st_min_ms: d.st_min_ms,
            pad_value: d.pad_value,
        }
    }
}

impl From<&FlowSettings> for FlowControlConfig {
    fn from(s: &FlowSettings) -> Self {
        Self {
            uds_request_enable: s.uds_request_enable,
            reply_flow_control: s.reply_flow_control,
            block_size: s.block_size,
            st_min_ms: s.st_min_ms,
            pad_value: s.pad_value,
        }
    }
}

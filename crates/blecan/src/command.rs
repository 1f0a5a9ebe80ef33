//! Adapter configuration commands.
//!
//! Each command is a command-mode frame with a fixed command byte and a fixed length field.
//! The adapter answers with a literal acknowledgment frame once the setting took effect.

pub const CMD_CAN_CONFIG: u8 = 0xFF;
pub const CMD_FLOW_CONTROL: u8 = 0xFE;

pub const RECONFIG_DONE: [u8; 6] = [0x55, 0xA9, 0x00, 0x01, 0xFF, 0x00];
pub const FLOWCONTROL_DONE: [u8; 6] = [0x55, 0xA9, 0x00, 0x01, 0xFE, 0x00];

pub trait AdapterCommand {
    const COMMAND: u8;
    /// Value of the length field. The adapter expects this literal, which is not always the
    /// number of payload bytes that follow.
    const LENGTH: u16;
    /// Acknowledgment the adapter sends back once the command is applied.
    const ACK: &'static [u8];
    const NAME: &'static str;

    fn payload_len(&self) -> usize;
    fn write_fields(&self, out: &mut Vec<u8>);
}

/// CAN channel and receive filter setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFilterConfig {
    /// Number of filters, 0..=15
    pub filter_count: u8,
    /// CAN channel, 0..=15
    pub can_channel: u8,
    pub baud_rate_kbps: u16,
    /// ID the ECU answers on
    pub diag_can_id: u32,
    /// ID requests are sent to
    pub diag_req_can_id: u32,
    pub filter_mask: u32,
}

impl Default for CanFilterConfig {
    fn default() -> Self {
        Self {
            filter_count: 1,
            can_channel: 0,
            baud_rate_kbps: 500,
            diag_can_id: 0x0000_07FF,
            diag_req_can_id: 0x0000_0710,
            filter_mask: 0xFFFF_FFFF,
        }
    }
}

impl AdapterCommand for CanFilterConfig {
    const COMMAND: u8 = CMD_CAN_CONFIG;
    const LENGTH: u16 = 0x0010;
    const ACK: &'static [u8] = &RECONFIG_DONE;
    const NAME: &'static str = "CAN configuration";

    fn payload_len(&self) -> usize {
        15
    }

    fn write_fields(&self, out: &mut Vec<u8>) {
        out.push(pack_nibbles(self.filter_count, self.can_channel));
        out.extend_from_slice(&self.baud_rate_kbps.to_be_bytes());
        out.extend_from_slice(&self.diag_can_id.to_be_bytes());
        out.extend_from_slice(&self.diag_req_can_id.to_be_bytes());
        out.extend_from_slice(&self.filter_mask.to_be_bytes());
    }
}

/// ISO-TP flow control parameters the adapter uses on the CAN side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    pub uds_request_enable: bool,
    pub reply_flow_control: bool,
    pub block_size: u8,
    pub st_min_ms: u8,
    pub pad_value: u8,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            uds_request_enable: true,
            reply_flow_control: true,
            block_size: 15,
            st_min_ms: 5,
            pad_value: 0x55,
        }
    }
}

impl AdapterCommand for FlowControlConfig {
    const COMMAND: u8 = CMD_FLOW_CONTROL;
    const LENGTH: u16 = 0x0004;
    const ACK: &'static [u8] = &FLOWCONTROL_DONE;
    const NAME: &'static str = "UDS flow control";

    fn payload_len(&self) -> usize {
        4
    }

    fn write_fields(&self, out: &mut Vec<u8>) {
        out.push(pack_nibbles(
            self.uds_request_enable as u8,
            self.reply_flow_control as u8,
        ));
        out.push(self.block_size);
        out.push(self.st_min_ms);
        out.push(self.pad_value);
    }
}

fn pack_nibbles(hi: u8, lo: u8) -> u8 {
    ((hi & 0x0F) << 4) | (lo & 0x0F)
}

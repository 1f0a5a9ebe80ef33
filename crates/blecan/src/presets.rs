//! Canned request lists.

use crate::frame::{EncodeError, Frame, FrameEncoder};
use crate::uds::{self, did};

/// Literal command-mode frames without their checksum byte.
pub const DIAG_REQUESTS: &[&[u8]] = &[
    &[0xAA, 0xA6, 0x00, 0x00, 0x02, 0x10, 0x03],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x87],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x89],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x8C],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x90],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x91],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x97],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0x9E],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0xA0],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0xA1],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0xA2],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0xA3],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x22, 0xF1, 0xAA],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x19, 0x02, 0x04],
    &[0xAA, 0xA6, 0x00, 0x00, 0x03, 0x19, 0x02, 0x08],
];

pub fn diag_request_frames(enc: &FrameEncoder) -> Result<Vec<Frame>, EncodeError> {
    DIAG_REQUESTS.iter().map(|f| enc.encode_fixed(f)).collect()
}

/// Tester present, extended session, identification reads and one routine start.
pub fn standard_requests() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("Tester Present", uds::tester_present()),
        (
            "Diagnostic Session",
            uds::diagnostic_session_control(uds::SESSION_EXTENDED),
        ),
        ("Read VIN", uds::read_data_by_identifier(did::VIN)),
        (
            "Read Manufacturer Serial",
            uds::read_data_by_identifier(did::ECU_SERIAL),
        ),
        ("Read Custom Data (0174)", uds::read_data_by_identifier(0x0174)),
        (
            "Routine Control",
            uds::routine_control(uds::ROUTINE_START, 0xC008, &[0x02]),
        ),
    ]
}

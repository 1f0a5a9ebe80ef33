use core::fmt;

use crate::frame::fmt_hex;
use crate::reassembler::InboundFrame;

pub const SID_DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
pub const SID_DIAGNOSTIC_SESSION_CONTROL_RESP: u8 = 0x50;

pub const SID_READ_DTC_INFORMATION: u8 = 0x19;

pub const SID_RDBI_REQ: u8 = 0x22;
pub const SID_RDBI_RESP: u8 = 0x62;

pub const SID_ROUTINE_CONTROL: u8 = 0x31;
pub const SID_ROUTINE_CONTROL_RESP: u8 = 0x71;

pub const SID_TESTER_PRESENT: u8 = 0x3E;
pub const SID_TESTER_PRESENT_RESP: u8 = 0x7E;

pub const SID_NEG_RESPONSE: u8 = 0x7F;

pub const SESSION_DEFAULT: u8 = 0x01;
pub const SESSION_PROGRAMMING: u8 = 0x02;
pub const SESSION_EXTENDED: u8 = 0x03;

pub const ROUTINE_START: u8 = 0x01;
pub const ROUTINE_STOP: u8 = 0x02;
pub const ROUTINE_RESULTS: u8 = 0x03;

pub const DTC_REPORT_BY_STATUS_MASK: u8 = 0x02;

pub mod did {
    pub const SPARE_PART_NUMBER: u16 = 0xF187;
    pub const SOFTWARE_VERSION: u16 = 0xF189;
    pub const ECU_SERIAL: u16 = 0xF18C;
    pub const VIN: u16 = 0xF190;
    pub const HARDWARE_NUMBER: u16 = 0xF191;
    pub const SYSTEM_NAME: u16 = 0xF197;
    pub const ODX_FILE: u16 = 0xF19E;
    pub const VEHICLE_MANUFACTURER_F1A0: u16 = 0xF1A0;
    pub const VEHICLE_MANUFACTURER_F1A1: u16 = 0xF1A1;
    pub const VEHICLE_MANUFACTURER_F1A2: u16 = 0xF1A2;
    pub const VEHICLE_MANUFACTURER_F1A3: u16 = 0xF1A3;
    pub const VEHICLE_MANUFACTURER_F1AA: u16 = 0xF1AA;
}

pub fn tester_present() -> Vec<u8> {
    vec![SID_TESTER_PRESENT, 0x00]
}

pub fn diagnostic_session_control(session: u8) -> Vec<u8> {
    vec![SID_DIAGNOSTIC_SESSION_CONTROL, session]
}

pub fn read_data_by_identifier(did: u16) -> Vec<u8> {
    let [hi, lo] = did.to_be_bytes();
    vec![SID_RDBI_REQ, hi, lo]
}

pub fn routine_control(sub_function: u8, routine_id: u16, params: &[u8]) -> Vec<u8> {
    let mut req = Vec::with_capacity(4 + params.len());
    req.push(SID_ROUTINE_CONTROL);
    req.push(sub_function);
    req.extend_from_slice(&routine_id.to_be_bytes());
    req.extend_from_slice(params);
    req
}

pub fn read_dtc_information(report_type: u8, status_mask: u8) -> Vec<u8> {
    vec![SID_READ_DTC_INFORMATION, report_type, status_mask]
}

/// Generic negative response representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeResponse {
    pub service: u8,
    pub code: UdsErrorCode,
}

impl fmt::Display for NegativeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service 0x{:02X} rejected: {:?} (0x{:02X})",
            self.service,
            self.code,
            self.code.as_u8()
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UdsErrorCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrInvalidFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    Unknown(u8),
}

impl UdsErrorCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x10 => UdsErrorCode::GeneralReject,
            0x11 => UdsErrorCode::ServiceNotSupported,
            0x12 => UdsErrorCode::SubFunctionNotSupported,
            0x13 => UdsErrorCode::IncorrectMessageLengthOrInvalidFormat,
            0x21 => UdsErrorCode::BusyRepeatRequest,
            0x22 => UdsErrorCode::ConditionsNotCorrect,
            0x24 => UdsErrorCode::RequestSequenceError,
            0x31 => UdsErrorCode::RequestOutOfRange,
            0x33 => UdsErrorCode::SecurityAccessDenied,
            0x35 => UdsErrorCode::InvalidKey,
            0x72 => UdsErrorCode::GeneralProgrammingFailure,
            0x73 => UdsErrorCode::WrongBlockSequenceCounter,
            0x78 => UdsErrorCode::ResponsePending,
            other => UdsErrorCode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            UdsErrorCode::GeneralReject => 0x10,
            UdsErrorCode::ServiceNotSupported => 0x11,
            UdsErrorCode::SubFunctionNotSupported => 0x12,
            UdsErrorCode::IncorrectMessageLengthOrInvalidFormat => 0x13,
            UdsErrorCode::BusyRepeatRequest => 0x21,
            UdsErrorCode::ConditionsNotCorrect => 0x22,
            UdsErrorCode::RequestSequenceError => 0x24,
            UdsErrorCode::RequestOutOfRange => 0x31,
            UdsErrorCode::SecurityAccessDenied => 0x33,
            UdsErrorCode::InvalidKey => 0x35,
            UdsErrorCode::GeneralProgrammingFailure => 0x72,
            UdsErrorCode::WrongBlockSequenceCounter => 0x73,
            UdsErrorCode::ResponsePending => 0x78,
            UdsErrorCode::Unknown(other) => other,
        }
    }
}

/// Outcome of one inbound frame, classified by its service id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// The frame carried no UDS bytes.
    NoData,
    TesterPresent,
    SessionStarted,
    /// Everything after the service id, DID included.
    DataRead(Vec<u8>),
    /// Everything after the service id, sub-function and routine id included.
    RoutineResult(Vec<u8>),
    Negative(NegativeResponse),
    /// Any other service id, including a negative response too short to carry its code.
    Unrecognized(u8),
}

impl UdsResponse {
    pub fn is_positive(&self) -> bool {
        matches!(
            self,
            UdsResponse::TesterPresent
                | UdsResponse::SessionStarted
                | UdsResponse::DataRead(_)
                | UdsResponse::RoutineResult(_)
        )
    }
}

impl fmt::Display for UdsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdsResponse::NoData => f.write_str("no data"),
            UdsResponse::TesterPresent => f.write_str("tester present OK"),
            UdsResponse::SessionStarted => f.write_str("diagnostic session established"),
            UdsResponse::DataRead(data) => {
                f.write_str("data read: ")?;
                fmt_hex(f, data)
            }
            UdsResponse::RoutineResult(data) => {
                f.write_str("routine control: ")?;
                fmt_hex(f, data)
            }
            UdsResponse::Negative(neg) => write!(f, "negative response: {}", neg),
            UdsResponse::Unrecognized(sid) => write!(f, "response: service 0x{:02X}", sid),
        }
    }
}

pub fn interpret(frame: &InboundFrame) -> UdsResponse {
    interpret_payload(frame.payload())
}

pub fn interpret_payload(payload: &[u8]) -> UdsResponse {
    let Some((&sid, rest)) = payload.split_first() else {
        return UdsResponse::NoData;
    };
    match sid {
        SID_TESTER_PRESENT_RESP => UdsResponse::TesterPresent,
        SID_DIAGNOSTIC_SESSION_CONTROL_RESP => UdsResponse::SessionStarted,
        SID_RDBI_RESP => UdsResponse::DataRead(rest.to_vec()),
        SID_ROUTINE_CONTROL_RESP => UdsResponse::RoutineResult(rest.to_vec()),
        SID_NEG_RESPONSE => match rest {
            [service, code, ..] => UdsResponse::Negative(NegativeResponse {
                service: *service,
                code: UdsErrorCode::from_u8(*code),
            }),
            _ => UdsResponse::Unrecognized(sid),
        },
        other => UdsResponse::Unrecognized(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(payload: &[u8]) -> InboundFrame {
        let mut bytes = vec![0x55, 0xA9];
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes.push(0x00);
        InboundFrame::from_bytes(bytes).unwrap()
    }

    #[test]
    fn negative_response() {
        let resp = interpret(&inbound(&[0x7F, 0x22, 0x31]));
        assert_eq!(
            resp,
            UdsResponse::Negative(NegativeResponse {
                service: 0x22,
                code: UdsErrorCode::RequestOutOfRange,
            })
        );
        assert!(!resp.is_positive());
    }

    #[test]
    fn data_read() {
        let resp = interpret(&inbound(&[0x62, 0xAA, 0xBB]));
        assert_eq!(resp, UdsResponse::DataRead(vec![0xAA, 0xBB]));
        assert_eq!(resp.to_string(), "data read: AA BB");
    }

    #[test]
    fn vin_read() {
        // 62 F1 90 + "WVWZZZ1JZXW000001"
        let payload = hex::decode("62F1905756575A5A5A314A5A5857303030303031").unwrap();
        let UdsResponse::DataRead(data) = interpret(&inbound(&payload)) else {
            panic!("expected data read");
        };
        assert_eq!(&data[..2], &[0xF1, 0x90]);
        assert_eq!(std::str::from_utf8(&data[2..]).unwrap(), "WVWZZZ1JZXW000001");
    }

    #[test]
    fn positive_responses() {
        assert_eq!(interpret(&inbound(&[0x7E, 0x00])), UdsResponse::TesterPresent);
        assert_eq!(
            interpret(&inbound(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4])),
            UdsResponse::SessionStarted
        );
        assert_eq!(
            interpret(&inbound(&[0x71, 0x01, 0xC0, 0x08, 0x00])),
            UdsResponse::RoutineResult(vec![0x01, 0xC0, 0x08, 0x00])
        );
    }

    #[test]
    fn empty_and_unknown() {
        assert_eq!(interpret(&inbound(&[])), UdsResponse::NoData);
        assert_eq!(interpret(&inbound(&[0x59, 0x02])), UdsResponse::Unrecognized(0x59));
        assert_eq!(interpret(&inbound(&[0x7F, 0x22])), UdsResponse::Unrecognized(0x7F));
    }

    #[test]
    fn interpret_is_idempotent() {
        let frame = inbound(&[0x7F, 0x10, 0x78]);
        assert_eq!(interpret(&frame), interpret(&frame));
        assert_eq!(
            interpret(&frame),
            UdsResponse::Negative(NegativeResponse {
                service: 0x10,
                code: UdsErrorCode::ResponsePending,
            })
        );
    }

    #[test]
    fn error_code_round_trip() {
        for v in 0..=u8::MAX {
            assert_eq!(UdsErrorCode::from_u8(v).as_u8(), v);
        }
    }

    #[test]
    fn request_builders() {
        assert_eq!(read_data_by_identifier(did::VIN), vec![0x22, 0xF1, 0x90]);
        assert_eq!(
            routine_control(ROUTINE_START, 0xC008, &[0x02]),
            vec![0x31, 0x01, 0xC0, 0x08, 0x02]
        );
        assert_eq!(
            diagnostic_session_control(SESSION_EXTENDED),
            vec![0x10, 0x03]
        );
        assert_eq!(
            read_dtc_information(DTC_REPORT_BY_STATUS_MASK, 0x08),
            vec![0x19, 0x02, 0x08]
        );
    }
}

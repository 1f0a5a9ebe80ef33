pub mod command;
pub mod crc;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod presets;
pub mod reassembler;
pub mod session;
#[cfg(feature = "sim")]
pub mod sim;
pub mod uds;

pub use error::{AttemptError, Result, SessionError, TransportError};
pub use frame::{Frame, FrameEncoder};
pub use session::{AckMode, ChecksumPolicy, Session, SessionConfig, Transport};

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, FromRepr};

/// Status codes the device reports in command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum StatusCode {
    #[strum(serialize = "SUCCESS")]
    Success = 0x00,
    #[strum(serialize = "ERROR_UNKNOWN")]
    Unknown = 0x80,
    #[strum(serialize = "ERROR_INTERNAL")]
    Internal = 0x81,
    #[strum(serialize = "ERROR_CMD_UNKNOWN")]
    CmdUnknown = 0x82,
    #[strum(serialize = "ERROR_INVALID_STATE")]
    InvalidState = 0x83,
    #[strum(serialize = "ERROR_INVALID_LENGTH")]
    InvalidLength = 0x84,
    #[strum(serialize = "ERROR_INVALID_PARAMETER")]
    InvalidParameter = 0x85,
    #[strum(serialize = "ERROR_BUSY")]
    Busy = 0x86,
    #[strum(serialize = "ERROR_INVALID_DATA")]
    InvalidData = 0x87,
    #[strum(serialize = "ERROR_REJECTED")]
    Rejected = 0x8E,
    #[strum(serialize = "ERROR_TIMEOUT")]
    Timeout = 0x93,
    #[strum(serialize = "ERROR_INVALID_KEY_DATA")]
    InvalidKeyData = 0x98,
}

/// Raw status byte from a command response.
///
/// Values outside the known table are kept as-is so they can still be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u8);

impl Status {
    pub const SUCCESS: Status = Status(0x00);

    pub fn is_success(self) -> bool {
        self.0 == StatusCode::Success as u8
    }

    pub fn code(self) -> Option<StatusCode> {
        StatusCode::from_repr(self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{code} ({raw:#04x})", raw = self.0),
            None => write!(f, "UNRECOGNIZED_STATUS ({raw:#04x})", raw = self.0),
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Longest close reason a WebSocket close frame can carry.
pub const MAX_REASON_BYTES: usize = 123;

/// A close is clean when its code falls in the normal-closure range.
pub fn is_clean_code(code: u16) -> bool {
    (1000..=1003).contains(&code)
}

/// Caller-supplied close codes: 1000, or an application code in 3000-4999.
pub fn validate_close_code(code: Option<u16>) -> Result<(), ProtocolError> {
    match code {
        None | Some(NORMAL_CLOSURE) => Ok(()),
        Some(3000..=4999) => Ok(()),
        Some(c) => Err(ProtocolError::InvalidCloseCode(c)),
    }
}

pub fn validate_close_reason(reason: Option<&str>) -> Result<(), ProtocolError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_BYTES => Err(ProtocolError::ReasonTooLong(r.len())),
        _ => Ok(()),
    }
}

/// Body of a close request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CloseRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_close_code(self.code)?;
        validate_close_reason(self.reason.as_deref())
    }

    /// Result reported when the backend link never opened: the requested
    /// code and reason, closed cleanly without a round trip.
    pub fn local_outcome(&self) -> CloseOutcome {
        CloseOutcome {
            code: self.code.unwrap_or(NORMAL_CLOSURE),
            reason: self.reason.clone().unwrap_or_default(),
            was_clean: true,
        }
    }
}

/// The terminal result of a session, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseOutcome {
    /// An outcome whose cleanliness follows from the code.
    pub fn from_code(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: is_clean_code(code),
        }
    }

    /// Termination without a completed closing handshake.
    pub fn abnormal() -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
            was_clean: false,
        }
    }
}

//! Control messages carried in text frames before a bridge is bound.
//!
//! Two spellings of the attach request are understood:
//!
//! - the line form `SESSION <id>`
//! - a tagged JSON envelope: `{"type": "attach", "session": "<id>"}`
//!
//! Once a bridge is bound every text frame is process input; nothing is
//! interpreted as control.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Literal prefix of the line-form attach request.
pub const SESSION_PREFIX: &str = "SESSION ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Bind this connection to a session's process.
    Attach { session: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("expected `SESSION <id>` or an attach envelope")]
    NotAttach,

    #[error("attach request has an empty or malformed session id")]
    InvalidSessionId,

    #[error("control message is not utf-8")]
    NotUtf8,
}

impl ControlMessage {
    /// Parse the first text message of a connection.
    pub fn parse(raw: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(raw).map_err(|_| ControlError::NotUtf8)?;

        let msg = if let Some(id) = text.strip_prefix(SESSION_PREFIX) {
            Self::Attach {
                session: id.trim_end_matches(['\r', '\n']).to_string(),
            }
        } else if text.trim_start().starts_with('{') {
            serde_json::from_str(text).map_err(|_| ControlError::NotAttach)?
        } else {
            return Err(ControlError::NotAttach);
        };

        let id = msg.session_id();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(ControlError::InvalidSessionId);
        }
        Ok(msg)
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Attach { session } => session,
        }
    }
}

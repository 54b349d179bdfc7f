use thiserror::Error;
use tracing::warn;

use crate::session::SessionId;

const COMMAND_PREFIX: &str = "command:";
const RESPONSE_PREFIX: &str = "response:";
const SESSION_ID_MARKER: &str = ",id:";

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("frame starts with neither \"command:\" nor \"response:\"")]
    UnknownPrefix,
    #[error("frame has no \",id:\" marker")]
    MissingSessionId,
    #[error("session id {0:?} is not a valid non-zero unsigned integer")]
    InvalidSessionId(String),
    #[error("a frame needs a non-empty message and a valid session id")]
    InvalidFrame,
}

/// A parsed control frame. `value` is empty if the body carried no `-value` part.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub is_response: bool,
    pub message: String,
    pub value: String,
    pub session_id: SessionId,
}

impl Frame {
    /// Parses a raw buffer into a frame. A single trailing NUL is stripped before the rest is
    ///  interpreted as the frame text.
    pub fn parse(raw: &[u8]) -> Result<Frame, ParseError> {
        let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);

        let (is_response, rest) = if let Some(rest) = text.strip_prefix(RESPONSE_PREFIX) {
            (true, rest)
        }
        else if let Some(rest) = text.strip_prefix(COMMAND_PREFIX) {
            (false, rest)
        }
        else {
            return Err(ParseError::UnknownPrefix);
        };

        let marker = rest.rfind(SESSION_ID_MARKER)
            .ok_or(ParseError::MissingSessionId)?;
        let body = &rest[..marker];
        let id_text = &rest[marker + SESSION_ID_MARKER.len()..];

        let session_id = match id_text.parse::<u32>() {
            Ok(id) if SessionId(id).is_valid() => SessionId(id),
            _ => {
                warn!("received a frame with invalid session id {:?}", id_text);
                return Err(ParseError::InvalidSessionId(id_text.to_string()));
            }
        };

        let (message, value) = match body.split_once('-') {
            Some((message, value)) => (message, value),
            None => (body, ""),
        };

        Ok(Frame {
            is_response,
            message: message.to_string(),
            value: value.to_string(),
            session_id,
        })
    }
}

fn build(prefix: &str, message: &str, value: &str, session_id: SessionId) -> Result<String, ParseError> {
    if message.is_empty() || !session_id.is_valid() {
        return Err(ParseError::InvalidFrame);
    }

    if value.is_empty() {
        Ok(format!("{}{}{}{}", prefix, message, SESSION_ID_MARKER, session_id.0))
    }
    else {
        Ok(format!("{}{}-{}{}{}", prefix, message, value, SESSION_ID_MARKER, session_id.0))
    }
}

/// Serializes a command frame. The `-value` suffix is omitted entirely for an empty value.
pub fn build_command(message: &str, value: &str, session_id: SessionId) -> Result<String, ParseError> {
    build(COMMAND_PREFIX, message, value, session_id)
}

/// Serializes a response frame, echoing the session id of the command it answers.
pub fn build_response(message: &str, value: &str, session_id: SessionId) -> Result<String, ParseError> {
    build(RESPONSE_PREFIX, message, value, session_id)
}

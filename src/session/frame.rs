//! Control frames of the framed session protocol
//!
//! A session's WebSocket carries BINARY frames (raw relay bytes) and
//! ASCII TEXT frames for control:
//!
//! | Frame | Direction | Meaning |
//! |---|---|---|
//! | `CONNECT:<target>\|<payload>` | client -> server | open the upstream, exactly once |
//! | `CONNECTED` | server -> client | upstream open, first payload written |
//! | `DATA:<bytes>` | either | relay data as text (legacy; binary preferred) |
//! | `CLOSE` | either | terminate the session |
//! | `ERROR:<message>` | either | advisory failure, may carry `{"msg","name"}` |
//! | `PING` / `PONG` | either | application-level heartbeat |
//!
//! `CONNECT` without a `|` treats the whole suffix as the target with
//! an empty payload. Frame names are case-sensitive.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Structured body an `ERROR:` frame may carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A parsed TEXT control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Connect { target: String, payload: String },
    Connected,
    Data(String),
    Close,
    Error(ErrorBody),
    Ping,
    Pong,
}

impl ControlFrame {
    /// Parse a TEXT frame. Unknown forms are an error; binary frames
    /// never reach this function.
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        if let Some(rest) = text.strip_prefix("CONNECT:") {
            let (target, payload) = match rest.split_once('|') {
                Some((target, payload)) => (target, payload),
                None => (rest, ""),
            };
            return Ok(Self::Connect {
                target: target.to_string(),
                payload: payload.to_string(),
            });
        }
        if let Some(rest) = text.strip_prefix("DATA:") {
            return Ok(Self::Data(rest.to_string()));
        }
        if let Some(rest) = text.strip_prefix("ERROR:") {
            let body = serde_json::from_str::<ErrorBody>(rest).unwrap_or_else(|_| ErrorBody {
                msg: rest.to_string(),
                name: None,
            });
            return Ok(Self::Error(body));
        }
        match text {
            "CONNECTED" => Ok(Self::Connected),
            "CLOSE" => Ok(Self::Close),
            "PING" => Ok(Self::Ping),
            "PONG" => Ok(Self::Pong),
            other => Err(SessionError::UnknownFrame(preview(other))),
        }
    }

    /// Serialize back to the TEXT wire form
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Connect { target, payload } => format!("CONNECT:{target}|{payload}"),
            Self::Connected => "CONNECTED".to_string(),
            Self::Data(data) => format!("DATA:{data}"),
            Self::Close => "CLOSE".to_string(),
            Self::Error(body) => match serde_json::to_string(body) {
                Ok(json) => format!("ERROR:{json}"),
                Err(_) => format!("ERROR:{}", body.msg),
            },
            Self::Ping => "PING".to_string(),
            Self::Pong => "PONG".to_string(),
        }
    }

    /// Short name for diagnostics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Data(_) => "DATA",
            Self::Close => "CLOSE",
            Self::Error(_) => "ERROR",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

/// Convenience constructor for plain-message errors
pub fn error_frame(msg: impl Into<String>) -> ControlFrame {
    ControlFrame::Error(ErrorBody {
        msg: msg.into(),
        name: None,
    })
}

fn preview(text: &str) -> String {
    const MAX: usize = 48;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut cut = MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}

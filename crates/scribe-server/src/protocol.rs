//! JSON text frames exchanged with streaming clients.
//!
//! Audio travels as binary frames and never passes through this module.
//! Control frames from the client carry `is_speaking`; everything the
//! server says is a `type`-tagged object.

use scribe_core::SessionId;
use scribe_runtime::{ErrorCode, Outbound};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ServerConfig;

/// A client control frame, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Stream start or reconfiguration.
    Start {
        /// Name echoed back on every result.
        wav_name: Option<String>,
        /// Per-session chunk length override.
        chunk_ms: Option<u32>,
    },
    /// End of speech: flush and finish.
    End,
}

/// Why a text frame was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not a JSON object of the expected shape.
    #[error("malformed control message: {0}")]
    Malformed(String),
    /// `chunk_ms` outside the accepted range.
    #[error("chunk_ms {0} out of range")]
    ChunkMs(u32),
}

/// Wire shape of a client control frame. Unknown fields are ignored so
/// clients may send extra decoder hints.
#[derive(Deserialize)]
struct ControlFrame {
    is_speaking: bool,
    #[serde(default)]
    wav_name: Option<String>,
    #[serde(default)]
    chunk_ms: Option<u32>,
}

/// Parse and validate a text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let frame: ControlFrame =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if !frame.is_speaking {
        return Ok(ClientMessage::End);
    }
    if let Some(ms) = frame.chunk_ms {
        if !ServerConfig::accepts_chunk_ms(ms) {
            return Err(ProtocolError::ChunkMs(ms));
        }
    }
    Ok(ClientMessage::Start {
        wav_name: frame.wav_name,
        chunk_ms: frame.chunk_ms,
    })
}

/// Messages the server sends as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted; audio may flow.
    Ready {
        /// Server-assigned session ID.
        session_id: SessionId,
    },
    /// Text of one decoded chunk.
    Partial {
        /// Echo of the client's `wav_name`.
        wav_name: String,
        /// Chunk sequence number.
        seq: u64,
        /// Recognized text.
        text: String,
        /// Always `false`.
        is_final: bool,
    },
    /// A chunk or the stream failed.
    Error {
        /// Echo of the client's `wav_name`.
        wav_name: String,
        /// Chunk sequence number, when one chunk is concerned.
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Error category.
        code: ErrorCode,
        /// Detail.
        message: String,
    },
    /// Whole transcript once the stream has ended.
    Final {
        /// Echo of the client's `wav_name`.
        wav_name: String,
        /// Accumulated transcript.
        text: String,
        /// Always `true`.
        is_final: bool,
    },
}

impl ServerMessage {
    /// Render a session result for the client. `Close` has no text form.
    pub fn from_outbound(outbound: Outbound, wav_name: &str) -> Option<Self> {
        let wav_name = wav_name.to_owned();
        match outbound {
            Outbound::Partial { seq, text } => Some(Self::Partial {
                wav_name,
                seq,
                text,
                is_final: false,
            }),
            Outbound::Error { seq, code, message } => Some(Self::Error {
                wav_name,
                seq,
                code,
                message,
            }),
            Outbound::Final { text } => Some(Self::Final {
                wav_name,
                text,
                is_final: true,
            }),
            Outbound::Close => None,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::Value;

    use super::*;

    fn json(msg: &ServerMessage) -> Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn start_frame_with_extra_fields() {
        let msg = parse_client_message(
            r#"{"mode":"online","wav_name":"mic","is_speaking":true,"chunk_size":[5,10,5]}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Start {
                wav_name: Some("mic".into()),
                chunk_ms: None,
            }
        );
    }

    #[test]
    fn start_frame_with_chunk_override() {
        let msg = parse_client_message(r#"{"is_speaking":true,"chunk_ms":300}"#).unwrap();
        assert_matches!(
            msg,
            ClientMessage::Start {
                chunk_ms: Some(300),
                ..
            }
        );
    }

    #[test]
    fn end_frame() {
        assert_eq!(
            parse_client_message(r#"{"is_speaking":false}"#).unwrap(),
            ClientMessage::End
        );
    }

    #[test]
    fn end_frame_ignores_chunk_override() {
        assert_eq!(
            parse_client_message(r#"{"is_speaking":false,"chunk_ms":1}"#).unwrap(),
            ClientMessage::End
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(
            parse_client_message("not json"),
            Err(ProtocolError::Malformed(_))
        );
        assert_matches!(
            parse_client_message(r#"{"wav_name":"x"}"#),
            Err(ProtocolError::Malformed(_))
        );
        assert_matches!(
            parse_client_message(r#"{"is_speaking":"yes"}"#),
            Err(ProtocolError::Malformed(_))
        );
        assert_matches!(parse_client_message("[]"), Err(ProtocolError::Malformed(_)));
    }

    #[test]
    fn rejects_out_of_range_chunk() {
        assert_eq!(
            parse_client_message(r#"{"is_speaking":true,"chunk_ms":5}"#),
            Err(ProtocolError::ChunkMs(5))
        );
    }

    #[test]
    fn ready_shape() {
        let msg = ServerMessage::Ready {
            session_id: SessionId::from_string("s1".into()),
        };
        let v = json(&msg);
        assert_eq!(v["type"], "ready");
        assert_eq!(v["session_id"], "s1");
    }

    #[test]
    fn partial_from_outbound() {
        let msg = ServerMessage::from_outbound(
            Outbound::Partial {
                seq: 4,
                text: "hello".into(),
            },
            "mic",
        )
        .unwrap();
        let v = json(&msg);
        assert_eq!(v["type"], "partial");
        assert_eq!(v["wav_name"], "mic");
        assert_eq!(v["seq"], 4);
        assert_eq!(v["text"], "hello");
        assert_eq!(v["is_final"], false);
    }

    #[test]
    fn error_codes_are_screaming_snake() {
        let msg = ServerMessage::from_outbound(
            Outbound::Error {
                seq: Some(2),
                code: ErrorCode::DecodeFailed,
                message: "boom".into(),
            },
            "mic",
        )
        .unwrap();
        let v = json(&msg);
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "DECODE_FAILED");
        assert_eq!(v["seq"], 2);
    }

    #[test]
    fn stream_error_omits_seq() {
        let msg = ServerMessage::from_outbound(
            Outbound::Error {
                seq: None,
                code: ErrorCode::InvalidMessage,
                message: "bad".into(),
            },
            "",
        )
        .unwrap();
        let v = json(&msg);
        assert_eq!(v["code"], "INVALID_MESSAGE");
        assert!(v.get("seq").is_none());
    }

    #[test]
    fn final_from_outbound() {
        let msg = ServerMessage::from_outbound(
            Outbound::Final {
                text: "hello world".into(),
            },
            "mic",
        )
        .unwrap();
        let v = json(&msg);
        assert_eq!(v["type"], "final");
        assert_eq!(v["is_final"], true);
        assert_eq!(v["text"], "hello world");
    }

    #[test]
    fn close_has_no_text_form() {
        assert!(ServerMessage::from_outbound(Outbound::Close, "mic").is_none());
    }
}

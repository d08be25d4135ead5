//! # Wire Protocol
//!
//! Message set exchanged over the voice WebSocket.
//!
//! ## Payload kinds:
//! - **Binary**: raw little-endian 16-bit PCM, mono, 16kHz, any chunk size
//! - **Text**: JSON objects tagged by a `type` field
//!
//! Inbound text payloads that fail to decode are dropped by the caller;
//! [`decode_client_message`] returns `None` for them instead of an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control messages accepted from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Barge-in: cancel whatever the assistant is doing.
    Interrupt,

    /// Start a turn from text, skipping transcription.
    Prompt { text: String },

    /// Application-level keepalive. `id` is echoed back verbatim.
    Ping {
        #[serde(default)]
        id: Option<Value>,
    },
}

/// Messages produced by the server, in the order the client renders them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Ready,

    /// Finalized transcript for the current turn
    Stt {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Generation is about to start
    LlmStart,

    /// One streamed reply fragment
    Llm { text: String },

    /// Complete reply text
    LlmFinal { text: String },

    /// Synthesized reply audio, hex-encoded WAV bytes
    TtsAudio { audio: String, format: String },

    /// Interrupt processed
    InterruptAck,

    /// Reply to a client `ping`
    Pong { id: Option<Value> },

    /// A stage failed and the turn was aborted
    Error { message: String },
}

impl ServerMessage {
    /// Build a `tts_audio` message from WAV-framed bytes.
    pub fn tts_audio(wav_bytes: &[u8]) -> Self {
        ServerMessage::TtsAudio {
            audio: hex::encode(wav_bytes),
            format: "wav".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Wire name of this message kind (the `type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ready => "ready",
            ServerMessage::Stt { .. } => "stt",
            ServerMessage::LlmStart => "llm_start",
            ServerMessage::Llm { .. } => "llm",
            ServerMessage::LlmFinal { .. } => "llm_final",
            ServerMessage::TtsAudio { .. } => "tts_audio",
            ServerMessage::InterruptAck => "interrupt_ack",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON text frame sent on the socket.
    pub fn encode(&self) -> String {
        // Every variant is a plain struct of strings and JSON values, so this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"encode failed"}"#.to_string())
    }
}

/// Decode a text frame from the client.
///
/// Malformed JSON, non-object payloads and unknown `type` values all yield `None`.
pub fn decode_client_message(text: &str) -> Option<ClientMessage> {
    // Tagged enums also accept sequence form (`["interrupt"]`), which is not part of the protocol.
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_known_control_messages() {
        assert_eq!(
            decode_client_message(r#"{"type":"interrupt"}"#),
            Some(ClientMessage::Interrupt)
        );
        assert_eq!(
            decode_client_message(r#"{"type":"prompt","text":"hello"}"#),
            Some(ClientMessage::Prompt { text: "hello".to_string() })
        );
        assert_eq!(
            decode_client_message(r#"{"type":"ping","id":"abc"}"#),
            Some(ClientMessage::Ping { id: Some(json!("abc")) })
        );
        assert_eq!(
            decode_client_message(r#"{"type":"ping"}"#),
            Some(ClientMessage::Ping { id: None })
        );
    }

    #[test]
    fn test_malformed_payloads_are_dropped() {
        assert_eq!(decode_client_message("not json"), None);
        assert_eq!(decode_client_message(r#"["interrupt"]"#), None);
        assert_eq!(decode_client_message(r#"["prompt","hi"]"#), None);
        assert_eq!(decode_client_message(r#"["ping",null]"#), None);
        assert_eq!(decode_client_message(r#""interrupt""#), None);
        assert_eq!(decode_client_message("42"), None);
        assert_eq!(decode_client_message(r#"{"type":"dance"}"#), None);
        assert_eq!(decode_client_message(r#"{"type":"prompt"}"#), None);
        assert_eq!(decode_client_message(r#"{"text":"no type"}"#), None);
    }

    #[test]
    fn test_server_messages_use_wire_field_names() {
        let stt: Value = serde_json::from_str(
            &ServerMessage::Stt { text: "hi".to_string(), is_final: true }.encode(),
        )
        .unwrap();
        assert_eq!(stt, json!({"type": "stt", "text": "hi", "final": true}));

        let start: Value = serde_json::from_str(&ServerMessage::LlmStart.encode()).unwrap();
        assert_eq!(start, json!({"type": "llm_start"}));

        let ack: Value = serde_json::from_str(&ServerMessage::InterruptAck.encode()).unwrap();
        assert_eq!(ack, json!({"type": "interrupt_ack"}));

        let pong: Value =
            serde_json::from_str(&ServerMessage::Pong { id: Some(json!(7)) }.encode()).unwrap();
        assert_eq!(pong, json!({"type": "pong", "id": 7}));

        let bare_pong: Value =
            serde_json::from_str(&ServerMessage::Pong { id: None }.encode()).unwrap();
        assert_eq!(bare_pong, json!({"type": "pong", "id": null}));
    }

    #[test]
    fn test_tts_audio_is_hex_encoded() {
        let msg = ServerMessage::tts_audio(&[0x52, 0x49, 0xff]);
        assert_eq!(msg.kind(), "tts_audio");
        let value: Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(value, json!({"type": "tts_audio", "audio": "5249ff", "format": "wav"}));
    }
}

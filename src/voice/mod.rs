//! Real-time voice plumbing for Luna.
//!
//! Bridges a browser (or native) client to an upstream streaming speech
//! model. The upstream vendor is abstracted behind [`ProviderAdapter`];
//! the [`relay`] owns the handshake and forwards everything else opaquely.
//!
//! ## Design
//! - One relay, parameterized by provider adapter (Gemini Live, OpenAI Realtime)
//! - Transport-neutral [`Frame`] so the relay runs over axum, tungstenite, or test channels
//! - Provider-agnostic [`VoiceEvent`] parsed from upstream JSON for the orchestrator

pub mod gemini_live;
pub mod openai_realtime;
pub mod provider;
pub mod relay;

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub use provider::{create_adapter, ProviderAdapter, SessionSetup, VoiceProviderKind};
pub use relay::{ClosedBy, Relay, RelayCommand, RelayHooks, RelayOutcome, RelayStats};

// ── Shared voice event type ──────────────────────────────────────

/// Provider-agnostic event parsed from an upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// Provider setup completed. Ready to stream.
    SetupComplete,
    /// Model speech chunk (PCM16LE mono at the provider's output rate).
    Audio { data: Vec<u8> },
    /// Transcription fragment of the user's speech.
    InputTranscript { text: String },
    /// Transcription fragment of the model's speech.
    OutputTranscript { text: String },
    /// Model finished a response turn.
    TurnComplete,
    /// The model was interrupted (user started speaking mid-response).
    Interrupted,
    /// The model invoked a declared function tool.
    ToolCall(ToolCall),
    /// Error reported by the provider.
    Error { message: String },
}

/// A function call emitted by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

// ── Transport frame ──────────────────────────────────────────────

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;

    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: Self::NORMAL,
            reason: reason.into(),
        }
    }
}

/// A WebSocket message reduced to what the relay cares about.
///
/// Ping/pong are handled by the underlying libraries and never surface here.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseInfo>),
}

impl Frame {
    /// Serialize a JSON value into a text frame.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    /// Bytes of the JSON document carried by this frame, if any.
    ///
    /// Gemini Live sends JSON inside Binary frames, so binary payloads
    /// starting with `{` are treated as JSON too.
    pub fn json_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(text) => Some(text.as_bytes()),
            Self::Binary(data) if data.first() == Some(&b'{') => Some(data),
            _ => None,
        }
    }

    /// Parse the JSON document carried by this frame.
    ///
    /// `None` means the frame carries no JSON at all (raw binary, close).
    pub fn parse_json(&self) -> Option<serde_json::Result<serde_json::Value>> {
        self.json_bytes().map(serde_json::from_slice)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
            Self::Close(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── tungstenite (upstream, native client) ──

    pub fn from_ws(msg: WsMessage) -> Option<Self> {
        match msg {
            WsMessage::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            WsMessage::Binary(data) => Some(Self::Binary(data.to_vec())),
            WsMessage::Close(frame) => Some(Self::Close(frame.map(|f| CloseInfo {
                code: u16::from(f.code),
                reason: f.reason.as_str().to_owned(),
            }))),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
        }
    }

    pub fn into_ws(self) -> WsMessage {
        match self {
            Self::Text(text) => WsMessage::Text(text.into()),
            Self::Binary(data) => WsMessage::Binary(data.into()),
            Self::Close(info) => WsMessage::Close(info.map(|i| WsCloseFrame {
                code: CloseCode::from(i.code),
                reason: i.reason.into(),
            })),
        }
    }

    // ── axum (browser-facing gateway socket) ──

    pub fn from_axum(msg: AxumMessage) -> Option<Self> {
        match msg {
            AxumMessage::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            AxumMessage::Binary(data) => Some(Self::Binary(data.to_vec())),
            AxumMessage::Close(frame) => Some(Self::Close(frame.map(|f| CloseInfo {
                code: f.code,
                reason: f.reason.as_str().to_owned(),
            }))),
            AxumMessage::Ping(_) | AxumMessage::Pong(_) => None,
        }
    }

    pub fn into_axum(self) -> AxumMessage {
        match self {
            Self::Text(text) => AxumMessage::Text(text.into()),
            Self::Binary(data) => AxumMessage::Binary(data.into()),
            Self::Close(info) => AxumMessage::Close(info.map(|i| AxumCloseFrame {
                code: i.code,
                reason: i.reason.into(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_json_is_recognised() {
        let frame = Frame::Binary(br#"{"setupComplete":{}}"#.to_vec());
        let value = frame.parse_json().unwrap().unwrap();
        assert!(value.get("setupComplete").is_some());
    }

    #[test]
    fn raw_binary_carries_no_json() {
        assert!(Frame::Binary(vec![0, 1, 2]).parse_json().is_none());
        assert!(Frame::Close(None).parse_json().is_none());
    }

    #[test]
    fn malformed_text_is_an_error_not_none() {
        let parsed = Frame::Text("{nope".into()).parse_json();
        assert!(matches!(parsed, Some(Err(_))));
    }

    #[test]
    fn tungstenite_close_preserves_code_and_reason() {
        let frame = Frame::Close(Some(CloseInfo {
            code: 4001,
            reason: "quota".into(),
        }));
        let back = Frame::from_ws(frame.clone().into_ws()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn axum_frames_keep_their_kind() {
        let text = Frame::Text("hi".into());
        let binary = Frame::Binary(vec![9, 9]);
        assert_eq!(Frame::from_axum(text.clone().into_axum()), Some(text));
        assert_eq!(Frame::from_axum(binary.clone().into_axum()), Some(binary));
        assert_eq!(Frame::from_axum(AxumMessage::Ping(Vec::new().into())), None);
    }
}

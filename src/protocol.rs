//! # Realtime Wire Protocol
//!
//! Every text frame exchanged with the remote conversational-audio service is one UTF-8
//! JSON object carrying a `type` string plus arbitrary fields.
//!
//! ## Message Format:
//! - **Client → Service**: typed control messages (`ClientEvent`): audio append, commit,
//!   response request, session update
//! - **Service → Client**: typed events; inbound frames may omit `type`, in which case only
//!   type-agnostic observers see them
//! - **Binary frames**: opaque blobs, never decoded here
//!
//! ## Event decoding:
//! The service emits many event names that mean "audio is flowing" or "audio stopped".
//! `RealtimeEvent::classify` is the single place that knows those names; everything
//! downstream (presence, playback, transcripts) works on the closed `RealtimeEvent` set.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type names used by this core.
pub mod event_types {
    // Outbound
    pub const AUDIO_APPEND: &str = "input_audio_buffer.append";
    pub const AUDIO_COMMIT: &str = "input_audio_buffer.commit";
    pub const RESPONSE_CREATE: &str = "response.create";
    pub const SESSION_UPDATE: &str = "session.update";

    // Inbound audio
    pub const AUDIO_DELTA: &str = "response.audio.delta";
    pub const OUTPUT_AUDIO_DELTA: &str = "response.output_audio.delta";
    pub const AUDIO_DONE: &str = "response.audio.done";
    pub const OUTPUT_AUDIO_DONE: &str = "response.output_audio.done";
    pub const OUTPUT_BUFFER_STARTED: &str = "output_audio_buffer.started";
    pub const OUTPUT_BUFFER_STOPPED: &str = "output_audio_buffer.stopped";
    pub const OUTPUT_BUFFER_CLEARED: &str = "output_audio_buffer.cleared";

    // Inbound text
    pub const TEXT_DELTA: &str = "response.text.delta";
    pub const TEXT_DONE: &str = "response.text.done";
    pub const AUDIO_TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";
    pub const AUDIO_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";

    // Inbound misc
    pub const ERROR: &str = "error";
    pub const ITEM_CREATED: &str = "conversation.item.created";
    pub const ITEM_ADDED: &str = "conversation.item.added";
    pub const HISTORY_ADDED: &str = "history_added";
}

/// A decoded control message: a type plus an ordered field mapping.
///
/// An empty `kind` means the inbound frame carried no (string) `type`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    kind: String,
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field insertion. A `type` key is routed to the message type.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if key == "type" {
            self.kind = value.as_str().unwrap_or_default().to_string();
        } else {
            self.fields.insert(key, value);
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn has_type(&self) -> bool {
        !self.kind.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Build a message from an already-parsed JSON value. Non-objects are rejected.
    pub fn from_value(value: Value) -> SessionResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(SessionError::Protocol(
                "frame is not a JSON object".to_string(),
            ));
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            // A non-string type is treated like a missing one.
            _ => String::new(),
        };
        Ok(Self { kind, fields })
    }

    /// Decode one inbound text frame.
    pub fn from_json(text: &str) -> SessionResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Encode for the wire. `type` is always the first key; outbound messages must have one.
    pub fn to_json(&self) -> SessionResult<String> {
        if !self.has_type() {
            return Err(SessionError::Protocol(
                "outbound message has no type".to_string(),
            ));
        }
        let mut object = Map::with_capacity(self.fields.len() + 1);
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }
}

/// Outbound control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// One base64-encoded PCM16 capture chunk
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    /// Close the current input audio buffer as one user turn
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    /// Ask the service to respond to the committed input
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },

    /// Push session-level settings (instructions, voice, formats)
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
}

impl ClientEvent {
    pub fn into_message(self) -> SessionResult<Message> {
        Message::from_value(serde_json::to_value(self)?)
    }
}

/// Internal event set every inbound message is reduced to.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// The service signalled that output audio started
    AudioStarted,
    /// An audio-bearing delta; carries the base64 payload
    AudioChunk(String),
    /// The service signalled that output audio finished or was cleared
    AudioStopped,
    /// Incremental transcript text
    TranscriptDelta(String),
    /// End of a transcript; the payload may be absent on some event shapes
    TranscriptDone(Option<String>),
    /// Service-reported error description
    Error(String),
    /// A history item that embeds output audio
    HistoryAudioItem,
    /// Nothing this core reacts to
    Other,
}

impl RealtimeEvent {
    /// Translate one inbound message into the internal event set.
    pub fn classify(message: &Message) -> Self {
        use event_types::*;

        match message.kind() {
            AUDIO_DELTA | OUTPUT_AUDIO_DELTA => {
                let payload = message
                    .str_field("delta")
                    .or_else(|| message.str_field("audio"))
                    .unwrap_or_default();
                RealtimeEvent::AudioChunk(payload.to_string())
            }
            OUTPUT_BUFFER_STARTED => RealtimeEvent::AudioStarted,
            AUDIO_DONE | OUTPUT_AUDIO_DONE | OUTPUT_BUFFER_STOPPED | OUTPUT_BUFFER_CLEARED => {
                RealtimeEvent::AudioStopped
            }
            TEXT_DELTA | AUDIO_TRANSCRIPT_DELTA => message
                .str_field("delta")
                .map(|delta| RealtimeEvent::TranscriptDelta(delta.to_string()))
                .unwrap_or(RealtimeEvent::Other),
            TEXT_DONE => RealtimeEvent::TranscriptDone(message.str_field("text").map(str::to_string)),
            AUDIO_TRANSCRIPT_DONE => {
                RealtimeEvent::TranscriptDone(message.str_field("transcript").map(str::to_string))
            }
            ERROR => RealtimeEvent::Error(error_description(message)),
            ITEM_CREATED | ITEM_ADDED | HISTORY_ADDED => match message.field("item") {
                Some(item) if item_has_output_audio(item) => RealtimeEvent::HistoryAudioItem,
                _ => RealtimeEvent::Other,
            },
            _ => RealtimeEvent::Other,
        }
    }

    /// True for events that (re)start the speaking interval.
    pub fn is_speaking_trigger(&self) -> bool {
        matches!(
            self,
            RealtimeEvent::AudioStarted | RealtimeEvent::AudioChunk(_) | RealtimeEvent::HistoryAudioItem
        )
    }
}

fn error_description(message: &Message) -> String {
    message
        .field("error")
        .and_then(|error| match error {
            Value::String(text) => Some(text.clone()),
            Value::Object(obj) => obj.get("message").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .or_else(|| message.str_field("message").map(str::to_string))
        .unwrap_or_else(|| "unspecified service error".to_string())
}

fn is_audio_type(value: Option<&Value>) -> bool {
    matches!(value.and_then(Value::as_str), Some("output_audio") | Some("audio"))
}

fn item_has_output_audio(item: &Value) -> bool {
    if is_audio_type(item.get("type")) {
        return true;
    }
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| parts.iter().any(|part| is_audio_type(part.get("type"))))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_without_type() {
        let msg = Message::from_json(r#"{"delta":"abc"}"#).unwrap();
        assert!(!msg.has_type());
        assert_eq!(msg.str_field("delta"), Some("abc"));
    }

    #[test]
    fn test_non_object_frame_is_rejected() {
        assert!(matches!(Message::from_json("[1,2]"), Err(SessionError::Protocol(_))));
        assert!(matches!(Message::from_json("{oops"), Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_outbound_type_comes_first_and_order_is_kept() {
        let msg = Message::new("custom")
            .with_field("b", 1)
            .with_field("a", 2);
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"custom","b":1,"a":2}"#);
    }

    #[test]
    fn test_outbound_requires_type() {
        let msg = Message::default().with_field("a", 1);
        assert!(msg.to_json().is_err());
    }

    #[test]
    fn test_client_event_envelopes() {
        let append = ClientEvent::AudioAppend { audio: "AAA=".to_string() }
            .into_message()
            .unwrap();
        assert_eq!(append.kind(), event_types::AUDIO_APPEND);
        assert_eq!(append.str_field("audio"), Some("AAA="));

        let commit = ClientEvent::AudioCommit.into_message().unwrap();
        assert_eq!(commit.to_json().unwrap(), r#"{"type":"input_audio_buffer.commit"}"#);

        let create = ClientEvent::ResponseCreate {
            response: ResponseRequest { modalities: vec!["audio".into(), "text".into()] },
        }
        .into_message()
        .unwrap();
        assert_eq!(
            create.field("response"),
            Some(&json!({"modalities": ["audio", "text"]}))
        );
    }

    #[test]
    fn test_classify_audio_delta() {
        let msg = Message::from_json(r#"{"type":"response.audio.delta","delta":"AAEC"}"#).unwrap();
        let event = RealtimeEvent::classify(&msg);
        assert_eq!(event, RealtimeEvent::AudioChunk("AAEC".to_string()));
        assert!(event.is_speaking_trigger());
    }

    #[test]
    fn test_classify_error_shapes() {
        let nested = Message::from_json(r#"{"type":"error","error":{"message":"bad token"}}"#).unwrap();
        assert_eq!(RealtimeEvent::classify(&nested), RealtimeEvent::Error("bad token".into()));

        let flat = Message::from_json(r#"{"type":"error","message":"flat"}"#).unwrap();
        assert_eq!(RealtimeEvent::classify(&flat), RealtimeEvent::Error("flat".into()));
    }

    #[test]
    fn test_classify_history_items() {
        let audio_item = Message::from_json(
            r#"{"type":"history_added","item":{"type":"message","content":[{"type":"output_audio"}]}}"#,
        )
        .unwrap();
        assert_eq!(RealtimeEvent::classify(&audio_item), RealtimeEvent::HistoryAudioItem);

        let text_item = Message::from_json(
            r#"{"type":"conversation.item.created","item":{"type":"message","content":[{"type":"input_text"}]}}"#,
        )
        .unwrap();
        assert_eq!(RealtimeEvent::classify(&text_item), RealtimeEvent::Other);
    }

    #[test]
    fn test_classify_transcripts() {
        let delta = Message::from_json(r#"{"type":"response.text.delta","delta":"Hel"}"#).unwrap();
        assert_eq!(RealtimeEvent::classify(&delta), RealtimeEvent::TranscriptDelta("Hel".into()));

        let done = Message::from_json(r#"{"type":"response.audio_transcript.done","transcript":"Hello"}"#)
            .unwrap();
        assert_eq!(
            RealtimeEvent::classify(&done),
            RealtimeEvent::TranscriptDone(Some("Hello".into()))
        );
    }
}

//! Wire format for envelopes exchanged with the Rabbithole server.
//!
//! Every frame is a UTF-8 JSON object of the form `{ "type": <tag>, "data": <payload> }`.
//! Inbound frames are decoded in two passes: [`decode_tag`] only reads the tag, and
//! [`decode_body`] decodes the payload once the tag has selected its shape. A frame
//! whose payload is malformed therefore still yields a tag, and the caller can drop
//! just that message instead of tearing down the receive pipeline.

use base64::Engine;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use tracing::{debug, warn};

/// The type tag carried by every envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[serde(rename = "logon")]
    Authenticate,
    #[serde(rename = "message")]
    Text,
    #[serde(rename = "ptt")]
    PushToTalk,
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "register")]
    Register,
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "meeting")]
    Meeting,
}

impl MessageType {
    /// The literal tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Authenticate => "logon",
            MessageType::Text => "message",
            MessageType::PushToTalk => "ptt",
            MessageType::Audio => "audio",
            MessageType::Register => "register",
            MessageType::Long => "long",
            MessageType::Meeting => "meeting",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a tagged envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Error raised when an outbound message cannot be serialized.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode `{kind}` message: {source}")]
pub struct EncodeError {
    pub kind: MessageType,
    #[source]
    pub source: serde_json::Error,
}

// --- Outbound ---

/// Credentials presented to the server in a `logon` request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub imei: String,
    #[serde(rename = "accountKey")]
    pub account_key: String,
}

/// Body of an outbound push-to-talk toggle.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PttRequest {
    pub active: bool,
    /// Optional snapshot sent as a `data:image/jpeg;base64,` URL.
    pub image: Option<String>,
}

/// Messages sent from the client to the server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "logon")]
    Authenticate(AuthRequest),
    #[serde(rename = "message")]
    Text(String),
    #[serde(rename = "ptt")]
    PushToTalk(PttRequest),
    /// Recorded speech as a `data:audio/wav;base64,` URL.
    #[serde(rename = "audio")]
    Audio(String),
    /// Registration link issued to the user out of band.
    #[serde(rename = "register")]
    Register(String),
    #[serde(rename = "meeting")]
    Meeting(bool),
}

impl ClientMessage {
    pub fn authenticate(imei: impl Into<String>, account_key: impl Into<String>) -> Self {
        ClientMessage::Authenticate(AuthRequest {
            imei: imei.into(),
            account_key: account_key.into(),
        })
    }

    pub fn push_to_talk(active: bool, image: Option<&[u8]>) -> Self {
        let image = image.map(|bytes| {
            format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            )
        });
        ClientMessage::PushToTalk(PttRequest { active, image })
    }

    pub fn audio(wav: &[u8]) -> Self {
        ClientMessage::Audio(format!(
            "data:audio/wav;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(wav)
        ))
    }

    /// The tag this message is sent under.
    pub fn kind(&self) -> MessageType {
        match self {
            ClientMessage::Authenticate(_) => MessageType::Authenticate,
            ClientMessage::Text(_) => MessageType::Text,
            ClientMessage::PushToTalk(_) => MessageType::PushToTalk,
            ClientMessage::Audio(_) => MessageType::Audio,
            ClientMessage::Register(_) => MessageType::Register,
            ClientMessage::Meeting(_) => MessageType::Meeting,
        }
    }
}

/// Serializes an outbound message into the text of a single frame.
pub fn encode(message: &ClientMessage) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|source| EncodeError {
        kind: message.kind(),
        source,
    })
}

// --- Inbound ---

/// Identity issued by the server after a successful registration.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub imei: String,
    #[serde(rename = "accountKey")]
    pub account_key: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "actualUserId")]
    pub actual_user_id: String,
}

/// A long-form answer carrying image references.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LongResponse {
    pub text: String,
    pub images: Vec<String>,
}

/// Per-character timing attached to a spoken response.
///
/// The three sequences are index-aligned: entry `i` of each describes the same character.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TimingMetadata {
    pub language: String,
    #[serde(rename = "chars")]
    pub characters: Vec<String>,
    #[serde(rename = "char_start_times_ms")]
    pub char_start_ms: Vec<u64>,
    #[serde(rename = "char_durations_ms")]
    pub char_duration_ms: Vec<u64>,
}

impl TimingMetadata {
    /// Parses the nested timing document carried in an audio payload's `text` field.
    ///
    /// The server double-encodes this document, so every backslash is stripped before
    /// parsing. Anything that still fails to parse is treated as "no timing".
    pub fn from_escaped(raw: &str) -> Option<Self> {
        let unescaped = raw.replace('\\', "");
        match serde_json::from_str(&unescaped) {
            Ok(timing) => Some(timing),
            Err(e) => {
                debug!(error = %e, "Audio payload has no usable timing metadata");
                None
            }
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.characters.len() == self.char_start_ms.len()
            && self.characters.len() == self.char_duration_ms.len()
    }
}

/// A decoded spoken response, ready for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioItem {
    pub audio: Vec<u8>,
    pub timing: Option<TimingMetadata>,
}

#[derive(Deserialize)]
struct AudioPayload {
    #[serde(default)]
    text: Option<String>,
    audio: String,
}

impl From<AudioPayload> for AudioItem {
    fn from(payload: AudioPayload) -> Self {
        let audio = base64::engine::general_purpose::STANDARD
            .decode(&payload.audio)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Audio payload is not valid base64");
                Vec::new()
            });
        let timing = payload
            .text
            .as_deref()
            .and_then(TimingMetadata::from_escaped);
        AudioItem { audio, timing }
    }
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Either the failure sentinel or a success message.
    Authenticate(String),
    Text(String),
    /// Transcript of the user's own push-to-talk speech.
    PushToTalk(String),
    Audio(AudioItem),
    Register(Registration),
    Long(LongResponse),
    Meeting(bool),
}

#[derive(Deserialize)]
struct Tag {
    #[serde(rename = "type")]
    kind: MessageType,
}

#[derive(Deserialize)]
struct Body<T> {
    data: T,
}

/// First decoding pass: reads only the `type` tag of a frame.
pub fn decode_tag(frame: &[u8]) -> Result<MessageType, DecodeError> {
    serde_json::from_slice::<Tag>(frame)
        .map(|tag| tag.kind)
        .map_err(DecodeError::Envelope)
}

/// Second decoding pass: decodes the payload of a frame whose tag is already known.
pub fn decode_body(frame: &[u8], kind: MessageType) -> Result<ServerMessage, DecodeError> {
    Ok(match kind {
        MessageType::Authenticate => ServerMessage::Authenticate(body(frame, kind)?),
        MessageType::Text => ServerMessage::Text(body(frame, kind)?),
        MessageType::PushToTalk => ServerMessage::PushToTalk(body(frame, kind)?),
        MessageType::Audio => ServerMessage::Audio(body::<AudioPayload>(frame, kind)?.into()),
        MessageType::Register => ServerMessage::Register(body(frame, kind)?),
        MessageType::Long => ServerMessage::Long(body(frame, kind)?),
        MessageType::Meeting => ServerMessage::Meeting(body(frame, kind)?),
    })
}

fn body<T: DeserializeOwned>(frame: &[u8], kind: MessageType) -> Result<T, DecodeError> {
    serde_json::from_slice::<Body<T>>(frame)
        .map(|body| body.data)
        .map_err(|source| DecodeError::Payload { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_tags_survive_encoding() {
        let messages = vec![
            ClientMessage::authenticate("356938035643809", "key"),
            ClientMessage::Text("hello".to_string()),
            ClientMessage::push_to_talk(true, None),
            ClientMessage::audio(b"RIFF"),
            ClientMessage::Register("https://example.com/qr".to_string()),
            ClientMessage::Meeting(false),
        ];

        for message in messages {
            let frame = encode(&message).unwrap();
            assert_eq!(decode_tag(frame.as_bytes()).unwrap(), message.kind());
        }
    }

    #[test]
    fn test_authenticate_wire_shape() {
        let frame = encode(&ClientMessage::authenticate("123", "abc")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({ "type": "logon", "data": { "imei": "123", "accountKey": "abc" } })
        );
    }

    #[test]
    fn test_ptt_image_is_sent_as_data_url() {
        let frame = encode(&ClientMessage::push_to_talk(false, Some(&[0xff, 0xd8]))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "ptt");
        assert_eq!(value["data"]["active"], false);
        assert_eq!(value["data"]["image"], "data:image/jpeg;base64,/9g=");

        let frame = encode(&ClientMessage::push_to_talk(true, None)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert!(value["data"]["image"].is_null());
    }

    #[test]
    fn test_decode_tag_of_every_inbound_literal() {
        let cases = [
            ("logon", MessageType::Authenticate),
            ("message", MessageType::Text),
            ("ptt", MessageType::PushToTalk),
            ("audio", MessageType::Audio),
            ("register", MessageType::Register),
            ("long", MessageType::Long),
            ("meeting", MessageType::Meeting),
        ];
        for (literal, expected) in cases {
            let frame = json!({ "type": literal, "data": null }).to_string();
            assert_eq!(decode_tag(frame.as_bytes()).unwrap(), expected);
            assert_eq!(expected.as_str(), literal);
        }
    }

    #[test]
    fn test_tag_decodes_even_when_body_is_malformed() {
        let frame = json!({ "type": "message", "data": 42 }).to_string();
        let kind = decode_tag(frame.as_bytes()).unwrap();
        assert_eq!(kind, MessageType::Text);

        let err = decode_body(frame.as_bytes(), kind).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Payload {
                kind: MessageType::Text,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_tag_and_garbage_are_rejected() {
        let frame = json!({ "type": "telemetry", "data": {} }).to_string();
        assert!(matches!(
            decode_tag(frame.as_bytes()),
            Err(DecodeError::Envelope(_))
        ));
        assert!(decode_tag(b"not json").is_err());
        assert!(decode_tag(br#"{"data":"missing tag"}"#).is_err());
    }

    #[test]
    fn test_decode_simple_bodies() {
        let frame = json!({ "type": "logon", "data": "failure" }).to_string();
        assert_eq!(
            decode_body(frame.as_bytes(), MessageType::Authenticate).unwrap(),
            ServerMessage::Authenticate("failure".to_string())
        );

        let frame = json!({ "type": "meeting", "data": true }).to_string();
        assert_eq!(
            decode_body(frame.as_bytes(), MessageType::Meeting).unwrap(),
            ServerMessage::Meeting(true)
        );

        let frame = json!({
            "type": "long",
            "data": { "text": "here you go", "images": ["https://a/1.png", "https://a/2.png"] }
        })
        .to_string();
        let ServerMessage::Long(long) = decode_body(frame.as_bytes(), MessageType::Long).unwrap()
        else {
            panic!("expected a long response");
        };
        assert_eq!(long.images.len(), 2);
        assert_eq!(long.text, "here you go");
    }

    #[test]
    fn test_decode_register_body() {
        let frame = json!({
            "type": "register",
            "data": {
                "imei": "111",
                "accountKey": "secret",
                "userName": "rabbit",
                "userId": "u1",
                "actualUserId": "u1-actual"
            }
        })
        .to_string();
        let ServerMessage::Register(registration) =
            decode_body(frame.as_bytes(), MessageType::Register).unwrap()
        else {
            panic!("expected a registration");
        };
        assert_eq!(registration.imei, "111");
        assert_eq!(registration.account_key, "secret");
        assert_eq!(registration.actual_user_id, "u1-actual");
    }

    #[test]
    fn test_audio_timing_is_double_encoded() {
        let nested = r#"{\"language\":\"en\",\"chars\":[\"a\",\" \",\"b\"],\"char_start_times_ms\":[0,5,10],\"char_durations_ms\":[5,5,5]}"#;
        let frame = json!({
            "type": "audio",
            "data": { "text": nested, "audio": "UklGRg==" }
        })
        .to_string();

        let ServerMessage::Audio(item) = decode_body(frame.as_bytes(), MessageType::Audio).unwrap()
        else {
            panic!("expected audio");
        };
        assert_eq!(item.audio, b"RIFF");
        let timing = item.timing.expect("timing should parse after unescaping");
        assert_eq!(timing.language, "en");
        assert_eq!(timing.characters, vec!["a", " ", "b"]);
        assert_eq!(timing.char_start_ms, vec![0, 5, 10]);
        assert!(timing.is_aligned());
    }

    #[test]
    fn test_audio_without_usable_timing_still_decodes() {
        for text in [json!(null), json!("not a timing document"), json!("{}")] {
            let frame = json!({
                "type": "audio",
                "data": { "text": text, "audio": "UklGRg==" }
            })
            .to_string();
            let ServerMessage::Audio(item) =
                decode_body(frame.as_bytes(), MessageType::Audio).unwrap()
            else {
                panic!("expected audio");
            };
            assert!(item.timing.is_none());
            assert_eq!(item.audio, b"RIFF");
        }

        let frame = json!({ "type": "audio", "data": { "audio": "UklGRg==" } }).to_string();
        assert!(decode_body(frame.as_bytes(), MessageType::Audio).is_ok());
    }

    #[test]
    fn test_invalid_base64_audio_degrades_to_empty_buffer() {
        let frame = json!({
            "type": "audio",
            "data": { "text": null, "audio": "***" }
        })
        .to_string();
        let ServerMessage::Audio(item) = decode_body(frame.as_bytes(), MessageType::Audio).unwrap()
        else {
            panic!("expected audio");
        };
        assert!(item.audio.is_empty());
    }
}

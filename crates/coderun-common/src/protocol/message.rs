// Session messages exchanged between the host and a runner.

use crate::artifact::Export;
use crate::durable::Value;
use crate::error::ProtocolError;
use crate::ids::{RunnerId, SessionId};
use crate::protocol::frame::{encode_json, Envelope, Payload, WireMessage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire tags of the session message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageTag {
    Run = 1,
    Module = 2,
    Callback = 3,
    Response = 4,
    Sleep = 5,
    Subscribe = 6,
    NextEvent = 7,
    Unsubscribe = 8,
    Log = 9,
    Print = 10,
    Done = 11,
    Health = 12,
    Ack = 13,
    Error = 14,
}

impl MessageTag {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => MessageTag::Run,
            2 => MessageTag::Module,
            3 => MessageTag::Callback,
            4 => MessageTag::Response,
            5 => MessageTag::Sleep,
            6 => MessageTag::Subscribe,
            7 => MessageTag::NextEvent,
            8 => MessageTag::Unsubscribe,
            9 => MessageTag::Log,
            10 => MessageTag::Print,
            11 => MessageTag::Done,
            12 => MessageTag::Health,
            13 => MessageTag::Ack,
            14 => MessageTag::Error,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageTag::Run => "Run",
            MessageTag::Module => "Module",
            MessageTag::Callback => "Callback",
            MessageTag::Response => "Response",
            MessageTag::Sleep => "Sleep",
            MessageTag::Subscribe => "Subscribe",
            MessageTag::NextEvent => "NextEvent",
            MessageTag::Unsubscribe => "Unsubscribe",
            MessageTag::Log => "Log",
            MessageTag::Print => "Print",
            MessageTag::Done => "Done",
            MessageTag::Health => "Health",
            MessageTag::Ack => "Ack",
            MessageTag::Error => "Error",
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Category carried by an `Error` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Protocol,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Host asks the runner to invoke an entry point with a triggering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub entry_point: String,
    pub event: serde_json::Value,
}

/// Runner's handshake: the entry points its code exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub session_id: SessionId,
    pub runner_id: RunnerId,
    pub exports: Vec<Export>,
}

/// Runner asks the host to invoke one activity durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub session_id: SessionId,
    pub call_id: String,
    pub function: String,
    #[serde(with = "crate::protocol::base64_bytes")]
    pub payload: Vec<u8>,
}

/// Result of an activity or of a control request. `call_id` is set when
/// the response answers a `Callback`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            call_id: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            call_id: None,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sleep {
    pub session_id: SessionId,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub session_id: SessionId,
    pub connection: String,
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextEvent {
    pub session_id: SessionId,
    pub subscription_ids: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub session_id: SessionId,
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub session_id: SessionId,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Print {
    pub session_id: SessionId,
    pub text: String,
}

/// Runner reports that the entry point returned or raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Done {
    pub session_id: SessionId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Health {
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

macro_rules! session_payload {
    ($($ty:ident => $tag:ident),* $(,)?) => {
        $(
            impl Payload for $ty {
                type Family = Message;
                const TAG: i32 = MessageTag::$tag as i32;
                const NAME: &'static str = stringify!($tag);
            }

            impl From<$ty> for Message {
                fn from(value: $ty) -> Self {
                    Message::$tag(value)
                }
            }
        )*
    };
}

session_payload!(
    Run => Run,
    Module => Module,
    Callback => Callback,
    Response => Response,
    Sleep => Sleep,
    Subscribe => Subscribe,
    NextEvent => NextEvent,
    Unsubscribe => Unsubscribe,
    Log => Log,
    Print => Print,
    Done => Done,
    Health => Health,
    Ack => Ack,
    ErrorReply => Error,
);

/// Every message a session connection can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Run(Run),
    Module(Module),
    Callback(Callback),
    Response(Response),
    Sleep(Sleep),
    Subscribe(Subscribe),
    NextEvent(NextEvent),
    Unsubscribe(Unsubscribe),
    Log(Log),
    Print(Print),
    Done(Done),
    Health(Health),
    Ack(Ack),
    Error(ErrorReply),
}

impl Message {
    pub fn kind(&self) -> MessageTag {
        match self {
            Message::Run(_) => MessageTag::Run,
            Message::Module(_) => MessageTag::Module,
            Message::Callback(_) => MessageTag::Callback,
            Message::Response(_) => MessageTag::Response,
            Message::Sleep(_) => MessageTag::Sleep,
            Message::Subscribe(_) => MessageTag::Subscribe,
            Message::NextEvent(_) => MessageTag::NextEvent,
            Message::Unsubscribe(_) => MessageTag::Unsubscribe,
            Message::Log(_) => MessageTag::Log,
            Message::Print(_) => MessageTag::Print,
            Message::Done(_) => MessageTag::Done,
            Message::Health(_) => MessageTag::Health,
            Message::Ack(_) => MessageTag::Ack,
            Message::Error(_) => MessageTag::Error,
        }
    }

    /// The session a runner-originated message belongs to.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Message::Module(m) => Some(&m.session_id),
            Message::Callback(m) => Some(&m.session_id),
            Message::Sleep(m) => Some(&m.session_id),
            Message::Subscribe(m) => Some(&m.session_id),
            Message::NextEvent(m) => Some(&m.session_id),
            Message::Unsubscribe(m) => Some(&m.session_id),
            Message::Log(m) => Some(&m.session_id),
            Message::Print(m) => Some(&m.session_id),
            Message::Done(m) => Some(&m.session_id),
            Message::Health(m) => m.session_id.as_ref(),
            Message::Run(_) | Message::Response(_) | Message::Ack(_) | Message::Error(_) => None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Message::Error(ErrorReply::new(kind, message))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind().fmt(f)
    }
}

impl WireMessage for Message {
    fn tag(&self) -> i32 {
        self.kind() as i32
    }

    fn tag_name(tag: i32) -> Option<&'static str> {
        MessageTag::from_i32(tag).map(MessageTag::name)
    }

    fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Message::Run(m) => encode_json(m),
            Message::Module(m) => encode_json(m),
            Message::Callback(m) => encode_json(m),
            Message::Response(m) => encode_json(m),
            Message::Sleep(m) => encode_json(m),
            Message::Subscribe(m) => encode_json(m),
            Message::NextEvent(m) => encode_json(m),
            Message::Unsubscribe(m) => encode_json(m),
            Message::Log(m) => encode_json(m),
            Message::Print(m) => encode_json(m),
            Message::Done(m) => encode_json(m),
            Message::Health(m) => encode_json(m),
            Message::Ack(m) => encode_json(m),
            Message::Error(m) => encode_json(m),
        }
    }

    fn decode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let tag = MessageTag::from_i32(envelope.tag).ok_or(ProtocolError::UnknownTag(envelope.tag))?;
        Ok(match tag {
            MessageTag::Run => Message::Run(envelope.decode_as()?),
            MessageTag::Module => Message::Module(envelope.decode_as()?),
            MessageTag::Callback => Message::Callback(envelope.decode_as()?),
            MessageTag::Response => Message::Response(envelope.decode_as()?),
            MessageTag::Sleep => Message::Sleep(envelope.decode_as()?),
            MessageTag::Subscribe => Message::Subscribe(envelope.decode_as()?),
            MessageTag::NextEvent => Message::NextEvent(envelope.decode_as()?),
            MessageTag::Unsubscribe => Message::Unsubscribe(envelope.decode_as()?),
            MessageTag::Log => Message::Log(envelope.decode_as()?),
            MessageTag::Print => Message::Print(envelope.decode_as()?),
            MessageTag::Done => Message::Done(envelope.decode_as()?),
            MessageTag::Health => Message::Health(envelope.decode_as()?),
            MessageTag::Ack => Message::Ack(envelope.decode_as()?),
            MessageTag::Error => Message::Error(envelope.decode_as()?),
        })
    }

    fn as_remote_error(&self) -> Option<(ErrorKind, &str)> {
        match self {
            Message::Error(e) => Some((e.kind, e.message.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{read_envelope, write_envelope, FramedConnection};

    fn sid() -> SessionId {
        SessionId::from("ses_1")
    }

    fn every_variant() -> Vec<Message> {
        vec![
            Run {
                entry_point: "flow.py:on_push".into(),
                event: serde_json::json!({"ref": "main"}),
            }
            .into(),
            Module {
                session_id: sid(),
                runner_id: RunnerId::from("rnr_1"),
                exports: vec![Export {
                    symbol: "on_push".into(),
                    file: "flow.py".into(),
                    line: 3,
                }],
            }
            .into(),
            Callback {
                session_id: sid(),
                call_id: "c1".into(),
                function: "fetch".into(),
                payload: vec![0, 159, 146, 150],
            }
            .into(),
            Response::ok(Value::Bytes(vec![1, 2, 3])).with_call_id("c1").into(),
            Response::failed("boom").into(),
            Sleep {
                session_id: sid(),
                duration_ms: 1500,
            }
            .into(),
            Subscribe {
                session_id: sid(),
                connection: "github".into(),
                filter: "push".into(),
            }
            .into(),
            NextEvent {
                session_id: sid(),
                subscription_ids: vec!["s1".into(), "s2".into()],
                timeout_ms: Some(250),
            }
            .into(),
            Unsubscribe {
                session_id: sid(),
                subscription_id: "s1".into(),
            }
            .into(),
            Log {
                session_id: sid(),
                level: LogLevel::Warn,
                message: "careful".into(),
            }
            .into(),
            Print {
                session_id: sid(),
                text: "hello\n".into(),
            }
            .into(),
            Done {
                session_id: sid(),
                result: Some(Value::Json(serde_json::json!(42))),
                error: None,
                traceback: vec![],
            }
            .into(),
            Health { session_id: None }.into(),
            Ack {}.into(),
            Message::error(ErrorKind::NotFound, "no such session"),
        ]
    }

    #[test]
    fn every_variant_survives_the_wire() {
        for message in every_variant() {
            let envelope = message.to_envelope(9).unwrap();
            assert_eq!(envelope.tag, message.kind() as i32);
            let decoded = Message::decode(&envelope).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn decoding_against_wrong_variant_names_both_tags() {
        let envelope = Message::from(Print {
            session_id: sid(),
            text: "x".into(),
        })
        .to_envelope(1)
        .unwrap();

        match envelope.decode_as::<Sleep>() {
            Err(ProtocolError::TypeMismatch { expected, actual }) => {
                assert_eq!(expected, "Sleep");
                assert_eq!(actual, "Print");
            }
            other => panic!("expected type mismatch, got {other:?}"),
        }
    }

    #[test]
    fn invalid_payload_is_malformed() {
        let envelope = Envelope {
            tag: MessageTag::Sleep as i32,
            id: 1,
            payload: br#"{"session_id":"s"}"#.to_vec(),
        };
        assert!(matches!(
            Message::decode(&envelope),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn callback_payload_is_base64_on_the_wire() {
        let envelope = Message::from(Callback {
            session_id: sid(),
            call_id: "c".into(),
            function: "f".into(),
            payload: b"hi".to_vec(),
        })
        .to_envelope(1)
        .unwrap();
        let text = String::from_utf8(envelope.payload).unwrap();
        assert!(text.contains("\"aGk=\""), "{text}");
    }

    #[tokio::test]
    async fn unknown_tag_consumes_frame_and_keeps_stream_usable() {
        let mut buf = Vec::new();
        write_envelope(
            &mut buf,
            &Envelope {
                tag: 99,
                id: 1,
                payload: b"{\"anything\":true}".to_vec(),
            },
        )
        .await
        .unwrap();
        write_envelope(&mut buf, &Message::from(Ack {}).to_envelope(2).unwrap())
            .await
            .unwrap();

        let mut reader: &[u8] = &buf;
        let first = read_envelope(&mut reader).await.unwrap();
        assert!(matches!(
            Message::decode(&first),
            Err(ProtocolError::UnknownTag(99))
        ));
        let second = read_envelope(&mut reader).await.unwrap();
        assert_eq!(Message::decode(&second).unwrap(), Message::Ack(Ack {}));
    }

    #[tokio::test]
    async fn request_matches_reply_and_surfaces_remote_errors() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = FramedConnection::new(client);
        let mut server = FramedConnection::new(server);

        let peer = tokio::spawn(async move {
            let first = server.receive().await.unwrap();
            server.send(first.id, &Message::from(Ack {})).await.unwrap();
            let second = server.receive().await.unwrap();
            server
                .send(second.id, &Message::error(ErrorKind::NotFound, "gone"))
                .await
                .unwrap();
        });

        let reply = client.request(&Message::from(Health::default())).await.unwrap();
        assert_eq!(reply, Message::Ack(Ack {}));

        let err = client
            .request(&Message::from(Health::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Remote {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
        peer.await.unwrap();
    }
}

// Remote runner pools: a host forwards start/stop/health to runner manager
// processes elsewhere, which serve them over the same framing.

mod backend;
mod server;

pub use backend::RemoteBackend;
pub use server::RunnerPoolServer;

use coderun_common::error::ProtocolError;
use coderun_common::protocol::{encode_json, Envelope, ErrorKind, Payload, WireMessage};
use coderun_common::{BuildArtifact, RunnerId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire tags of the runner pool family. Kept apart from session tags so a
/// misdirected connection fails with an unknown tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PoolTag {
    StartRunner = 101,
    RunnerStarted = 102,
    StopRunner = 103,
    RunnerHealth = 104,
    ManagerHealth = 105,
    Ack = 106,
    Error = 107,
}

impl PoolTag {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            101 => PoolTag::StartRunner,
            102 => PoolTag::RunnerStarted,
            103 => PoolTag::StopRunner,
            104 => PoolTag::RunnerHealth,
            105 => PoolTag::ManagerHealth,
            106 => PoolTag::Ack,
            107 => PoolTag::Error,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolTag::StartRunner => "StartRunner",
            PoolTag::RunnerStarted => "RunnerStarted",
            PoolTag::StopRunner => "StopRunner",
            PoolTag::RunnerHealth => "RunnerHealth",
            PoolTag::ManagerHealth => "ManagerHealth",
            PoolTag::Ack => "Ack",
            PoolTag::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRunner {
    pub session_id: SessionId,
    pub runner_id: RunnerId,
    pub artifact: BuildArtifact,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub worker_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStarted {
    pub runner_id: RunnerId,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRunner {
    pub runner_id: RunnerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerHealth {
    pub runner_id: RunnerId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerHealth {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolAck {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolError {
    pub kind: ErrorKind,
    pub message: String,
}

macro_rules! pool_payload {
    ($($ty:ident => $tag:ident),* $(,)?) => {
        $(
            impl Payload for $ty {
                type Family = PoolMessage;
                const TAG: i32 = PoolTag::$tag as i32;
                const NAME: &'static str = stringify!($tag);
            }
        )*
    };
}

pool_payload!(
    StartRunner => StartRunner,
    RunnerStarted => RunnerStarted,
    StopRunner => StopRunner,
    RunnerHealth => RunnerHealth,
    ManagerHealth => ManagerHealth,
    PoolAck => Ack,
    PoolError => Error,
);

#[derive(Debug, Clone, PartialEq)]
pub enum PoolMessage {
    StartRunner(StartRunner),
    RunnerStarted(RunnerStarted),
    StopRunner(StopRunner),
    RunnerHealth(RunnerHealth),
    ManagerHealth(ManagerHealth),
    Ack(PoolAck),
    Error(PoolError),
}

impl PoolMessage {
    pub fn kind(&self) -> PoolTag {
        match self {
            PoolMessage::StartRunner(_) => PoolTag::StartRunner,
            PoolMessage::RunnerStarted(_) => PoolTag::RunnerStarted,
            PoolMessage::StopRunner(_) => PoolTag::StopRunner,
            PoolMessage::RunnerHealth(_) => PoolTag::RunnerHealth,
            PoolMessage::ManagerHealth(_) => PoolTag::ManagerHealth,
            PoolMessage::Ack(_) => PoolTag::Ack,
            PoolMessage::Error(_) => PoolTag::Error,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        PoolMessage::Error(PoolError {
            kind,
            message: message.into(),
        })
    }
}

impl WireMessage for PoolMessage {
    fn tag(&self) -> i32 {
        self.kind() as i32
    }

    fn tag_name(tag: i32) -> Option<&'static str> {
        PoolTag::from_i32(tag).map(PoolTag::name)
    }

    fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            PoolMessage::StartRunner(m) => encode_json(m),
            PoolMessage::RunnerStarted(m) => encode_json(m),
            PoolMessage::StopRunner(m) => encode_json(m),
            PoolMessage::RunnerHealth(m) => encode_json(m),
            PoolMessage::ManagerHealth(m) => encode_json(m),
            PoolMessage::Ack(m) => encode_json(m),
            PoolMessage::Error(m) => encode_json(m),
        }
    }

    fn decode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let tag = PoolTag::from_i32(envelope.tag).ok_or(ProtocolError::UnknownTag(envelope.tag))?;
        Ok(match tag {
            PoolTag::StartRunner => PoolMessage::StartRunner(envelope.decode_as()?),
            PoolTag::RunnerStarted => PoolMessage::RunnerStarted(envelope.decode_as()?),
            PoolTag::StopRunner => PoolMessage::StopRunner(envelope.decode_as()?),
            PoolTag::RunnerHealth => PoolMessage::RunnerHealth(envelope.decode_as()?),
            PoolTag::ManagerHealth => PoolMessage::ManagerHealth(envelope.decode_as()?),
            PoolTag::Ack => PoolMessage::Ack(envelope.decode_as()?),
            PoolTag::Error => PoolMessage::Error(envelope.decode_as()?),
        })
    }

    fn as_remote_error(&self) -> Option<(ErrorKind, &str)> {
        match self {
            PoolMessage::Error(e) => Some((e.kind, e.message.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_common::protocol::{Message, Run};

    #[test]
    fn pool_messages_survive_the_wire() {
        let messages = vec![
            PoolMessage::StartRunner(StartRunner {
                session_id: SessionId::from("s"),
                runner_id: RunnerId::from("r"),
                artifact: BuildArtifact::default(),
                vars: HashMap::from([("A".to_string(), "1".to_string())]),
                worker_address: "10.0.0.5:7000".into(),
            }),
            PoolMessage::RunnerStarted(RunnerStarted {
                runner_id: RunnerId::from("r"),
                endpoint: "127.0.0.1:5000".into(),
            }),
            PoolMessage::StopRunner(StopRunner {
                runner_id: RunnerId::from("r"),
            }),
            PoolMessage::RunnerHealth(RunnerHealth {
                runner_id: RunnerId::from("r"),
            }),
            PoolMessage::ManagerHealth(ManagerHealth {}),
            PoolMessage::Ack(PoolAck {}),
            PoolMessage::error(ErrorKind::NotFound, "runner r not found"),
        ];
        for message in messages {
            let envelope = message.to_envelope(3).unwrap();
            assert_eq!(PoolMessage::decode(&envelope).unwrap(), message);
        }
    }

    #[test]
    fn session_frames_are_unknown_to_the_pool() {
        let envelope = Message::Run(Run {
            entry_point: "a.py:f".into(),
            event: serde_json::Value::Null,
        })
        .to_envelope(1)
        .unwrap();
        assert!(matches!(
            PoolMessage::decode(&envelope),
            Err(ProtocolError::UnknownTag(1))
        ));
    }
}

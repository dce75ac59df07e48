// Message protocol shared by the host, runners and the runner pool.

pub mod frame;
pub mod message;

pub use frame::{
    encode_json, read_envelope, write_envelope, Envelope, FramedConnection, Payload, WireMessage,
};
pub use message::{
    Ack, Callback, Done, ErrorKind, ErrorReply, Health, Log, LogLevel, Message, MessageTag, Module,
    NextEvent, Print, Response, Run, Sleep, Subscribe, Unsubscribe,
};

/// Serde adapter carrying raw bytes as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

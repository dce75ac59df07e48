// Length-prefixed framing shared by every coderun connection.
//
// Wire layout of one frame:
// - 4 bytes: message tag as little-endian i32
// - 8 bytes: correlation id as little-endian u64
// - 4 bytes: payload length as little-endian u32
// - N bytes: JSON payload

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::protocol::ErrorKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One decoded frame: a tag, a correlation id and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: i32,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Decode the payload as one specific variant, failing with a
    /// type mismatch when the frame carries a different tag.
    pub fn decode_as<P: Payload>(&self) -> Result<P, ProtocolError> {
        if self.tag != P::TAG {
            return Err(ProtocolError::TypeMismatch {
                expected: P::NAME.to_string(),
                actual: <P::Family as WireMessage>::tag_name(self.tag)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("tag {}", self.tag)),
            });
        }
        serde_json::from_slice(&self.payload).map_err(|source| ProtocolError::Malformed {
            tag: P::NAME.to_string(),
            source,
        })
    }
}

/// A closed set of messages sharing one tag space.
pub trait WireMessage: Sized {
    /// Numeric tag written on the wire.
    fn tag(&self) -> i32;

    /// Human name of a tag, or `None` if the family doesn't define it.
    fn tag_name(tag: i32) -> Option<&'static str>;

    /// Serialize the variant's payload.
    fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Dispatch on the envelope's tag and decode the matching payload.
    fn decode(envelope: &Envelope) -> Result<Self, ProtocolError>;

    /// The error carried by an error-reply variant, if this is one.
    fn as_remote_error(&self) -> Option<(ErrorKind, &str)> {
        None
    }

    fn to_envelope(&self, id: u64) -> Result<Envelope, ProtocolError> {
        Ok(Envelope {
            tag: self.tag(),
            id,
            payload: self.encode_payload()?,
        })
    }
}

/// A payload type bound to exactly one tag of a message family.
pub trait Payload: Serialize + DeserializeOwned {
    type Family: WireMessage;
    const TAG: i32;
    const NAME: &'static str;
}

/// Serialize a payload to its JSON bytes.
pub fn encode_json<P: Payload>(payload: &P) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(payload).map_err(|source| ProtocolError::Malformed {
        tag: P::NAME.to_string(),
        source,
    })
}

/// Write a single frame and flush it.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if envelope.payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: envelope.payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut header = [0u8; 16];
    header[..4].copy_from_slice(&envelope.tag.to_le_bytes());
    header[4..12].copy_from_slice(&envelope.id.to_le_bytes());
    header[12..].copy_from_slice(&(envelope.payload.len() as u32).to_le_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&envelope.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a single frame. A clean EOF before the first header byte is
/// reported as [`ProtocolError::ConnectionClosed`].
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 16];
    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    reader.read_exact(&mut header[1..]).await?;

    let tag = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&header[4..12]);
    let id = u64::from_le_bytes(id_bytes);
    let len = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Envelope { tag, id, payload })
}

/// A bidirectional, ordered message connection over any byte stream.
pub struct FramedConnection<S> {
    stream: S,
    next_id: u64,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, next_id: 1 }
    }

    /// Send `message` under the given correlation id.
    pub async fn send<M: WireMessage>(&mut self, id: u64, message: &M) -> Result<(), ProtocolError> {
        let envelope = message.to_envelope(id)?;
        write_envelope(&mut self.stream, &envelope).await
    }

    /// Receive the next raw frame.
    pub async fn receive(&mut self) -> Result<Envelope, ProtocolError> {
        read_envelope(&mut self.stream).await
    }

    /// Send a request and wait for the reply carrying the same correlation
    /// id. An error-reply variant is surfaced as [`ProtocolError::Remote`].
    pub async fn request<M: WireMessage>(&mut self, message: &M) -> Result<M, ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;

        self.send(id, message).await?;
        let envelope = self.receive().await?;
        if envelope.id != id {
            return Err(ProtocolError::UnexpectedReply {
                expected: id,
                actual: envelope.id,
            });
        }

        let reply = M::decode(&envelope)?;
        if let Some((kind, text)) = reply.as_remote_error() {
            return Err(ProtocolError::Remote {
                kind,
                message: text.to_string(),
            });
        }
        Ok(reply)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_layout_is_little_endian() {
        let envelope = Envelope {
            tag: 5,
            id: 7,
            payload: b"{}".to_vec(),
        };
        let mut buf = Vec::new();
        write_envelope(&mut buf, &envelope).await.unwrap();

        assert_eq!(&buf[..4], &5i32.to_le_bytes());
        assert_eq!(&buf[4..12], &7u64.to_le_bytes());
        assert_eq!(&buf[12..16], &2u32.to_le_bytes());
        assert_eq!(&buf[16..], b"{}");

        let mut reader: &[u8] = &buf;
        assert_eq!(read_envelope(&mut reader).await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn clean_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        let err = read_envelope(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let mut reader: &[u8] = &[1, 0, 0, 0, 9];
        let err = read_envelope(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut reader: &[u8] = &buf;
        let err = read_envelope(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }
}

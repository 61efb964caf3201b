use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Which peer caused a stream to exist.
///
/// Every frame carries the originating role of the stream it concerns, so
/// the receiving peer can map it to its own bookkeeping: a peer's
/// `initiator` streams are the counterpart's `recipient` streams, and vice
/// versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Recipient,
}

impl Role {
    /// Returns the role under which the *other* peer tracks the same stream.
    pub fn flip(self) -> Self {
        match self {
            Role::Initiator => Role::Recipient,
            Role::Recipient => Role::Initiator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Recipient => write!(f, "recipient"),
        }
    }
}

/// One multiplexing protocol record.
///
/// On the wire every frame is a single newline terminated JSON record:
///
/// ```text
/// {"id":"<string>","type":"create"|"data"|"close"|"reset","chunk"?:"<base64>","direction":"initiator"|"recipient"}
/// ```
///
/// `chunk` is present only on `data` records and holds the raw bytes base64
/// encoded. Records are written and read in strict arrival order over the
/// shared byte connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// The id of the stream this frame concerns, unique within
    /// (direction, id) for the lifetime of a session.
    pub id: String,
    #[serde(flatten)]
    pub body: FrameBody,
    /// The originating role of the stream, see [`Role`].
    pub direction: Role,
}

/// The typed payload of a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameBody {
    /// Announces a new stream. Sent only by the role that originated it,
    /// before any other frame for the same (id, direction).
    Create,
    /// A sequence preserving fragment of the stream's outbound byte
    /// sequence.
    Data {
        #[serde(serialize_with = "as_base64", deserialize_with = "from_base64")]
        chunk: Vec<u8>,
    },
    /// The sender has finished writing; no more `Data` will follow for this
    /// (id, direction).
    Close,
    /// Abrupt, abnormal termination of the stream.
    Reset,
}

fn as_base64<S>(chunk: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(chunk))
}

fn from_base64<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;

    STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
}

impl Frame {
    /// Create frame announcing stream `id`.
    pub fn create(id: impl Into<String>, direction: Role) -> Self {
        Frame {
            id: id.into(),
            body: FrameBody::Create,
            direction,
        }
    }

    /// Data frame carrying one fragment of the stream's byte sequence.
    pub fn data(id: impl Into<String>, direction: Role, chunk: Vec<u8>) -> Self {
        Frame {
            id: id.into(),
            body: FrameBody::Data { chunk },
            direction,
        }
    }

    /// Close frame ending the sender's write half.
    pub fn close(id: impl Into<String>, direction: Role) -> Self {
        Frame {
            id: id.into(),
            body: FrameBody::Close,
            direction,
        }
    }

    /// Reset frame tearing the stream down abruptly.
    pub fn reset(id: impl Into<String>, direction: Role) -> Self {
        Frame {
            id: id.into(),
            body: FrameBody::Reset,
            direction,
        }
    }

    /// Encodes the frame as one newline terminated JSON record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)
            .map_err(|err| Error::ProtocolViolation(err.to_string()))?;

        buf.push(b'\n');

        Ok(buf)
    }
}

/// A resumable decoder from wire bytes to [`Frame`]s.
///
/// The decoder can be fed partial byte ranges and emits frames only once a
/// full record is available, preserving strict arrival order. Stream
/// dispatch correctness depends on that order: `Create` must be observed
/// before any `Data`/`Close`/`Reset` for the same id.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends bytes received from the underlying connection.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and parses the next complete record.
    ///
    /// Returns `Ok(None)` until a full newline terminated record has
    /// arrived. A record that fails to parse is a protocol violation: frame
    /// boundaries are unrecoverable afterwards, the caller must terminate
    /// the session.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(pos) = self.buf.iter().position(|byte| *byte == b'\n') else {
            return Ok(None);
        };

        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1];

        if line.is_empty() {
            return Err(Error::ProtocolViolation("empty record".to_string()));
        }

        serde_json::from_slice(line)
            .map(Some)
            .map_err(|err| Error::ProtocolViolation(err.to_string()))
    }
}

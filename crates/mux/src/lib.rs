//! Many independent, bidirectional logical streams carried over one physical
//! duplex connection.
//!
//! A [`Session`] owns exactly one underlying byte connection. Local code
//! opens outbound streams with [`Session::open_stream`]; bytes arriving from
//! the peer are fed in with [`Session::recv`] and demultiplexed to the
//! matching [`MuxStream`]. Each stream is an independently closable duplex
//! byte channel with its own half-close, reset and abort lifecycle.
//!
//! Streams opened by each peer are tracked under separate role maps
//! (`initiator` vs `recipient`), so the two peers never need to coordinate
//! id allocation: a frame tagged with the sender's role is dispatched to the
//! mirror registry on the receiving side.
//!
//! The wire encoding is a line-oriented JSON framing, one record per frame,
//! suitable for conformance testing against other implementations of the
//! same protocol. See [`Frame`] for the record shape.

mod frame;
mod registry;
mod session;
mod stream;

pub use frame::{Frame, FrameBody, FrameDecoder, Role};
pub use session::{Config, Session, StreamHook, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_SEND_QUEUE_LEN};
pub use stream::{MuxStream, Timeline};

use std::io;

/// The error type of this crate.
///
/// Session-scope errors ([`ProtocolViolation`](Error::ProtocolViolation),
/// [`DuplicateStream`](Error::DuplicateStream),
/// [`UnknownStream`](Error::UnknownStream)) are not locally recoverable: the
/// session is torn down and every live stream is aborted with the cause.
/// Stream-scope errors are reported to that stream's caller only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation attempted after the session's connection ended.
    #[error("The session's underlying connection has already ended.")]
    SessionClosed,

    /// Malformed wire record, or a frame that violates protocol state.
    /// Fatal to the whole session: frame boundaries are unrecoverable.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A `Create` frame referenced an id already registered under the same
    /// role.
    #[error("Duplicate create frame for stream ({0}).")]
    DuplicateStream(String),

    /// A frame referenced a stream that was never created or is already
    /// closed.
    #[error("Frame references unknown stream ({0}).")]
    UnknownStream(String),

    /// Write attempted after the local write half ended. Scoped to the
    /// offending call.
    #[error("The write half of stream ({0}) has already ended.")]
    StreamClosed(String),

    /// The stream was reset, locally or by the peer. Terminal to that
    /// stream only.
    #[error("Stream reset.")]
    StreamReset,

    /// The stream was torn down locally because the underlying connection
    /// is gone. Terminal to that stream only.
    #[error("Stream aborted.")]
    StreamAborted,
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, value)
    }
}

/// Type alias of [`std::result::Result<T, Error>`]
pub type Result<T> = std::result::Result<T, Error>;

//! The error types returned by the engine and its parts.

use std::fmt;

use crate::PieceIndex;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type for all engine operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The remote peer violated the wire protocol. The session is closed and
    /// the peer's address is returned to the candidate pool with backoff.
    Protocol(ProtocolError),
    /// A fully downloaded piece failed its SHA-1 check. Contributing peers are
    /// penalized and the piece is downloaded again.
    HashFailure(PieceIndex),
    /// An operation did not complete within its deadline (handshake, request
    /// or idle timeout).
    Timeout,
    /// Disk or network IO failure. Fatal when it occurs while committing
    /// a verified piece, recoverable otherwise.
    Io(std::io::Error),
    /// The peer was banned for repeated misbehavior. Its address is not
    /// reconnected for the rest of the session.
    Banned,
    /// The metadata downloaded from peers did not hash to the torrent's info
    /// hash, or could not be decoded.
    MetadataInvalid,
    /// The tracker returned a failure response or could not be reached.
    Tracker(String),
    /// The metainfo file, magnet URI or engine configuration is invalid.
    Config(String),
    /// Bencode encoding or decoding failed.
    Bencode(serde_bencode::Error),
    /// An internal channel was closed, most likely because the other half was
    /// shut down.
    ChannelClosed,
}

/// Wire protocol violations that close a peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The handshake's protocol string or length prefix was wrong.
    InvalidHandshake,
    /// The peer advertised an info hash for a different torrent.
    InvalidInfoHash,
    /// The remote peer id equals ours, i.e. we connected to ourselves.
    SelfConnection,
    /// A bitfield message arrived after the first non-handshake message, or
    /// its length or padding bits were wrong.
    InvalidBitfield,
    /// A message's length prefix or payload did not match its type.
    InvalidMessage,
    /// A block's piece index, offset or length is out of bounds.
    InvalidBlockInfo,
    /// An extended message carried a malformed bencoded payload.
    InvalidExtendedPayload,
    /// A message exceeded the maximum tolerated frame length.
    MessageTooLarge,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidHandshake => write!(f, "invalid handshake"),
            Self::InvalidInfoHash => write!(f, "info hash mismatch"),
            Self::SelfConnection => write!(f, "connected to self"),
            Self::InvalidBitfield => write!(f, "invalid bitfield"),
            Self::InvalidMessage => write!(f, "malformed message"),
            Self::InvalidBlockInfo => write!(f, "block info out of bounds"),
            Self::InvalidExtendedPayload => {
                write!(f, "malformed extended payload")
            }
            Self::MessageTooLarge => write!(f, "message too large"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::HashFailure(index) => {
                write!(f, "piece {} failed hash check", index)
            }
            Self::Timeout => write!(f, "operation timed out"),
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Banned => write!(f, "peer banned"),
            Self::MetadataInvalid => write!(f, "invalid metadata from peers"),
            Self::Tracker(reason) => write!(f, "tracker error: {}", reason),
            Self::Config(reason) => write!(f, "configuration error: {}", reason),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

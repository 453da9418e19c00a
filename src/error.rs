use thiserror::Error;

use crate::comms::message::DataType;

/// Failure categories that callers (or logs) need to tell apart. They travel inside
///  `anyhow::Error`; use `downcast_ref::<MoosError>()` to branch on them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MoosError {
    #[error("protocol mismatch: expected {expected:?}, received {received:?}")]
    ProtocolMismatch { expected: String, received: String },
    #[error("A client of this name (\"{0}\") already exists")]
    DuplicateClientName(String),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
    #[error("variable {key:?} has type {established:?}, rejecting write of type {offered:?}")]
    TypeConflict { key: String, established: DataType, offered: DataType },
    #[error("{mailbox} overflowed, dropped {dropped} oldest message(s)")]
    MailboxOverflow { mailbox: &'static str, dropped: usize },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("client {0:?} was silent for longer than the configured timeout")]
    ClientSilence(String),
    #[error("connection rejected by server: {0}")]
    Poisoned(String),
    #[error("not connected")]
    NotConnected,
}

//! Error taxonomy for the trace replay/mutation client.

use crate::value::ValueKind;

/// Everything that can go wrong while resolving types, walking the value
/// graph, or driving the `StreamCommands` protocol.
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("failed to connect to trace service: {0}")]
    Connect(#[source] tonic::transport::Error),

    #[error("trace service call failed: {0}")]
    Transport(#[from] tonic::Status),

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("value kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch { expected: ValueKind, found: ValueKind },

    #[error("index {0} is out of range for this pointer")]
    IndexOutOfRange(u64),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("wire message was missing required field `{0}`")]
    MissingField(&'static str),

    #[error("stream ended unexpectedly before a Done or Error message")]
    UnexpectedEof,
}

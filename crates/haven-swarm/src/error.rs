use std::path::PathBuf;

use thiserror::Error;

use crate::connection::{ConnectionId, ConnectionState};

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Invalid range: [{start}, {end})")]
    InvalidRange { start: u64, end: u64 },

    #[error("Range [{start}, {end}) exceeds file length {total}")]
    OutOfBounds { start: u64, end: u64, total: u64 },

    #[error("Block [{start}, {end}) failed verification")]
    VerificationFailed { start: u64, end: u64 },

    #[error("Source {id} failed: {reason}")]
    SourceFailed { id: ConnectionId, reason: String },

    #[error("Insufficient sources: {missing} bytes still needed")]
    InsufficientSources { missing: u64 },

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Connection {0} already holds an assignment")]
    AssignmentOutstanding(ConnectionId),

    #[error("Connection {id} does not own [{start}, {end})")]
    NotAssigned { id: ConnectionId, start: u64, end: u64 },

    #[error("Payload length overflows u64 at {path}")]
    LengthOverflow { path: PathBuf },

    #[error("Transfer already finished")]
    TransferFinished,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwarmError>;

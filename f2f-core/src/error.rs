//! Error type shared by the codec, connections and the router.

use crate::wire::{GUID_LEN, MAX_PAYLOAD_LEN};

/// Everything that can go wrong below the application protocol.
///
/// Only construction and decode helpers return these to callers. Inside the
/// read/write loops an error ends the connection (see `Connection::fin`).
#[derive(Debug, thiserror::Error)]
pub enum F2fError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Declared payload length is over the hard cap. Fatal to the connection.
    #[error("payload length {length} exceeds limit of {max} bytes", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { length: u32 },
    #[error("guid must be exactly {expected} bytes, got {0}", expected = GUID_LEN)]
    InvalidGuid(usize),
    #[error("need more bytes")]
    NeedMore,
    #[error("connection already started")]
    AlreadyStarted,
    #[error("connection is shutting down")]
    ShuttingDown,
    #[error("no tokio runtime available")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, F2fError>;

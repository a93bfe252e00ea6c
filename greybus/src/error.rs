use std::io;

use crate::protocol;

/// Error kinds used throughout the bridge. Each maps onto a Greybus
/// operation `result` byte via [`Error::wire_result`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("out of memory")]
    NoMemory,
    #[error("operation interrupted")]
    Interrupted,
    #[error("transport timed out")]
    Timeout,
    #[error("protocol violation")]
    Protocol,
    #[error("message exceeds MTU")]
    Overflow,
    #[error("invalid argument")]
    Invalid,
    #[error("resource busy")]
    Retry,
    #[error("no such interface or device")]
    Absent,
    #[error("stream ended mid-message")]
    Short,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The Greybus `result` byte reported for this error.
    pub fn wire_result(&self) -> u8 {
        match self {
            Error::NoMemory => protocol::GB_OP_NO_MEMORY,
            Error::Interrupted => protocol::GB_OP_INTERRUPTED,
            Error::Timeout => protocol::GB_OP_TIMEOUT,
            Error::Protocol => protocol::GB_OP_PROTOCOL_BAD,
            Error::Overflow => protocol::GB_OP_OVERFLOW,
            Error::Invalid => protocol::GB_OP_INVALID,
            Error::Retry => protocol::GB_OP_RETRY,
            Error::Absent => protocol::GB_OP_NONEXISTENT,
            Error::Short => protocol::GB_OP_PROTOCOL_BAD,
            Error::Io(e) => match e.kind() {
                io::ErrorKind::Interrupted => protocol::GB_OP_INTERRUPTED,
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => protocol::GB_OP_TIMEOUT,
                io::ErrorKind::OutOfMemory => protocol::GB_OP_NO_MEMORY,
                _ => protocol::GB_OP_UNKNOWN_ERROR,
            },
        }
    }
}

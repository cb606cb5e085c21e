//! Crate-wide error taxonomy
//!
//! One flat enum covers every subsystem. The allocator reports
//! `OutOfMemory`/`Corruption`, the reactor maps socket outcomes onto
//! `EndOfStream`/`NoResponse`/`PeerDisconnected`, and the file-I/O kinds are
//! reserved for the collaborator that consumes this crate's platform layer.

use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The heap cannot be extended with another region.
    #[error("out of memory")]
    OutOfMemory,

    /// Null or misaligned pointer, bad size, malformed target string.
    #[error("invalid argument")]
    InvalidArgument,

    /// Header magic mismatch, chain inconsistency, broken free pattern or
    /// overwritten footer. Always unexpected.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),

    /// Orderly peer close on a read. Non-fatal at the reactor.
    #[error("end of stream")]
    EndOfStream,

    /// Connect, read or write timeout, or a socket exception.
    #[error("no response")]
    NoResponse,

    /// A send failed with reset or broken-pipe semantics.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// fd-set capacity reached.
    #[error("too many sockets")]
    TooManySockets,

    /// Name resolution produced no usable address.
    #[error("no host address")]
    NoHostAddress,

    // Reserved for the file-I/O collaborator.
    #[error("access denied")]
    AccessDenied,
    #[error("file not found")]
    FileNotFound,
    #[error("file busy")]
    FileBusy,
    #[error("read-only")]
    ReadOnly,
    #[error("no disk space")]
    NoDiskSpace,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an OS error at the platform boundary.
    pub fn from_os(err: &io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            io::ErrorKind::PermissionDenied => Error::AccessDenied,
            io::ErrorKind::NotFound => Error::FileNotFound,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::PeerDisconnected,
            io::ErrorKind::TimedOut => Error::NoResponse,
            io::ErrorKind::UnexpectedEof => Error::EndOfStream,
            io::ErrorKind::InvalidInput => Error::InvalidArgument,
            _ => match err.raw_os_error() {
                Some(libc::ENOSPC) => Error::NoDiskSpace,
                Some(libc::EMFILE) | Some(libc::ENFILE) => Error::TooManySockets,
                _ => Error::NoResponse,
            },
        }
    }
}

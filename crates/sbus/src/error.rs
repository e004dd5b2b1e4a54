//! Aggregated error type for the engine

use sbus_core::command::AddressSpace;

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the engine.
///
/// The wire path never lets these escape the manager loop: each failure
/// is raised where it happens, logged, and the affected state machine
/// resets so the engine keeps running. The convenience application
/// surface flattens them into `Option` sentinels (a read timeout yields
/// `None`, `declare` swallows the out-of-range error its `try_declare`
/// sibling returns, a write to a read-only item is ignored).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] sbus_core::CodecError),
    #[error("response sequence {got} does not match request sequence {expected}")]
    SequenceMismatch { expected: u16, got: u16 },
    #[error("no response within the request deadline")]
    RequestTimeout,
    #[error("request rejected or retries exhausted")]
    RequestFailed,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("logical station id {0} already claimed")]
    DuplicateLid(u8),
    #[error("index {index} out of range for {space}")]
    IndexOutOfRange { space: AddressSpace, index: u16 },
    #[error("no traffic from a previously alive server")]
    WatchdogExpired,
}

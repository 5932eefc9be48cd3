//! Crate-wide error kind, grounded in `spec.md` §7.
//!
//! These name *kinds*, not sites: the same [`Error::Busy`] comes back from
//! a filesystem write and from a sensor driver that isn't ready yet.
//! Callers that need to distinguish further do so structurally (matching
//! on the `Result` they hold), not by adding variants here.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Downstream resource in use; retry policy is the caller's.
    Busy,
    /// A bounded FIFO or buffer had no room.
    NoMemory,
    /// Decode/CRC failure, or a length that cannot be valid.
    InvalidData,
    /// An iterator was invalidated, or a transport isn't connected.
    InvalidState,
    /// Programmer error: fatal for the operation, not for the device.
    InvalidParameter,
    /// A bounded wait exceeded its deadline.
    Timeout,
    /// An underlying collaborator returned an impossible condition.
    Internal,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Busy => "busy",
            Error::NoMemory => "no memory",
            Error::InvalidData => "invalid data",
            Error::InvalidState => "invalid state",
            Error::InvalidParameter => "invalid parameter",
            Error::Timeout => "timeout",
            Error::Internal => "internal error",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, fmt: defmt::Formatter) {
        let s = match self {
            Error::Busy => "busy",
            Error::NoMemory => "no memory",
            Error::InvalidData => "invalid data",
            Error::InvalidState => "invalid state",
            Error::InvalidParameter => "invalid parameter",
            Error::Timeout => "timeout",
            Error::Internal => "internal error",
        };
        defmt::write!(fmt, "{}", s)
    }
}

use std::{error, fmt, io};

/// Result of a network operation.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// An argument was malformed or out of range.
    InvalidArgument,
    /// The CAN interface is missing, not a CAN device, or was unregistered.
    NoDevice,
    /// The CAN interface is down.
    NetworkDown,
    /// No address could be claimed, or the endpoint holds no address.
    AddressInUse,
    /// The operation did not complete within its timeout.
    WouldBlock,
    /// The endpoint went away while the operation was pending.
    Cancelled,
    /// The operation was interrupted before completion.
    Interrupted,
    /// The identifier does not carry an ISO 11783 group number.
    InvalidPgn,
    /// The filter cannot be expressed on the driver.
    InvalidFilter,
    /// The receive queue overflowed and frames were dropped.
    Overflow,
    /// An I/O error occured.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NoDevice => write!(f, "no such CAN device"),
            Error::NetworkDown => write!(f, "network is down"),
            Error::AddressInUse => write!(f, "address could not be claimed"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Interrupted => write!(f, "operation interrupted"),
            Error::InvalidPgn => write!(f, "invalid parameter group number"),
            Error::InvalidFilter => write!(f, "invalid message filter"),
            Error::Overflow => write!(f, "receive queue overflow"),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::Interrupted => Error::Interrupted,
            _ => Error::Io(value),
        }
    }
}

impl From<isobus::InvalidFilter> for Error {
    fn from(_: isobus::InvalidFilter) -> Self {
        Error::InvalidFilter
    }
}

impl From<sled::Error> for Error {
    fn from(value: sled::Error) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::Other, value))
    }
}

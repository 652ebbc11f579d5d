//! Error taxonomy of the host stack.
//!
//! Transport failures are fatal to a session. Malformed packets never surface here: they are
//! logged and dropped by the receiving side. Sequence gaps are warnings and travel alongside
//! responses (see [`crate::router::Response`]).
use std::{fmt::Display, io};

use osd_protocol::{ModuleAddress, error::EncodeError, error::PayloadError};
use thiserror::Error;

/// Failure of the underlying channel. Ends the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
}

/// Lookup of a module address that is not part of the session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[error("no module registered at address {0}")]
pub struct NotFound(pub ModuleAddress);

/// Failure to establish a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport error during connect: {0}")]
    Transport(#[from] TransportError),
    #[error("module address {0} is claimed by more than one module")]
    DuplicateAddress(ModuleAddress),
    #[error("registry is sealed, cannot register module {0}")]
    RegistrySealed(ModuleAddress),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Failure of a single request issued by a module driver.
/// Only the request concerned is affected, except for [`RequestError::Disconnected`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error("request {sequence} to module {address} timed out")]
    Timeout {
        address: ModuleAddress,
        sequence: u16,
    },
    #[error("request was cancelled")]
    Cancelled,
    #[error("session is disconnected")]
    Disconnected,
    #[error("module {0} reported an error")]
    DeviceError(ModuleAddress),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("invalid response from module {address}: {source}")]
    InvalidResponse {
        address: ModuleAddress,
        #[source]
        source: PayloadError,
    },
    #[error("module {address} does not support {operation}")]
    Unsupported {
        address: ModuleAddress,
        operation: &'static str,
    },
}

/// Responses from a module were skipped because earlier requests timed out.
/// Reported together with the next response delivered in order.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SequenceGap {
    pub address: ModuleAddress,
    /// Sequence of the first skipped request
    pub first_missing: u16,
    /// Number of skipped requests
    pub skipped: u16,
}

impl Display for SequenceGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sequence gap on module {}: {} response(s) missing starting at {}",
            self.address, self.skipped, self.first_missing
        )
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Coarse classification of [`Error`], stable across the engine and IPC
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInvocation,
    UnknownFunction,
    HostFunction,
    HostFault,
    WorkerFault,
    Timeout,
    NoResult,
    Script,
    Protocol,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Capability payload could not be parsed.
    #[error("{0}")]
    InvalidInvocation(String),

    /// Capability name is not registered.
    #[error("{0}")]
    UnknownFunction(String),

    /// Registered host function reported a failure.
    #[error("{0}")]
    HostFunction(String),

    /// Pool or queue misuse.
    #[error("{0}")]
    HostFault(String),

    /// Worker channel reported an error, or the worker could not be spawned.
    #[error("worker error: {0}")]
    WorkerCrashed(String),

    /// Worker channel closed before a reply arrived.
    #[error("worker disconnected")]
    WorkerDisconnected,

    #[error("execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Engine produced no parseable result.
    #[error("no result")]
    NoResult,

    /// Script raised an error.
    #[error("{0}")]
    Script(String),

    /// Malformed message on the worker channel.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unknown_function(name: &str) -> Self {
        Self::UnknownFunction(format!("function named '{name}' does not exist"))
    }

    pub(crate) fn invalid_invocation(detail: impl std::fmt::Display) -> Self {
        Self::InvalidInvocation(format!("invalid invocation parameters: {detail}"))
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInvocation(_) => ErrorKind::InvalidInvocation,
            Self::UnknownFunction(_) => ErrorKind::UnknownFunction,
            Self::HostFunction(_) => ErrorKind::HostFunction,
            Self::HostFault(_) => ErrorKind::HostFault,
            Self::WorkerCrashed(_) | Self::WorkerDisconnected | Self::Io(_) => {
                ErrorKind::WorkerFault
            }
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NoResult => ErrorKind::NoResult,
            Self::Script(_) => ErrorKind::Script,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            kind: Some(self.kind()),
        }
    }
}

/// Serialized error slot, as carried inside resolutions, engine results and
/// worker replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }
}

impl From<&Error> for ErrorPayload {
    fn from(value: &Error) -> Self {
        value.to_payload()
    }
}

impl From<ErrorPayload> for Error {
    fn from(value: ErrorPayload) -> Self {
        let ErrorPayload { message, kind } = value;
        match kind {
            Some(ErrorKind::InvalidInvocation) => Self::InvalidInvocation(message),
            Some(ErrorKind::UnknownFunction) => Self::UnknownFunction(message),
            Some(ErrorKind::HostFunction) => Self::HostFunction(message),
            Some(ErrorKind::HostFault) => Self::HostFault(message),
            Some(ErrorKind::WorkerFault) => Self::WorkerCrashed(message),
            Some(ErrorKind::NoResult) => Self::NoResult,
            Some(ErrorKind::Protocol) => Self::Protocol(message),
            // Durations never cross the wire; keep the text.
            Some(ErrorKind::Timeout | ErrorKind::Script) | None => Self::Script(message),
        }
    }
}

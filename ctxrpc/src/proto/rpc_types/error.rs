//! Error type definitions for errors that can occur during RPC interactions.
use std::result;

use crate::proto::message::RemoteError;
use crate::tunnel::TransportationError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transportation error: {0}")]
    Transportation(#[from] TransportationError),

    /// The connection was shut down, deliberately or because the channel died.
    #[error("closed: {reason}{}", .cause.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Closed {
        reason: String,
        cause: Option<String>,
    },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The caller's abort signal fired.
    #[error("call aborted")]
    Aborted,

    /// The remote side gave up on the call.
    #[error("call cancelled by remote")]
    Cancelled,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("execution error: {0}")]
    Execution(#[from] anyhow::Error),
}

impl Error {
    pub fn closed(reason: impl Into<String>) -> Self {
        Error::Closed {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn closed_with_cause(reason: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Error::Closed {
            reason: reason.into(),
            cause: Some(cause.to_string()),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed { .. })
    }

    /// The remote error object, if this error was produced by a remote method.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

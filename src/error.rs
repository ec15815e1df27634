use std::path::PathBuf;

use thiserror::Error;

use crate::registry::ClientId;

/// Errors that may occur while starting or running the bridge.
///
/// Errors while relaying individual messages are not represented here,
/// they are contained where they happen. See [`DecodeError`] and [`SendFailure`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The configuration does not make sense.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A configuration file could not be read or parsed.
    #[error("Could not use configuration file `{path:?}`. Problem: {problem}")]
    ConfigFile {
        /// Where the file was expected.
        path: PathBuf,

        /// What went wrong.
        problem: String,
    },

    /// The websocket server could not listen on the requested address.
    #[error("Could not bind websocket server to `{addr}`. Problem: {problem}")]
    Bind {
        /// The host and port which was attempted.
        addr: String,

        /// What went wrong.
        problem: String,
    },

    /// The websocket server stopped with an error.
    #[error("Websocket server failed: {0}")]
    Server(String),

    /// Serial ports could not be enumerated.
    #[error("Could not list serial ports: {0}")]
    PortListing(String),
}

impl Error {
    /// Get the problem description if this is [`Error::BadConfig`].
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

/// A client sent something which could not be turned into a command.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("The message `{message}` could not be decoded. Problem: {problem}")]
pub struct DecodeError {
    /// The problematic message.
    pub message: String,

    /// The deserialization issue.
    pub problem: String,
}

impl DecodeError {
    pub(crate) fn new(message: &str, problem: impl ToString) -> Self {
        Self {
            message: message.to_owned(),
            problem: problem.to_string(),
        }
    }
}

/// Delivering a message to a single client failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendFailure {
    /// The client's connection is gone.
    #[error("Client {0} is closed")]
    Closed(ClientId),

    /// The client did not accept the message in time.
    #[error("Client {0} did not keep up, send timed out")]
    TimedOut(ClientId),
}

impl SendFailure {
    /// The client this failure relates to.
    pub fn client(&self) -> ClientId {
        match self {
            SendFailure::Closed(id) | SendFailure::TimedOut(id) => *id,
        }
    }
}

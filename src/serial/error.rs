use std::io;

use thiserror::Error;

/// Problems with the link to the device.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The port could not be opened (busy, missing, permission denied).
    #[error("Could not open port `{port}`. Problem: {problem}")]
    Unavailable {
        /// The port which was attempted.
        port: String,

        /// What the OS said.
        problem: String,
    },

    /// There is no open connection to a device.
    #[error("No device connected")]
    NotConnected,

    /// The device ended its stream. It will not produce anything more.
    #[error("The device closed its stream")]
    Closed,

    /// Underlying IO problem while talking to the device.
    #[error("Underlying IO problem: {0}")]
    IoFailure(#[from] io::Error),
}

impl LinkError {
    /// True for [`LinkError::NotConnected`].
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// True for [`LinkError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

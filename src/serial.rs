use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Serial port related errors.
pub mod error;

/// The link to the device, see [`link::TransportLink`].
pub mod link;

/// Codecs for encoding/decoding messages to/from wire.
pub mod codecs;

/// One line of output from the device.
///
/// The line delimiter is not included, and surrounding whitespace is trimmed.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Deserialize, Serialize)]
pub struct TelemetryLine(String);

impl TelemetryLine {
    /// Create a telemetry line from bytes, ignoring any bad utf8 bytes.
    pub fn new_lossy<B: AsRef<[u8]>>(bytes: B) -> Self {
        Self(String::from_utf8_lossy(bytes.as_ref()).trim().to_owned())
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the raw line.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// True if nothing is left after trimming.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: AsRef<str>> From<T> for TelemetryLine {
    fn from(string_like: T) -> Self {
        Self(string_like.as_ref().trim().to_owned())
    }
}

impl Display for TelemetryLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.0.chars().take(48).collect::<String>();

        write!(f, "{s}")
    }
}

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default baud rate of the device.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default host the websocket server listens on.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port the websocket server listens on.
pub const DEFAULT_WS_PORT: u16 = 8765;

/// How to find the device when no port is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// A port is picked if its description contains any of these (case insensitive).
    pub hints: Vec<String>,

    /// If nothing matches, use the first port found.
    pub fallback_to_first: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            hints: ["CH340", "CP210", "USB-SERIAL"]
                .into_iter()
                .map(String::from)
                .collect(),
            fallback_to_first: true,
        }
    }
}

/// Timing of the device to clients pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Sleep between polls when the device has nothing for us.
    pub poll_interval_ms: u64,

    /// Sleep after a device read error.
    pub error_backoff_ms: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            error_backoff_ms: 1000,
        }
    }
}

impl PumpConfig {
    /// See [`PumpConfig::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// See [`PumpConfig::error_backoff_ms`].
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// What to do when an open serial port goes away.
///
/// By default nothing is done, the bridge keeps serving clients without a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// How many times to try opening the port again. Zero disables reconnecting.
    pub attempts: u32,

    /// Wait between attempts.
    pub delay_ms: u64,
}

impl ReconnectPolicy {
    /// Will anything be attempted?
    pub fn is_enabled(&self) -> bool {
        self.attempts > 0
    }

    /// See [`ReconnectPolicy::delay_ms`].
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// The configuration used for running the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The serial port of the device.
    /// Likely "/dev/ttyUSBx" or "COMx".
    /// Auto-detected if not set.
    pub port: Option<String>,

    /// Baud rate of the serial port.
    pub baud_rate: u32,

    /// Use an in-memory loopback device instead of a serial port.
    /// Commands sent by clients come back as device lines.
    pub mock: bool,

    /// Host the websocket server listens on.
    pub host: String,

    /// Port the websocket server listens on.
    /// Zero means any free port.
    pub ws_port: u16,

    /// How the device is found if [`Config::port`] is not set.
    pub detect: DetectConfig,

    /// Device to clients timing.
    pub pump: PumpConfig,

    /// How long a broadcast may wait on a single client.
    pub send_timeout_ms: u64,

    /// How long writing a command to the device may take.
    pub write_timeout_ms: u64,

    /// See [`ReconnectPolicy`].
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            mock: false,
            host: DEFAULT_HOST.into(),
            ws_port: DEFAULT_WS_PORT,
            detect: DetectConfig::default(),
            pump: PumpConfig::default(),
            send_timeout_ms: 1000,
            write_timeout_ms: 1000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Fields left out get their default values.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            port: Some("/dev/ttyUSB0".into()),
            reconnect: ReconnectPolicy {
                attempts: 5,
                delay_ms: 3000,
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();

        let s = std::fs::read_to_string(path).map_err(|e| Error::ConfigFile {
            path: path.into(),
            problem: e.to_string(),
        })?;

        Self::deserialize(&s).map_err(|e| Error::ConfigFile {
            path: path.into(),
            problem: e.to_string(),
        })
    }

    /// Where the websocket server listens, as `host:port`.
    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }

    /// See [`Config::send_timeout_ms`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// See [`Config::write_timeout_ms`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn check_port(&self) -> Result<(), Error> {
        match &self.port {
            Some(port) if port.trim().is_empty() => Err(Error::BadConfig(
                "The serial port is set but empty. Leave it out to auto-detect.".into(),
            )),
            Some(port) if self.mock => Err(Error::BadConfig(format!(
                "Both a serial port (`{port}`) and the mock device were requested, please pick one."
            ))),
            _ => Ok(()),
        }
    }

    fn check_nonzero(&self) -> Result<(), Error> {
        let checks = [
            ("baud_rate", u64::from(self.baud_rate)),
            ("pump.poll_interval_ms", self.pump.poll_interval_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(Error::BadConfig(format!("`{name}` must be larger than zero.")));
            }
        }

        Ok(())
    }

    fn check_host(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            Err(Error::BadConfig("The websocket host is empty.".into()))
        } else {
            Ok(())
        }
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_port()?;
        self.check_nonzero()?;
        self.check_host()?;

        Ok(())
    }
}

use std::{fmt::Display, io};

use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;

use crate::{error::DecodeError, serial::TelemetryLine};

/// The value a command carries to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    /// Any JSON number, forwarded with the precision it arrived with.
    Number(serde_json::Number),

    /// A string value.
    Text(String),
}

impl Default for CommandValue {
    fn default() -> Self {
        Self::Number(0.into())
    }
}

impl Display for CommandValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandValue::Number(n) => write!(f, "{n}"),
            CommandValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for CommandValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(Self::Number)
            .unwrap_or_default()
    }
}

impl From<i64> for CommandValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for CommandValue {
    fn from(value: &str) -> Self {
        Self::Text(value.into())
    }
}

/// What clients send us.
///
/// Both name fields are optional, `command` wins over `sensor`.
#[derive(Debug, Deserialize)]
struct InboundMessage {
    command: Option<String>,
    sensor: Option<String>,
    value: Option<CommandValue>,
}

/// A command for the device, addressing some sensor or actuator by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The target. Empty if the client did not name one.
    pub name: String,

    /// The value to set.
    pub value: CommandValue,
}

/// The shape a [`Command`] has on the wire towards the device.
#[derive(Serialize)]
struct DeviceCommand<'a> {
    sensor: &'a str,
    value: &'a CommandValue,
}

impl Command {
    /// Create a command.
    pub fn new(name: &str, value: impl Into<CommandValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Decode a client payload.
    ///
    /// The payload must be a JSON object.
    /// The name is taken from `command`, falling back to `sensor`, falling back to empty.
    /// The value defaults to zero.
    pub fn parse(payload: &str) -> Result<Self, DecodeError> {
        let json: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| DecodeError::new(payload, e))?;

        if !json.is_object() {
            return Err(DecodeError::new(payload, "expected a JSON object"));
        }

        let InboundMessage {
            command,
            sensor,
            value,
        } = serde_json::from_value(json).map_err(|e| DecodeError::new(payload, e))?;

        Ok(Self {
            name: command.or(sensor).unwrap_or_default(),
            value: value.unwrap_or_default(),
        })
    }

    /// The line to put on the wire, without the trailing newline.
    ///
    /// Looks like `{"sensor": "temp", "value": 23.5}`.
    pub fn to_device_line(&self) -> Result<String, serde_json::Error> {
        let mut out = Vec::with_capacity(32 + self.name.len());
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);

        DeviceCommand {
            sensor: &self.name,
            value: &self.value,
        }
        .serialize(&mut serializer)?;

        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// An example command, as a client would send it.
    pub fn example_request() -> String {
        r#"{"sensor": "temp", "value": 23.5}"#.into()
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

/// Compact JSON, except with a space after `:` and `,`.
/// Anything outside ASCII is written as `\uXXXX` escapes, so the device only ever sees ASCII.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }

        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }

        Ok(())
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Messages the bridge sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEnvelope {
    /// A line the device produced.
    Serial {
        /// The raw line.
        data: String,
    },
}

impl OutboundEnvelope {
    /// Wrap a device line.
    pub fn serial(line: TelemetryLine) -> Self {
        Self::Serial {
            data: line.into_inner(),
        }
    }

    /// Serialize for the websocket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// An example envelope.
    pub fn example() -> Self {
        Self::serial("LCD:Temp=23C".into())
    }
}

impl Display for OutboundEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboundEnvelope::Serial { data } => write!(f, "serial: {data}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sensor_field_is_used() {
        let command = Command::parse(r#"{"sensor":"temp","value":23.5}"#).unwrap();

        assert_eq!(command, Command::new("temp", 23.5));
    }

    #[test]
    fn command_field_wins_over_sensor() {
        let command = Command::parse(r#"{"command":"fan","sensor":"temp","value":1}"#).unwrap();

        assert_eq!(command.name, "fan");
        assert_eq!(command.value, CommandValue::from(1i64));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let command = Command::parse("{}").unwrap();

        assert_eq!(command.name, "");
        assert_eq!(command.value, CommandValue::default());
        assert_eq!(
            command.to_device_line().unwrap(),
            r#"{"sensor": "", "value": 0}"#
        );
    }

    #[test]
    fn string_values_are_kept() {
        let command = Command::parse(r#"{"command":"pump","value":"on"}"#).unwrap();

        assert_eq!(command.value, CommandValue::Text("on".into()));
        assert_eq!(
            command.to_device_line().unwrap(),
            r#"{"sensor": "pump", "value": "on"}"#
        );
    }

    #[test]
    fn device_line_is_spaced_json() {
        let command = Command::parse(r#"{"sensor":"temp","value":23.5}"#).unwrap();

        assert_eq!(
            command.to_device_line().unwrap(),
            r#"{"sensor": "temp", "value": 23.5}"#
        );
    }

    #[test]
    fn device_line_is_ascii() {
        let command = Command::parse(r#"{"sensor":"température","value":"🌱"}"#).unwrap();
        let line = command.to_device_line().unwrap();

        assert_eq!(
            line,
            r#"{"sensor": "temp\u00e9rature", "value": "\ud83c\udf31"}"#
        );

        // Still the same command once decoded
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["sensor"], "température");
        assert_eq!(json["value"], "🌱");
    }

    #[test]
    fn device_line_has_exactly_two_keys() {
        let command = Command::parse(r#"{"sensor":"soil","value":-3,"extra":true}"#).unwrap();
        let line = command.to_device_line().unwrap();

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object.len(), 2);
        assert_eq!(object["sensor"], "soil");
        assert_eq!(object["value"], -3);
    }

    #[test]
    fn not_json_is_a_decode_error() {
        let err = Command::parse("not json").unwrap_err();

        assert_eq!(err.message, "not json");
    }

    #[test]
    fn non_object_is_a_decode_error() {
        assert!(Command::parse("[\"temp\", 1]").is_err());
        assert!(Command::parse("42").is_err());
    }

    #[test]
    fn unsupported_value_is_a_decode_error() {
        assert!(Command::parse(r#"{"sensor":"temp","value":{"nested":1}}"#).is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = OutboundEnvelope::serial("LCD:Temp=23C".into());

        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"type":"serial","data":"LCD:Temp=23C"}"#
        );
    }
}

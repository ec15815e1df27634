//! A mock, useful to test the bridge without an actual serial device.
//!
//! The mock is one end of an in-memory byte stream.
//! The other end is attached to a [`crate::serial::link::TransportLink`] as if it was a serial port.

use std::io;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Buffer size of the in-memory stream.
const MOCK_BUFFER: usize = 64 * 1024;

/// The device side of an in-memory link.
#[derive(Debug)]
pub struct MockDevice {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockDevice {
    /// Create a mock device and the stream to attach to a link.
    pub fn pair() -> (Self, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(MOCK_BUFFER);
        let (reader, writer) = tokio::io::split(ours);

        (
            Self {
                reader: BufReader::new(reader),
                writer,
            },
            theirs,
        )
    }

    /// Wait for the next line written to the device.
    /// The newline is stripped.
    ///
    /// Returns `None` when the link closed its end.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();

        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_owned()))
    }

    /// Output a line, as if the device printed it.
    pub async fn emit_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Output raw bytes.
    pub async fn emit_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Turn this mock into a loopback device.
    ///
    /// Every line written to the device is printed back by the device.
    /// This emulates a per-line loopback on a serial port.
    pub fn spawn_loopback(mut self) -> JoinHandle<()> {
        info!("Running loopback mock device");

        tokio::spawn(
            async move {
                loop {
                    match self.next_line().await {
                        Ok(Some(line)) => {
                            trace!(%line, "Loopback");
                            if let Err(e) = self.emit_line(&line).await {
                                warn!(?e, "Loopback could not echo");
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("Link closed the loopback");
                            break;
                        }
                        Err(e) => {
                            warn!(?e, "Loopback read error");
                            break;
                        }
                    }
                }
            }
            .instrument(info_span!("mock-device")),
        )
    }
}

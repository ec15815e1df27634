use std::{fmt::Display, io, time::Duration};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    actions::Command,
    serial::{codecs::lines::LinesCodec, error::LinkError, TelemetryLine},
};

/// How many device lines may wait for the pump before reading the device pauses.
const LINE_QUEUE_DEPTH: usize = 1024;

/// Default pause before reading again after a read error.
const READ_RETRY: Duration = Duration::from_secs(1);

/// Anything which can act as the device end of a link.
///
/// Serial ports, but also in-memory streams for mocking.
pub trait Device: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Device for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type DeviceLines = FramedRead<ReadHalf<Box<dyn Device>>, LinesCodec>;
type DeviceSink = FramedWrite<WriteHalf<Box<dyn Device>>, LinesCodec>;

/// Whether the link has a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No device.
    Disconnected,

    /// A device is open.
    Connected,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

struct DeviceWriter {
    name: String,
    sink: DeviceSink,
}

struct DeviceReader {
    lines: mpsc::Receiver<Result<TelemetryLine, LinkError>>,
    task: JoinHandle<()>,
}

impl Drop for DeviceReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The connection to the device.
///
/// Holds at most one open device at a time.
/// Reading and writing never wait on each other:
/// a background task drains the device into a queue which [`TransportLink::try_read_line`] polls.
///
/// The state only changes through [`TransportLink::connect`], [`TransportLink::attach`]
/// and [`TransportLink::disconnect`]. Read errors leave the device in place.
pub struct TransportLink {
    state: watch::Sender<LinkState>,
    writer: Mutex<Option<DeviceWriter>>,
    reader: Mutex<Option<DeviceReader>>,
    write_timeout: Duration,
    read_retry: Duration,
}

async fn read_device(
    device: ReadHalf<Box<dyn Device>>,
    queue: mpsc::Sender<Result<TelemetryLine, LinkError>>,
    read_retry: Duration,
) {
    let mut lines: DeviceLines = FramedRead::new(device, LinesCodec::default());

    loop {
        let Some(line) = lines.next().await else {
            debug!("Device stream ended");
            // Nobody may be listening anymore, that is fine
            let _ = queue.send(Err(LinkError::Closed)).await;
            return;
        };

        let failed = line.is_err();

        if let Ok(line) = &line {
            trace!("Line from device: `{line}`");
        }

        if queue.send(line).await.is_err() {
            debug!("Link dropped the reader");
            return;
        }

        if failed {
            tokio::time::sleep(read_retry).await;

            // Framing stops after an error, the device does not.
            // Start over on the same stream.
            lines = FramedRead::new(lines.into_inner(), LinesCodec::default());
            debug!("Reading again after error");
        }
    }
}

impl TransportLink {
    /// A link without a device.
    /// Writes which take longer than `write_timeout` fail.
    pub fn new(write_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);

        Self {
            state,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            write_timeout,
            read_retry: READ_RETRY,
        }
    }

    /// How long the reader pauses after a read error before reading again.
    pub fn with_read_retry(mut self, read_retry: Duration) -> Self {
        self.read_retry = read_retry;
        self
    }

    /// Open the serial port at `port` (likely `/dev/ttyUSBx` or `COMx`) and use it as the device.
    ///
    /// Any previously open device is closed first.
    /// There is no retrying, an unavailable port is an error.
    pub async fn connect(&self, port: &str, baud: u32) -> Result<(), LinkError> {
        // The old handle must be gone before the port is opened again
        self.disconnect().await;

        info!(%port, %baud, "Opening serial port");

        let serial_stream = tokio_serial::new(port, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::Unavailable {
                port: port.into(),
                problem: e.to_string(),
            })?;

        self.attach(port, serial_stream).await;

        Ok(())
    }

    /// Use `device` as the device end of this link.
    ///
    /// Any previously open device is closed first.
    pub async fn attach<D: Device>(&self, name: &str, device: D) {
        self.disconnect().await;

        let device: Box<dyn Device> = Box::new(device);
        let (read_half, write_half) = tokio::io::split(device);
        let sink = FramedWrite::new(write_half, LinesCodec::default());

        let (queue, lines) = mpsc::channel(LINE_QUEUE_DEPTH);
        let task = tokio::spawn(
            read_device(read_half, queue, self.read_retry).instrument(info_span!("device", %name)),
        );

        *self.reader.lock().await = Some(DeviceReader { lines, task });
        *self.writer.lock().await = Some(DeviceWriter {
            name: name.into(),
            sink,
        });

        self.state.send_replace(LinkState::Connected);
        info!(%name, "Device connected");
    }

    /// Close the device, if any.
    pub async fn disconnect(&self) {
        let reader = self.reader.lock().await.take();
        drop(reader);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.sink.close().await {
                debug!(?e, name = %writer.name, "Problem closing device");
            }
            info!(name = %writer.name, "Device disconnected");
        }

        self.state.send_replace(LinkState::Disconnected);
    }

    /// Is a device open?
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// The current state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// The name of the open device, if any.
    pub async fn device_name(&self) -> Option<String> {
        self.writer
            .lock()
            .await
            .as_ref()
            .map(|writer| writer.name.clone())
    }

    /// Send a command to the device as a single JSON line.
    pub async fn write_line(&self, command: &Command) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let line = command
            .to_device_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(LinkError::NotConnected)?;

        match tokio::time::timeout(self.write_timeout, writer.sink.send(line)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::IoFailure(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write to {} did not finish in time", writer.name),
            ))),
        }
    }

    /// Get the next buffered line from the device, without waiting.
    ///
    /// Returns `Ok(None)` if no complete line is available.
    /// A read error is returned as [`LinkError::IoFailure`] and reading carries on.
    ///
    /// A device which ended its stream is reported once as [`LinkError::Closed`].
    /// The link stays connected until [`TransportLink::disconnect`] releases it.
    pub fn try_read_line(&self) -> Result<Option<TelemetryLine>, LinkError> {
        // There is a single reader, contention means someone is (dis)connecting.
        let Ok(mut reader) = self.reader.try_lock() else {
            return Ok(None);
        };

        let Some(device) = reader.as_mut() else {
            return Ok(None);
        };

        match device.lines.try_recv() {
            Ok(Ok(line)) => Ok(Some(line)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Ok(Err(LinkError::Closed)) | Err(mpsc::error::TryRecvError::Disconnected) => {
                warn!("Device closed its stream");
                *reader = None;
                Err(LinkError::Closed)
            }
            Ok(Err(e)) => {
                debug!(%e, "Device read error");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("state", &self.state())
            .field("write_timeout", &self.write_timeout)
            .field("read_retry", &self.read_retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Instant,
    };

    use tokio::io::{DuplexStream, ReadBuf};

    use super::*;
    use crate::mock::MockDevice;

    fn link() -> TransportLink {
        TransportLink::new(Duration::from_secs(1)).with_read_retry(Duration::from_millis(10))
    }

    /// A device stream whose first read fails.
    struct Glitchy {
        inner: DuplexStream,
        glitched: bool,
    }

    impl AsyncRead for Glitchy {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.glitched {
                self.glitched = true;
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "glitch")));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Glitchy {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    async fn read_eventually(link: &TransportLink) -> Result<TelemetryLine, LinkError> {
        let start = Instant::now();
        loop {
            if let Some(line) = link.try_read_line()? {
                return Ok(line);
            }
            assert!(start.elapsed() < Duration::from_secs(5), "No line arrived");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn write_without_device_is_not_connected() {
        let link = link();

        assert!(!link.is_connected());

        let result = link.write_line(&Command::new("temp", 1i64)).await;
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn read_without_device_is_none() {
        assert!(link().try_read_line().unwrap().is_none());
    }

    #[tokio::test]
    async fn connecting_to_missing_port_is_unavailable() {
        let link = link();

        let result = link.connect("/dev/this-port-does-not-exist", 115_200).await;

        assert!(matches!(result, Err(LinkError::Unavailable { .. })));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn write_puts_json_line_on_wire() {
        let link = link();
        let (mut device, stream) = MockDevice::pair();
        link.attach("mock", stream).await;

        assert!(link.is_connected());
        assert_eq!(link.device_name().await.as_deref(), Some("mock"));

        link.write_line(&Command::new("temp", 23.5)).await.unwrap();

        assert_eq!(
            device.next_line().await.unwrap().as_deref(),
            Some(r#"{"sensor": "temp", "value": 23.5}"#)
        );
    }

    #[tokio::test]
    async fn lines_from_device_are_read() {
        let link = link();
        let (mut device, stream) = MockDevice::pair();
        link.attach("mock", stream).await;

        assert!(link.try_read_line().unwrap().is_none());

        device.emit_raw(b"\r\nLCD:Temp=23C\r\n\n\xffx\n").await.unwrap();

        assert_eq!(read_eventually(&link).await.unwrap().as_str(), "LCD:Temp=23C");
        assert_eq!(read_eventually(&link).await.unwrap().as_str(), "\u{fffd}x");
    }

    #[tokio::test]
    async fn read_error_is_transient() {
        let link = link();
        let (mut device, stream) = MockDevice::pair();
        link.attach(
            "glitchy",
            Glitchy {
                inner: stream,
                glitched: false,
            },
        )
        .await;

        let result = read_eventually(&link).await;
        assert!(matches!(result, Err(LinkError::IoFailure(_))));
        assert!(link.is_connected());

        device.emit_line("hello").await.unwrap();
        assert_eq!(read_eventually(&link).await.unwrap().as_str(), "hello");

        link.write_line(&Command::new("temp", 1i64)).await.unwrap();
        assert_eq!(
            device.next_line().await.unwrap().as_deref(),
            Some(r#"{"sensor": "temp", "value": 1}"#)
        );
    }

    #[tokio::test]
    async fn closed_device_is_reported_once() {
        let link = link();
        let (device, stream) = MockDevice::pair();
        link.attach("mock", stream).await;

        let mut state = link.subscribe();
        drop(device);

        let result = read_eventually(&link).await;
        assert!(matches!(result, Err(LinkError::Closed)));

        // Reported once, then quiet
        assert!(link.try_read_line().unwrap().is_none());

        // Released as a whole
        link.disconnect().await;
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), LinkState::Disconnected);
        assert_eq!(link.device_name().await, None);

        let result = link.write_line(&Command::new("temp", 1i64)).await;
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn attach_replaces_previous_device() {
        let link = link();
        let (mut first, stream) = MockDevice::pair();
        link.attach("first", stream).await;

        let (mut second, stream) = MockDevice::pair();
        link.attach("second", stream).await;

        link.write_line(&Command::new("fan", "on")).await.unwrap();

        assert_eq!(
            second.next_line().await.unwrap().as_deref(),
            Some(r#"{"sensor": "fan", "value": "on"}"#)
        );
        // The first device was closed
        assert_eq!(first.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let link = link();
        let (_device, stream) = MockDevice::pair();
        link.attach("mock", stream).await;

        link.disconnect().await;
        link.disconnect().await;

        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.device_name().await, None);
    }
}

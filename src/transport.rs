// src/transport.rs - Byte-level serial transport for roof controller frames
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ProtocolError, RoofError, TransportError};
use crate::protocol::frame::{Frame, FrameScanner, ScanStatus};

/// Default wait for each individual inbound byte.
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_secs(3);

/// The byte pipe to the controller. Implemented for the real serial port,
/// for any tokio stream, and by the simulated controller.
#[async_trait]
pub trait ByteChannel: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Drops anything pending in either direction.
    async fn discard_buffers(&mut self) -> io::Result<()>;
}

/// A serial device opened with serial2-tokio.
#[derive(Debug)]
pub struct SerialChannel {
    port: SerialPort,
}

impl SerialChannel {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        tracing::info!("Connecting to roof controller on {} at {} baud", port_name, baud_rate);
        let port = SerialPort::open(port_name, baud_rate)?;
        Ok(Self { port })
    }
}

#[async_trait]
impl ByteChannel for SerialChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf).await
    }

    async fn discard_buffers(&mut self) -> io::Result<()> {
        self.port.discard_buffers()
    }
}

/// Adapts any tokio byte stream. Pending input cannot be discarded through
/// the generic traits, so only the output side is flushed.
#[derive(Debug)]
pub struct IoChannel<T> {
    inner: T,
}

impl<T> IoChannel<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T> ByteChannel for IoChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await
    }

    async fn discard_buffers(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed: u64,
    pub timeouts: u64,
    pub errors: u64,
}

/// Sole reader and writer of the controller channel.
pub struct Transport<C> {
    channel: C,
    byte_timeout: Duration,
    stats: TransportStats,
}

impl<C: ByteChannel> Transport<C> {
    pub fn new(channel: C) -> Self {
        Self::with_byte_timeout(channel, DEFAULT_BYTE_TIMEOUT)
    }

    pub fn with_byte_timeout(channel: C, byte_timeout: Duration) -> Self {
        Self {
            channel,
            byte_timeout,
            stats: TransportStats::default(),
        }
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Discards anything pending on the line, then writes one frame. The
    /// outbound length cap is enforced when the [`Frame`] is encoded.
    pub async fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        tracing::debug!("roof <- {}", frame);
        let result = async {
            self.channel.discard_buffers().await?;
            self.channel.write_all(frame.as_bytes()).await
        }
        .await;
        match result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::warn!("Roof control connection error on write: {}", e);
                Err(TransportError::Io(e))
            }
        }
    }

    /// Reads one frame a byte at a time, each byte under its own deadline.
    /// Gives up as soon as the scanner recognises the input as malformed.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, RoofError> {
        let mut scanner = FrameScanner::new();
        loop {
            let byte = self.read_byte().await?;
            match scanner.push(byte) {
                ScanStatus::Incomplete => continue,
                ScanStatus::Complete => {
                    self.stats.frames_received += 1;
                    tracing::debug!("roof -> {}", scanner.raw());
                    return Ok(scanner.frame().to_vec());
                }
                ScanStatus::Malformed => {
                    self.stats.malformed += 1;
                    let raw = scanner.raw();
                    tracing::error!("Received communication protocol not valid {:?}", raw);
                    return Err(ProtocolError::Malformed { raw }.into());
                }
            }
        }
    }

    async fn read_byte(&mut self) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        match timeout(self.byte_timeout, self.channel.read(&mut byte)).await {
            Err(_) => {
                self.stats.timeouts += 1;
                tracing::warn!("Roof control connection timed out after {:?}", self.byte_timeout);
                Err(TransportError::Timeout(self.byte_timeout))
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                tracing::warn!("Roof control connection error: {}", e);
                Err(TransportError::Io(e))
            }
            Ok(Ok(0)) => {
                self.stats.errors += 1;
                tracing::warn!("Roof control connection closed by remote");
                Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into()))
            }
            Ok(Ok(_)) => {
                self.stats.bytes_received += 1;
                Ok(byte[0])
            }
        }
    }
}

impl<C> std::fmt::Debug for Transport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("byte_timeout", &self.byte_timeout)
            .field("stats", &self.stats)
            .finish()
    }
}

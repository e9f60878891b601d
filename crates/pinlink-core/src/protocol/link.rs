//! Exclusively owned duplex byte transport

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Command, Frame, MessageFramer, ProtocolError, READ_CHUNK_SIZE, TERMINATOR};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Render bytes as ` 0x..` pairs for debug logs
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!(" 0x{:02x}", b)).collect()
}

/// A serial (or test) stream split into halves, with the framer that reads it
///
/// Handshake and discovery drive the link directly; once the communicator
/// starts, the halves move into its send and receive tasks.
pub struct Link {
    port: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    framer: MessageFramer,
    debug: bool,
}

impl Link {
    /// Wrap any duplex stream
    pub fn new<S>(port: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            port: port.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
            framer: MessageFramer::new(),
            debug: false,
        }
    }

    /// Port name this link was opened on
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Log raw bytes of every read
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Write bytes verbatim and flush
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Write one message followed by the terminator
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(TERMINATOR);
        self.write_raw(&buf).await
    }

    /// Write a protocol command
    pub async fn send_command(&mut self, command: &Command) -> Result<(), ProtocolError> {
        let wire = command.to_wire();
        debug!(port = %self.port, "Send: {}", wire);
        self.write_line(&wire).await
    }

    /// Read until one complete frame is available
    pub async fn read_frame(&mut self) -> Result<Frame, ProtocolError> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Ok(frame);
            }

            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(ProtocolError::LinkClosed(self.port.clone()));
            }
            if self.debug {
                debug!(port = %self.port, "Received:{}", hex_dump(&buf[..n]));
            }
            self.framer.push(&buf[..n]);
        }
    }

    /// Read one frame, or `None` if nothing complete arrives within `timeout`
    pub async fn read_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Frame>, ProtocolError> {
        match tokio::time::timeout(timeout, self.read_frame()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Forget any buffered partial input
    pub fn discard_input(&mut self) {
        self.framer.clear();
    }

    pub(crate) fn into_parts(self) -> (String, BoxedReader, MessageFramer, BoxedWriter) {
        (self.port, self.reader, self.framer, self.writer)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("port", &self.port)
            .field("pending", &self.framer.pending())
            .finish()
    }
}

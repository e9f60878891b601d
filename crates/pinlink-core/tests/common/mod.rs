//! Scripted board on the far side of an in-memory duplex stream

#![allow(dead_code)]

use pinlink_core::config::{PlatformConfig, TimingConfig};
use pinlink_core::platform::{HardwarePlatform, IoBoard};
use pinlink_core::protocol::Processor;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};

/// How long a test waits for something that should happen
pub const PATIENCE: Duration = Duration::from_secs(2);

/// Timing with all settle delays removed and short reply timeouts
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        flow_stall_ms: 1000,
        id_reply_ms: 200,
        id_retry_ms: 10,
        open_retry_ms: 10,
        reset_timeout_ms: 500,
        configure_timeout_ms: 500,
        reply_timeout_ms: 500,
        settle_ms: 0,
        switch_settle_ms: 0,
    }
}

pub fn fast_config() -> PlatformConfig {
    PlatformConfig {
        timing: fast_timing(),
        ..Default::default()
    }
}

/// Host stream and the board end of it
pub fn wire() -> (DuplexStream, FakeBoard) {
    let (host, board) = tokio::io::duplex(8192);
    (host, FakeBoard::new(board))
}

pub struct FakeBoard {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeBoard {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next command from the host, skipping the wake sequence
    pub async fn command(&mut self) -> String {
        loop {
            let mut line = Vec::new();
            let n = self.reader.read_until(b'\r', &mut line).await.unwrap();
            assert!(n > 0, "host closed the link");
            line.pop();
            let text = String::from_utf8(line).unwrap();
            if !text.trim().is_empty() {
                return text;
            }
        }
    }

    /// Next command, or `None` if the host stays quiet for `wait`
    pub async fn command_within(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.command()).await.ok()
    }

    /// Exactly `len` unterminated bytes from the host
    pub async fn raw_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(PATIENCE, self.reader.read_exact(&mut buf))
            .await
            .expect("timed out waiting for raw bytes")
            .unwrap();
        buf
    }

    /// Whether the host closes its end of the link
    pub async fn sees_eof(&mut self) -> bool {
        let mut rest = Vec::new();
        matches!(
            tokio::time::timeout(PATIENCE, self.reader.read_to_end(&mut rest)).await,
            Ok(Ok(_))
        )
    }

    pub async fn expect(&mut self, expected: &str) {
        let got = tokio::time::timeout(PATIENCE, self.command())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {expected}"));
        assert_eq!(got, expected);
    }

    pub async fn reply(&mut self, message: &str) {
        self.writer.write_all(message.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Answer the handshake
    pub async fn identify_as(&mut self, id_reply: &str) {
        self.expect("ID:").await;
        self.reply(id_reply).await;
    }

    /// Answer reset, configuration and the switch snapshot of a modern NET CPU
    pub async fn boot_net(&mut self, hardware_key: &str) {
        self.expect("BR:").await;
        self.reply("BR:P").await;
        self.expect(&format!("CH:{hardware_key},FF")).await;
        self.reply("CH:P").await;
        self.expect("SA:").await;
        self.reply("SA:0E,2900000000000000").await;
    }
}

/// Platform capturing everything the protocol layer reports
pub struct Recorder {
    pub window: usize,
    pub boards: Mutex<Vec<IoBoard>>,
    pub messages: Mutex<Vec<(Processor, String)>>,
}

impl Recorder {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            boards: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn boards(&self) -> Vec<IoBoard> {
        self.boards.lock().unwrap().clone()
    }
}

impl HardwarePlatform for Recorder {
    fn register_io_board(&self, board: IoBoard) {
        self.boards.lock().unwrap().push(board);
    }

    fn process_received_message(&self, processor: Processor, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((processor, message.to_string()));
    }

    fn debug_enabled(&self) -> bool {
        true
    }

    fn buffer_size(&self, _processor: Processor) -> usize {
        self.window
    }
}

/// Poll `check` until it holds or patience runs out
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

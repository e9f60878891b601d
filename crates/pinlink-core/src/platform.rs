//! Platform adapter
//!
//! The protocol layer only sees the [`HardwarePlatform`] capability: board
//! registration, message dispatch, the debug flag and per-class window sizes.
//! [`PlatformAdapter`] is the owner side: it connects every configured port,
//! keeps one communicator per processor, holds the board inventory and hands
//! received messages to the device layer over a channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::PlatformConfig;
use crate::protocol::{
    Communicator, Connector, FirmwareVersion, Identification, LinkState, Processor, ProtocolError,
};

/// Peripheral IO board found on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoBoard {
    /// Node id on the bus
    pub node_id: u8,
    /// Board model
    pub model: String,
    /// Firmware version
    pub firmware: FirmwareVersion,
    /// Number of switch inputs
    pub switch_count: u32,
    /// Number of driver outputs
    pub driver_count: u32,
}

/// What the protocol layer needs from the platform that owns it
pub trait HardwarePlatform: Send + Sync {
    /// Append a discovered board to the inventory
    fn register_io_board(&self, board: IoBoard);

    /// Hand a decoded message to the device layer
    fn process_received_message(&self, processor: Processor, message: &str);

    /// Log raw traffic
    fn debug_enabled(&self) -> bool;

    /// In-flight window for a processor class (0 disables flow control)
    fn buffer_size(&self, processor: Processor) -> usize;
}

/// A message received from a processor, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub processor: Processor,
    pub message: String,
}

struct PlatformState {
    config: PlatformConfig,
    boards: Mutex<Vec<IoBoard>>,
    messages: mpsc::UnboundedSender<ReceivedMessage>,
}

impl HardwarePlatform for PlatformState {
    fn register_io_board(&self, board: IoBoard) {
        info!(
            "IO board {:02X}: model {}, firmware {}, switches {}, drivers {}",
            board.node_id, board.model, board.firmware, board.switch_count, board.driver_count
        );
        self.boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(board);
    }

    fn process_received_message(&self, processor: Processor, message: &str) {
        let received = ReceivedMessage {
            processor,
            message: message.to_string(),
        };
        if self.messages.send(received).is_err() {
            debug!("No consumer for {} message: {}", processor, message);
        }
    }

    fn debug_enabled(&self) -> bool {
        self.config.debug
    }

    fn buffer_size(&self, processor: Processor) -> usize {
        self.config.buffer_size(processor)
    }
}

/// Owns every link of the serial platform
pub struct PlatformAdapter {
    state: Arc<PlatformState>,
    connections: BTreeMap<Processor, Communicator>,
}

impl PlatformAdapter {
    /// Create an adapter; the receiver yields every dispatched message
    pub fn new(config: PlatformConfig) -> (Self, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(PlatformState {
            config,
            boards: Mutex::new(Vec::new()),
            messages: tx,
        });
        (
            Self {
                state,
                connections: BTreeMap::new(),
            },
            rx,
        )
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.state.config
    }

    fn platform(&self) -> Arc<dyn HardwarePlatform> {
        self.state.clone()
    }

    /// Connect every configured port
    pub async fn connect_all(&mut self) -> Result<Vec<Processor>, ProtocolError> {
        let mut processors = Vec::new();
        for port in self.state.config.ports.clone() {
            processors.push(self.connect(&port).await?);
        }
        Ok(processors)
    }

    /// Open, identify, initialise and start one serial port
    pub async fn connect(&mut self, port: &str) -> Result<Processor, ProtocolError> {
        let communicator = Connector::new(port, &self.state.config)
            .connect(self.platform())
            .await?;
        self.register(communicator).await
    }

    /// Same as [`connect`](Self::connect) over an already open stream
    pub async fn connect_stream<S>(&mut self, port: &str, stream: S) -> Result<Processor, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let communicator = Connector::new(port, &self.state.config)
            .connect_stream(stream, self.platform())
            .await?;
        self.register(communicator).await
    }

    async fn register(&mut self, mut communicator: Communicator) -> Result<Processor, ProtocolError> {
        let processor = communicator.processor();
        if self.connections.contains_key(&processor) {
            communicator.stop();
            return Err(ProtocolError::InvalidState(format!(
                "{} is already connected",
                processor
            )));
        }

        communicator.init().await?;
        communicator.start()?;
        self.connections.insert(processor, communicator);
        Ok(processor)
    }

    /// Queue a command for a processor
    pub fn send(&self, processor: Processor, message: &str) -> Result<(), ProtocolError> {
        self.connections
            .get(&processor)
            .ok_or_else(|| ProtocolError::InvalidState(format!("No {} connection", processor)))?
            .send(message)
    }

    /// Queue a raw bitmap frame for the DMD
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.connections
            .get(&Processor::Dmd)
            .ok_or_else(|| ProtocolError::InvalidState("No DMD connection".to_string()))?
            .send_frame(frame)
    }

    pub fn communicator(&self, processor: Processor) -> Option<&Communicator> {
        self.connections.get(&processor)
    }

    /// Identification of a connected processor (model and firmware)
    pub fn identification(&self, processor: Processor) -> Option<&Identification> {
        self.connections.get(&processor).map(|c| c.identification())
    }

    pub fn link_state(&self, processor: Processor) -> LinkState {
        self.connections
            .get(&processor)
            .map(|c| c.state())
            .unwrap_or(LinkState::Disconnected)
    }

    /// Board inventory in discovery order
    pub fn boards(&self) -> Vec<IoBoard> {
        self.state
            .boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve when any link terminates, with its processor and failure reason
    pub async fn wait_for_link_loss(&self) -> Option<(Processor, Option<String>)> {
        let mut waits = JoinSet::new();
        for (processor, communicator) in &self.connections {
            let processor = *processor;
            let termination = communicator.termination();
            waits.spawn(async move { (processor, termination.wait().await) });
        }

        let lost = waits.join_next().await?.ok()?;
        if let Some(reason) = &lost.1 {
            error!("{} link lost: {}", lost.0, reason);
        }
        Some(lost)
    }

    /// Stop every link
    pub fn stop(&mut self) {
        for communicator in self.connections.values() {
            communicator.stop();
        }
    }
}

impl Drop for PlatformAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Protocol communicator
//!
//! Owns a link after the handshake. Handshake-time work (firmware check and
//! discovery) drives the link directly; [`Communicator::start`] then moves the
//! link halves into two tasks:
//!
//! - the send task drains the outbound queue in FIFO order, waiting on the
//!   flow-control gate before each write and resetting the window if the gate
//!   stays closed longer than the stall timeout;
//! - the receive task frames incoming bytes, counts replies back against the
//!   window, drops noise replies and dispatches everything else to the
//!   platform.
//!
//! Either task failing stops the whole link.

use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{is_chatty, is_noise, is_uncounted};
use super::link::{hex_dump, BoxedReader, BoxedWriter};
use super::{
    CommunicatorKind, Discovery, FlowWindow, Frame, Identification, Link, LinkProfile,
    MessageFramer, Processor, ProtocolError, READ_CHUNK_SIZE, TERMINATOR,
};
use crate::config::TimingConfig;
use crate::platform::{HardwarePlatform, IoBoard};

/// Lifecycle of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link open
    Disconnected,
    /// Handshake complete, nothing else done
    Identified,
    /// Firmware check and discovery in progress or done
    Configuring,
    /// Send and receive tasks running
    Operational,
    /// Terminal; the transport is closed
    Stopped,
}

/// Prefix of a DMD bitmap frame
pub const DMD_FRAME_PREFIX: &[u8] = b"BM:";

/// How a message is put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Text command followed by the terminator
    Line,
    /// `BM:` followed by raw bitmap bytes, no terminator
    DmdFrame,
}

/// One queued outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    payload: Bytes,
    counted: bool,
    framing: Framing,
}

impl PendingMessage {
    /// A command the board acknowledges
    pub fn counted(message: &str) -> Self {
        Self {
            payload: Bytes::copy_from_slice(message.as_bytes()),
            counted: true,
            framing: Framing::Line,
        }
    }

    /// Traffic the board never answers
    pub fn uncounted(message: &str) -> Self {
        Self {
            payload: Bytes::copy_from_slice(message.as_bytes()),
            counted: false,
            framing: Framing::Line,
        }
    }

    /// A DMD bitmap frame; never counted against the window
    pub fn dmd_frame(frame: &[u8]) -> Self {
        Self {
            payload: Bytes::copy_from_slice(frame),
            counted: false,
            framing: Framing::DmdFrame,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_counted(&self) -> bool {
        self.counted
    }

    fn wire(&self) -> Vec<u8> {
        match self.framing {
            Framing::Line => {
                let mut buf = Vec::with_capacity(self.payload.len() + 1);
                buf.extend_from_slice(&self.payload);
                buf.push(TERMINATOR);
                buf
            }
            Framing::DmdFrame => {
                let mut buf = Vec::with_capacity(DMD_FRAME_PREFIX.len() + self.payload.len());
                buf.extend_from_slice(DMD_FRAME_PREFIX);
                buf.extend_from_slice(&self.payload);
                buf
            }
        }
    }
}

/// Shutdown plumbing shared by the communicator and its tasks
struct LinkControl {
    port: String,
    processor: Processor,
    state: watch::Sender<LinkState>,
    cancel: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl LinkControl {
    /// Move to `Stopped` and cancel both tasks; only the first call has effect
    fn shutdown(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                warn!(port = %self.port, "{} link terminated: {}", self.processor, reason);
                *slot = Some(reason);
            }
        }

        self.cancel.cancel();
        let stopped = self.state.send_if_modified(|state| {
            if *state == LinkState::Stopped {
                false
            } else {
                *state = LinkState::Stopped;
                true
            }
        });
        if stopped {
            info!(port = %self.port, "Stopped {} connection", self.processor);
        }
    }

    fn set_state(&self, next: LinkState) {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Stopped || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Owned handle resolving when a link stops
pub struct LinkTermination {
    control: Arc<LinkControl>,
}

impl LinkTermination {
    /// Wait for the link to stop; yields the failure reason, if any
    pub async fn wait(self) -> Option<String> {
        let mut rx = self.control.state.subscribe();
        // The sender lives in `control`, so this only ends once Stopped is seen
        let _ = rx.wait_for(|state| *state == LinkState::Stopped).await;
        self.control.reason()
    }
}

/// Duplex channel to one processor
pub struct Communicator {
    identification: Identification,
    profile: LinkProfile,
    timing: TimingConfig,
    platform: Arc<dyn HardwarePlatform>,
    flow: Arc<FlowWindow>,
    outbound: mpsc::Sender<PendingMessage>,
    queue: Option<mpsc::Receiver<PendingMessage>>,
    link: Mutex<Option<Link>>,
    control: Arc<LinkControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl Communicator {
    /// Build the communicator for an identified link
    ///
    /// The processor picks the variant ([`CommunicatorKind`]) and, through the
    /// platform, the in-flight window.
    pub fn new(
        link: Link,
        identification: Identification,
        profile: LinkProfile,
        platform: Arc<dyn HardwarePlatform>,
        timing: TimingConfig,
        queue_capacity: usize,
    ) -> Self {
        let processor = identification.processor;
        let window = platform.buffer_size(processor);
        debug!("Setting {} buffer size: {}", processor, window);

        let (outbound, queue) = mpsc::channel(queue_capacity.max(1));
        let (state, _) = watch::channel(LinkState::Identified);
        let control = Arc::new(LinkControl {
            port: link.port().to_string(),
            processor,
            state,
            cancel: CancellationToken::new(),
            reason: Mutex::new(None),
        });

        Self {
            identification,
            profile,
            timing,
            platform,
            flow: Arc::new(FlowWindow::new(window)),
            outbound,
            queue: Some(queue),
            link: Mutex::new(Some(link)),
            control,
            tasks: Vec::new(),
        }
    }

    pub fn processor(&self) -> Processor {
        self.identification.processor
    }

    pub fn kind(&self) -> CommunicatorKind {
        self.identification.processor.kind()
    }

    pub fn identification(&self) -> &Identification {
        &self.identification
    }

    pub fn profile(&self) -> &LinkProfile {
        &self.profile
    }

    pub fn port(&self) -> &str {
        &self.control.port
    }

    pub fn state(&self) -> LinkState {
        self.control.state()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.control.state.subscribe()
    }

    /// Flow-control window of this link
    pub fn flow(&self) -> &Arc<FlowWindow> {
        &self.flow
    }

    /// Handle that resolves when this link stops
    pub fn termination(&self) -> LinkTermination {
        LinkTermination {
            control: self.control.clone(),
        }
    }

    /// Wait for the link to stop; yields the failure reason, if any
    pub async fn closed(&self) -> Option<String> {
        self.termination().wait().await
    }

    fn runs_discovery(&self) -> bool {
        self.kind() == CommunicatorKind::Serial && self.processor() == Processor::Net
    }

    /// Check firmware and, on NET links, discover IO boards
    ///
    /// Any error stops the link.
    pub async fn init(&mut self) -> Result<Vec<IoBoard>, ProtocolError> {
        if self.state() != LinkState::Identified {
            return Err(ProtocolError::InvalidState(format!(
                "init called in state {:?}",
                self.state()
            )));
        }
        self.control.set_state(LinkState::Configuring);

        let result = self.configure().await;
        if let Err(e) = &result {
            self.control.shutdown(Some(e.to_string()));
            self.release_link();
        }
        result
    }

    async fn configure(&mut self) -> Result<Vec<IoBoard>, ProtocolError> {
        self.identification.check_firmware()?;

        if !self.runs_discovery() {
            return Ok(Vec::new());
        }

        let mut link = self.take_link()?;
        let result = Discovery::new(
            &mut link,
            &self.identification,
            &self.profile,
            &self.timing,
            self.platform.as_ref(),
        )
        .run()
        .await;
        if result.is_ok() {
            *self.link_slot() = Some(link);
        }
        result
    }

    fn link_slot(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_link(&self) -> Result<Link, ProtocolError> {
        self.link_slot()
            .take()
            .ok_or_else(|| ProtocolError::InvalidState("link already released".to_string()))
    }

    /// Close a link that has not been handed to the tasks yet
    fn release_link(&self) {
        if let Some(link) = self.link_slot().take() {
            debug!(port = %link.port(), "Closing {} link before start", self.processor());
        }
    }

    /// Spawn the send and receive tasks
    pub fn start(&mut self) -> Result<(), ProtocolError> {
        if self.state() != LinkState::Configuring {
            return Err(ProtocolError::InvalidState(format!(
                "start called in state {:?}",
                self.state()
            )));
        }
        let link = self.link_slot().take();
        let (link, queue) = match (link, self.queue.take()) {
            (Some(link), Some(queue)) => (link, queue),
            _ => {
                return Err(ProtocolError::InvalidState(
                    "link already released".to_string(),
                ))
            }
        };

        let debug = self.platform.debug_enabled();
        let (_, reader, framer, writer) = link.into_parts();

        self.tasks.push(tokio::spawn(send_loop(
            writer,
            queue,
            self.flow.clone(),
            self.control.clone(),
            self.timing.flow_stall(),
            debug,
        )));
        self.tasks.push(tokio::spawn(receive_loop(
            reader,
            framer,
            self.flow.clone(),
            self.platform.clone(),
            self.control.clone(),
            debug,
        )));

        self.control.set_state(LinkState::Operational);
        Ok(())
    }

    /// Queue a command; it is written after everything queued before it
    ///
    /// On a DMD link the message is sent as a bitmap frame.
    pub fn send(&self, message: &str) -> Result<(), ProtocolError> {
        if self.processor() == Processor::Dmd {
            return self.enqueue(PendingMessage::dmd_frame(message.as_bytes()));
        }
        self.enqueue(PendingMessage::counted(message))
    }

    /// Queue a raw bitmap frame on a DMD link
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        if self.processor() != Processor::Dmd {
            return Err(ProtocolError::InvalidState(format!(
                "{} link does not take bitmap frames",
                self.processor()
            )));
        }
        self.enqueue(PendingMessage::dmd_frame(frame))
    }

    /// Queue traffic the board does not acknowledge
    pub fn send_uncounted(&self, message: &str) -> Result<(), ProtocolError> {
        self.enqueue(PendingMessage::uncounted(message))
    }

    pub fn enqueue(&self, message: PendingMessage) -> Result<(), ProtocolError> {
        if self.state() == LinkState::Stopped {
            return Err(ProtocolError::LinkClosed(self.control.port.clone()));
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                ProtocolError::LinkClosed(self.control.port.clone())
            }
        })
    }

    /// Stop both tasks and close the transport; safe to call repeatedly
    pub fn stop(&self) {
        self.control.shutdown(None);
        self.release_link();
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.control.shutdown(None);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("port", &self.control.port)
            .field("identification", &self.identification)
            .field("state", &self.state())
            .field("in_flight", &self.flow.in_flight())
            .finish()
    }
}

impl std::fmt::Display for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Communicator", self.processor())
    }
}

async fn send_loop(
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<PendingMessage>,
    flow: Arc<FlowWindow>,
    control: Arc<LinkControl>,
    stall_timeout: Duration,
    debug: bool,
) {
    loop {
        let message = tokio::select! {
            _ = control.cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let opened = tokio::select! {
            _ = control.cancel.cancelled() => break,
            opened = flow.wait_open(stall_timeout) => opened,
        };
        if !opened {
            warn!(
                port = %control.port,
                in_flight = flow.in_flight(),
                "Port {} was blocked for more than {:?}. Resetting send window",
                control.port,
                stall_timeout
            );
            flow.force_reset();
        }

        if message.is_counted() {
            flow.record_sent();
        }

        let wire = message.wire();
        let write = async {
            writer.write_all(&wire).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            _ = control.cancel.cancelled() => break,
            result = write => result,
        };
        if let Err(e) = result {
            control.shutdown(Some(format!("write failed: {}", e)));
            break;
        }

        if debug {
            log_sent(&control.port, &message);
        }
    }
    let _ = writer.shutdown().await;
}

async fn receive_loop(
    mut reader: BoxedReader,
    mut framer: MessageFramer,
    flow: Arc<FlowWindow>,
    platform: Arc<dyn HardwarePlatform>,
    control: Arc<LinkControl>,
    debug: bool,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];

    // Frames that arrived behind the last discovery reply
    while let Some(frame) = framer.next_frame() {
        dispatch_frame(&frame, control.processor, &flow, platform.as_ref());
    }

    loop {
        let read = tokio::select! {
            _ = control.cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                control.shutdown(Some(format!("serial {} closed", control.port)));
                break;
            }
            Ok(n) => n,
            Err(e) => {
                control.shutdown(Some(format!("serial error: {}", e)));
                break;
            }
        };

        if debug {
            debug!(port = %control.port, "Received:{}", hex_dump(&buf[..n]));
        }
        for frame in framer.feed(&buf[..n]) {
            dispatch_frame(&frame, control.processor, &flow, platform.as_ref());
        }
    }
}

/// Debug-log an outbound message, skipping high-rate traffic
fn log_sent(port: &str, message: &PendingMessage) {
    match message.framing {
        Framing::Line => {
            let text = String::from_utf8_lossy(message.payload());
            if !is_chatty(&text) {
                debug!(port = %port, "Send: {}", text);
            }
        }
        Framing::DmdFrame => {
            if message.payload().first() != Some(&b'W') {
                debug!(port = %port, "Send:{}", hex_dump(message.payload()));
            }
        }
    }
}

/// Account for one received frame and hand it on unless it is noise
fn dispatch_frame(
    frame: &Frame,
    processor: Processor,
    flow: &FlowWindow,
    platform: &dyn HardwarePlatform,
) {
    if !is_uncounted(frame.prefix()) {
        flow.record_ack();
    }
    if frame.is_empty() {
        return;
    }

    let text = frame.text();
    if is_noise(&text) {
        return;
    }
    platform.process_received_message(processor, &text);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    impl HardwarePlatform for Recorder {
        fn register_io_board(&self, _board: IoBoard) {}

        fn process_received_message(&self, _processor: Processor, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }

        fn debug_enabled(&self) -> bool {
            false
        }

        fn buffer_size(&self, _processor: Processor) -> usize {
            2
        }
    }

    #[test]
    fn test_dispatch_accounting() {
        let recorder = Recorder {
            messages: Mutex::new(Vec::new()),
        };
        let flow = FlowWindow::new(2);
        flow.record_sent();
        flow.record_sent();
        assert!(!flow.is_open());

        // switch events neither count nor get filtered
        dispatch_frame(&Frame::from("-N:0A"), Processor::Net, &flow, &recorder);
        assert_eq!(flow.in_flight(), 2);

        // pass replies count and are dropped
        dispatch_frame(&Frame::from("DN:P"), Processor::Net, &flow, &recorder);
        assert_eq!(flow.in_flight(), 1);
        assert!(flow.is_open());

        dispatch_frame(&Frame::from("SA:0E,FF"), Processor::Net, &flow, &recorder);
        assert_eq!(flow.in_flight(), 0);

        assert_eq!(
            *recorder.messages.lock().unwrap(),
            vec!["-N:0A".to_string(), "SA:0E,FF".to_string()]
        );
    }

    #[test]
    fn test_pending_message_wire_form() {
        let message = PendingMessage::counted("DN:01,81");
        assert_eq!(message.wire(), b"DN:01,81\r".to_vec());
        assert!(message.is_counted());
        assert!(!PendingMessage::uncounted("WD:3E8").is_counted());
    }

    #[test]
    fn test_dmd_frame_wire_form() {
        let frame = PendingMessage::dmd_frame(&[0x00, 0xff, 0x0d]);
        assert_eq!(frame.wire(), b"BM:\x00\xff\x0d".to_vec());
        assert!(!frame.is_counted());
    }
}

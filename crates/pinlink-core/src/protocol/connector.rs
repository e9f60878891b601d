//! Link establishment
//!
//! Opens a port (retrying per the open policy), wakes the board, runs the
//! `ID:` handshake and builds the communicator for whatever processor answered.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::commands::UNRECOGNIZED_PREFIX;
use super::{
    open_port, Command, Communicator, Identification, Link, LinkProfile, ProtocolError,
    RetryPolicy, TERMINATOR, WAKE_SEQUENCE_LEN,
};
use crate::config::{PlatformConfig, TimingConfig};
use crate::platform::HardwarePlatform;

/// Builder for one link
#[derive(Debug, Clone)]
pub struct Connector {
    port: String,
    baud_rate: u32,
    debug: bool,
    machine_type: String,
    hardware_keys: BTreeMap<String, String>,
    queue_capacity: usize,
    timing: TimingConfig,
    open_policy: RetryPolicy,
    identify_policy: RetryPolicy,
}

impl Connector {
    pub fn new(port: &str, config: &PlatformConfig) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: config.baud_rate,
            debug: config.debug,
            machine_type: config.machine_type.clone(),
            hardware_keys: config.hardware_keys.clone(),
            queue_capacity: config.queue_capacity,
            timing: config.timing,
            open_policy: config.open_policy(),
            identify_policy: config.identify_policy(),
        }
    }

    /// Override how port opening is retried
    pub fn with_open_policy(mut self, policy: RetryPolicy) -> Self {
        self.open_policy = policy;
        self
    }

    /// Override how the `ID:` exchange is retried
    pub fn with_identify_policy(mut self, policy: RetryPolicy) -> Self {
        self.identify_policy = policy;
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Open the serial port and establish the link
    pub async fn connect(
        &self,
        platform: Arc<dyn HardwarePlatform>,
    ) -> Result<Communicator, ProtocolError> {
        info!("Connecting to {} at {}bps", self.port, self.baud_rate);
        let what = format!("Opening {}", self.port);
        let stream = self
            .open_policy
            .run(&what, || open_port(&self.port, self.baud_rate))
            .await?;
        self.connect_stream(stream, platform).await
    }

    /// Establish the link over an already open stream
    pub async fn connect_stream<S>(
        &self,
        stream: S,
        platform: Arc<dyn HardwarePlatform>,
    ) -> Result<Communicator, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut link = Link::new(self.port.clone(), stream);
        link.set_debug(self.debug);

        let identification = self.identify(&mut link).await?;
        let profile = LinkProfile::classify(&identification, &self.machine_type, &self.hardware_keys);

        info!(
            "Connected! Processor: {}, Board Type: {}, Firmware: {}",
            identification.processor, identification.model, identification.firmware
        );
        debug!(
            "Link profile for {}: legacy {}, retro {}",
            self.port, profile.is_legacy, profile.is_retro
        );

        Ok(Communicator::new(
            link,
            identification,
            profile,
            platform,
            self.timing,
            self.queue_capacity,
        ))
    }

    /// Wake the board and exchange `ID:` until it answers
    async fn identify(&self, link: &mut Link) -> Result<Identification, ProtocolError> {
        link.discard_input();

        // Spaces flush any half-received command left on the board
        let mut wake = vec![b' '; WAKE_SEQUENCE_LEN];
        wake.push(TERMINATOR);
        link.write_raw(&wake).await?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            link.send_command(&Command::Identify).await?;

            if let Some(reply) = self.await_id_reply(link).await? {
                return Identification::parse(&reply);
            }

            if !self.identify_policy.should_retry(attempts) {
                warn!("No ID reply from {} after {} attempt(s)", self.port, attempts);
                return Err(ProtocolError::HandshakeTimeout { attempts });
            }
            debug!("No ID reply from {}, retrying", self.port);
            tokio::time::sleep(self.identify_policy.delay()).await;
        }
    }

    /// First `ID:` reply within the reply timeout; other traffic is skipped
    async fn await_id_reply(&self, link: &mut Link) -> Result<Option<String>, ProtocolError> {
        let wait = async {
            loop {
                let frame = link.read_frame().await?;
                let text = frame.text();
                if text.starts_with(Command::Identify.reply_prefix()) {
                    return Ok::<_, ProtocolError>(text.into_owned());
                }
                if text.starts_with(UNRECOGNIZED_PREFIX) {
                    debug!("Board rejected a stale command: {}", text);
                } else {
                    debug!("Ignoring {} while waiting for ID", text);
                }
            }
        };

        match tokio::time::timeout(self.timing.id_reply(), wait).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

//! Platform configuration
//!
//! Stored as JSON. Every field has a default, so a config file only needs the
//! values it changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{Processor, ProtocolError, RetryPolicy, DEFAULT_BAUD_RATE};

/// Serial platform configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Serial ports to connect, one per processor
    pub ports: Vec<String>,

    /// Baud rate
    pub baud_rate: u32,

    /// Machine type, looked up in `hardware_keys`
    pub machine_type: String,

    /// Log raw bytes of every read
    pub debug: bool,

    /// Keep retrying to open ports that are not there yet
    pub resilient: bool,

    /// In-flight window per processor class (0 disables flow control)
    pub net_buffer: usize,
    pub rgb_buffer: usize,
    pub dmd_buffer: usize,
    pub seg_buffer: usize,
    pub exp_buffer: usize,

    /// Capacity of each link's outbound queue
    pub queue_capacity: usize,

    /// Machine type to board-family key sent with `CH:`
    pub hardware_keys: BTreeMap<String, String>,

    /// Protocol timing
    pub timing: TimingConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            machine_type: "fast".to_string(),
            debug: false,
            resilient: false,
            net_buffer: 10,
            rgb_buffer: 3,
            dmd_buffer: 3,
            seg_buffer: 0,
            exp_buffer: 0,
            queue_capacity: 1024,
            hardware_keys: default_hardware_keys(),
            timing: TimingConfig::default(),
        }
    }
}

fn default_hardware_keys() -> BTreeMap<String, String> {
    [("fast", "2000"), ("sys11", "11"), ("wpc89", "89"), ("wpc95", "95")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl PlatformConfig {
    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config(
                "Baud rate must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ProtocolError::Config(
                "Queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.ports.iter().any(|p| p.trim().is_empty()) {
            return Err(ProtocolError::Config("Port names cannot be empty".to_string()));
        }
        if self.timing.flow_stall_ms == 0 {
            return Err(ProtocolError::Config(
                "Flow stall timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured in-flight window for a processor
    pub fn buffer_size(&self, processor: Processor) -> usize {
        match processor {
            Processor::Net => self.net_buffer,
            Processor::Rgb => self.rgb_buffer,
            Processor::Dmd => self.dmd_buffer,
            Processor::Seg => self.seg_buffer,
            Processor::Exp | Processor::Led => self.exp_buffer,
        }
    }

    /// Policy for opening a port: forever when resilient, once otherwise
    pub fn open_policy(&self) -> RetryPolicy {
        if self.resilient {
            RetryPolicy::unbounded(self.timing.open_retry())
        } else {
            RetryPolicy::once()
        }
    }

    /// Policy for the `ID:` exchange; boards may still be booting, so never give up
    pub fn identify_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(self.timing.id_retry())
    }
}

/// Protocol timing in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Longest the send loop waits on a closed gate before resetting the window
    pub flow_stall_ms: u64,
    /// Wait for an `ID:` reply
    pub id_reply_ms: u64,
    /// Pause between `ID:` attempts
    pub id_retry_ms: u64,
    /// Pause between port open attempts in resilient mode
    pub open_retry_ms: u64,
    /// Wait for the CPU reset to complete
    pub reset_timeout_ms: u64,
    /// Wait for the hardware configuration acknowledgement
    pub configure_timeout_ms: u64,
    /// Wait for `SA:` and `NN:` replies
    pub reply_timeout_ms: u64,
    /// Pause before reset and configuration
    pub settle_ms: u64,
    /// Pause before the bulk switch read
    pub switch_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            flow_stall_ms: 1000,
            id_reply_ms: 500,
            id_retry_ms: 500,
            open_retry_ms: 100,
            reset_timeout_ms: 10_000,
            configure_timeout_ms: 15_000,
            reply_timeout_ms: 5000,
            settle_ms: 200,
            switch_settle_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn flow_stall(&self) -> Duration {
        Duration::from_millis(self.flow_stall_ms)
    }

    pub fn id_reply(&self) -> Duration {
        Duration::from_millis(self.id_reply_ms)
    }

    pub fn id_retry(&self) -> Duration {
        Duration::from_millis(self.id_retry_ms)
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn configure_timeout(&self) -> Duration {
        Duration::from_millis(self.configure_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn switch_settle(&self) -> Duration {
        Duration::from_millis(self.switch_settle_ms)
    }
}

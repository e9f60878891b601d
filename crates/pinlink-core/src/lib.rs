//! # pinlink Core Library
//!
//! Serial protocol layer for FAST-style pinball controllers.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Port opening with optional resilient retry
//! - The `ID:` handshake and processor classification
//! - Carriage-return framing of the byte stream
//! - Windowed flow control of in-flight commands
//! - IO board discovery on NET links
//! - A platform adapter owning one link per processor
//!
//! ## Example
//!
//! ```rust,ignore
//! use pinlink_core::prelude::*;
//!
//! let config = PlatformConfig::load("platform.json")?;
//! let (mut platform, mut messages) = PlatformAdapter::new(config);
//! platform.connect_all().await?;
//!
//! platform.send(Processor::Net, "DL:01,81")?;
//! while let Some(received) = messages.recv().await {
//!     println!("{}: {}", received.processor, received.message);
//! }
//! ```

pub mod config;
pub mod platform;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PlatformConfig, TimingConfig};
    pub use crate::platform::{HardwarePlatform, IoBoard, PlatformAdapter, ReceivedMessage};
    pub use crate::protocol::{
        Communicator, Connector, FirmwareVersion, Identification, LinkState, Processor,
        ProtocolError, RetryPolicy,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

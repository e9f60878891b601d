//! IO board discovery
//!
//! Runs once per NET link before steady-state traffic: reset the CPU,
//! configure the board family, take the initial switch snapshot and walk the
//! bus node by node, checking each board's firmware.

use tracing::{debug, error, info, warn};

use super::commands::{self, Command, MAX_NODES, NODE_END, NODE_NOT_FOUND};
use super::identity::io_board_minimum;
use super::{BoardMismatch, Identification, Link, LinkProfile, ProtocolError};
use crate::config::TimingConfig;
use crate::platform::{HardwarePlatform, IoBoard};

/// Switch capacity registered for a Retro controller (0x80)
const RETRO_SWITCHES: u32 = 0x80;
/// Driver capacity registered for a Retro controller (0x40)
const RETRO_DRIVERS: u32 = 0x40;
/// Fields in an `NN:` board descriptor
const DESCRIPTOR_FIELDS: usize = 11;

/// One discovery pass over a link
pub struct Discovery<'a> {
    link: &'a mut Link,
    identification: &'a Identification,
    profile: &'a LinkProfile,
    timing: &'a TimingConfig,
    platform: &'a dyn HardwarePlatform,
}

impl<'a> Discovery<'a> {
    pub fn new(
        link: &'a mut Link,
        identification: &'a Identification,
        profile: &'a LinkProfile,
        timing: &'a TimingConfig,
        platform: &'a dyn HardwarePlatform,
    ) -> Self {
        Self {
            link,
            identification,
            profile,
            timing,
            platform,
        }
    }

    /// Run every step; returns the boards registered, in node order
    pub async fn run(mut self) -> Result<Vec<IoBoard>, ProtocolError> {
        self.reset_cpu().await?;
        if !self.profile.is_legacy {
            self.configure_hardware().await?;
        }
        self.read_all_switches().await?;

        debug!(
            "Querying IO boards (legacy {}, retro {})",
            self.profile.is_legacy, self.profile.is_retro
        );
        if self.profile.is_retro {
            return Ok(vec![self.register_retro_board()]);
        }
        self.enumerate_nodes().await
    }

    async fn reset_cpu(&mut self) -> Result<(), ProtocolError> {
        tokio::time::sleep(self.timing.settle()).await;
        debug!("Resetting NET CPU");
        self.link.send_command(&Command::ResetCpu).await?;

        let link = &mut *self.link;
        let wait = async {
            loop {
                let frame = link.read_frame().await?;
                let text = frame.text();
                debug!("Got: {}", text);
                if text == "BR:P" || text.ends_with("!B:02") {
                    return Ok::<_, ProtocolError>(());
                }
            }
        };

        match tokio::time::timeout(self.timing.reset_timeout(), wait).await {
            Ok(result) => {
                result?;
                debug!("Reset successful");
            }
            Err(_) => warn!("Reset of NET CPU failed"),
        }
        Ok(())
    }

    async fn configure_hardware(&mut self) -> Result<(), ProtocolError> {
        let Some(key) = self.profile.hardware_key.clone() else {
            debug!("No hardware key for this machine type, skipping configuration");
            return Ok(());
        };

        tokio::time::sleep(self.timing.settle()).await;
        debug!("Writing hardware key {}", key);
        self.link
            .send_command(&Command::ConfigureHardware { key })
            .await?;

        let link = &mut *self.link;
        let wait = async {
            loop {
                let frame = link.read_frame().await?;
                // Some CPUs send a NUL after their final boot message
                let bytes = frame.as_bytes();
                let bytes = bytes.strip_prefix(b"\0").unwrap_or(bytes);
                debug!("Got: {}", String::from_utf8_lossy(bytes));
                if bytes == b"CH:P" {
                    return Ok::<_, ProtocolError>(());
                }
            }
        };

        match tokio::time::timeout(self.timing.configure_timeout(), wait).await {
            Ok(result) => {
                result?;
                debug!("Hardware configuration accepted");
            }
            Err(_) => warn!("Configuring hardware timed out"),
        }
        Ok(())
    }

    async fn read_all_switches(&mut self) -> Result<(), ProtocolError> {
        tokio::time::sleep(self.timing.switch_settle()).await;
        debug!("Reading all switches");
        self.link.send_command(&Command::ReadAllSwitches).await?;

        let snapshot = self.await_reply(&Command::ReadAllSwitches).await?;
        self.platform
            .process_received_message(self.identification.processor, &snapshot);
        Ok(())
    }

    fn register_retro_board(&mut self) -> IoBoard {
        let board = IoBoard {
            node_id: 0,
            model: self.identification.model.clone(),
            firmware: self.identification.firmware.clone(),
            switch_count: RETRO_SWITCHES,
            driver_count: RETRO_DRIVERS,
        };
        self.platform.register_io_board(board.clone());
        board
    }

    async fn enumerate_nodes(&mut self) -> Result<Vec<IoBoard>, ProtocolError> {
        let required = io_board_minimum(self.profile.is_legacy);
        let mut boards = Vec::new();
        let mut mismatches = Vec::new();

        for node_id in 0..MAX_NODES {
            let query = Command::QueryNode { node_id };
            self.link.send_command(&query).await?;
            let reply = self.await_reply(&query).await?;

            if reply == NODE_END {
                break;
            }
            let Some(board) = parse_node_descriptor(&reply)? else {
                break;
            };

            self.platform.register_io_board(board.clone());
            if board.firmware < required {
                error!(
                    "Firmware version mismatch. IO boards require firmware {}, but board {:02X} ({}) has firmware {}",
                    required, board.node_id, board.model, board.firmware
                );
                mismatches.push(BoardMismatch {
                    node_id: board.node_id,
                    model: board.model.clone(),
                    actual: board.firmware.clone(),
                    required: required.clone(),
                });
            }
            boards.push(board);
        }

        info!("Found {} IO board(s)", boards.len());
        if !mismatches.is_empty() {
            return Err(ProtocolError::BoardFirmwareMismatch(mismatches));
        }
        Ok(boards)
    }

    /// Wait for the reply to `command`, logging anything else that arrives
    async fn await_reply(&mut self, command: &Command) -> Result<String, ProtocolError> {
        let prefix = command.reply_prefix();
        let link = &mut *self.link;
        let wait = async {
            loop {
                let frame = link.read_frame().await?;
                let text = frame.text();
                if text.starts_with(prefix) {
                    return Ok::<_, ProtocolError>(text.into_owned());
                }
                if command == &Command::ReadAllSwitches {
                    warn!("Got unexpected message while awaiting {}: {}", prefix, text);
                } else if !commands::is_noise(&text) {
                    debug!("Got unexpected message while querying IO boards: {}", text);
                }
            }
        };

        tokio::time::timeout(self.timing.reply_timeout(), wait)
            .await
            .map_err(|_| ProtocolError::Timeout(format!("{} reply", command.to_wire())))?
    }
}

/// Parse an `NN:` descriptor; `None` marks an empty slot ending enumeration
fn parse_node_descriptor(reply: &str) -> Result<Option<IoBoard>, ProtocolError> {
    let malformed = || ProtocolError::MalformedReply(reply.to_string());

    let fields: Vec<&str> = reply.split(',').collect();
    if fields.len() != DESCRIPTOR_FIELDS {
        return Err(malformed());
    }

    let model = fields[1].trim_matches('\0');
    if model.is_empty() || model == NODE_NOT_FOUND {
        return Ok(None);
    }

    let node_id = fields[0]
        .get(3..)
        .and_then(|id| u8::from_str_radix(id.trim(), 16).ok())
        .ok_or_else(malformed)?;
    let firmware = fields[2].trim().parse()?;
    let driver_count = u32::from_str_radix(fields[3].trim(), 16).map_err(|_| malformed())?;
    let switch_count = u32::from_str_radix(fields[4].trim(), 16).map_err(|_| malformed())?;

    Ok(Some(IoBoard {
        node_id,
        model: model.to_string(),
        firmware,
        switch_count,
        driver_count,
    }))
}

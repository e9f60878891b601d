//! Controller Probe Tool
//!
//! Connects to one or more controller ports, prints what answered and the IO
//! boards found, then echoes received messages for a while.
//!
//! Usage:
//!   cargo run --example pinlink-probe -- [OPTIONS] [PORT...]
//!
//! Options:
//!   --config FILE     Load platform settings from a JSON file
//!   --baud RATE       Baud rate (default: 921600)
//!   --machine TYPE    Machine type (default: fast)
//!   --listen SECS     Seconds to print received messages (default: 5)
//!   --resilient       Keep retrying ports that are not there yet
//!   --debug           Log raw traffic
//!   --list            List serial ports and exit
//!
//! Set RUST_LOG (e.g. RUST_LOG=pinlink_core=debug) for protocol logs.

use anyhow::Context;
use pinlink_core::prelude::*;
use pinlink_core::protocol::list_ports;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = PlatformConfig::default();
    let mut ports = Vec::new();
    let mut listen_secs = 5u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a file")?;
                config = PlatformConfig::load(path)
                    .with_context(|| format!("loading {}", path))?;
            }
            "--baud" | "-b" => {
                i += 1;
                config.baud_rate = args
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(config.baud_rate);
            }
            "--machine" | "-m" => {
                i += 1;
                if let Some(machine) = args.get(i) {
                    config.machine_type = machine.clone();
                }
            }
            "--listen" | "-l" => {
                i += 1;
                listen_secs = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(5);
            }
            "--resilient" => config.resilient = true,
            "--debug" => config.debug = true,
            "--list" => {
                print_ports();
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if !arg.starts_with('-') => ports.push(arg.to_string()),
            other => anyhow::bail!("unknown option {}", other),
        }
        i += 1;
    }

    if !ports.is_empty() {
        config.ports = ports;
    }
    if config.ports.is_empty() {
        print_ports();
        anyhow::bail!("no ports given");
    }
    config.validate()?;

    println!("=== pinlink probe ===");
    println!("Ports: {}", config.ports.join(", "));
    println!("Baud: {}", config.baud_rate);
    println!("Machine: {}", config.machine_type);
    println!();

    let (mut platform, mut messages) = PlatformAdapter::new(config);
    let processors = platform.connect_all().await?;

    for processor in &processors {
        if let Some(id) = platform.identification(*processor) {
            println!("{}: {} firmware {}", processor, id.model, id.firmware);
        }
    }
    for board in platform.boards() {
        println!(
            "  IO board {:02X}: {} firmware {} ({} switches, {} drivers)",
            board.node_id, board.model, board.firmware, board.switch_count, board.driver_count
        );
    }

    println!();
    println!("Listening for {}s...", listen_secs);
    let listen = tokio::time::sleep(Duration::from_secs(listen_secs));
    tokio::pin!(listen);

    loop {
        tokio::select! {
            _ = &mut listen => break,
            lost = platform.wait_for_link_loss() => {
                if let Some((processor, reason)) = lost {
                    println!("{} link lost: {}", processor, reason.unwrap_or_default());
                }
                break;
            }
            received = messages.recv() => match received {
                Some(received) => println!("[{}] {}", received.processor, received.message),
                None => break,
            },
        }
    }

    platform.stop();
    Ok(())
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    println!("Available ports:");
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "  {} [{:04x}:{:04x}] {}",
                port.name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("  {}", port.name),
        }
    }
}

fn print_help() {
    println!("pinlink controller probe");
    println!();
    println!("Usage: pinlink-probe [OPTIONS] [PORT...]");
    println!();
    println!("Options:");
    println!("  --config FILE     Load platform settings from a JSON file");
    println!("  --baud RATE       Baud rate (default: 921600)");
    println!("  --machine TYPE    Machine type (default: fast)");
    println!("  --listen SECS     Seconds to print received messages (default: 5)");
    println!("  --resilient       Keep retrying ports that are not there yet");
    println!("  --debug           Log raw traffic");
    println!("  --list            List serial ports and exit");
}

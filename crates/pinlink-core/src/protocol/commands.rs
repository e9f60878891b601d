//! Protocol commands
//!
//! Commands used by the handshake and discovery phases, plus the fixed reply
//! tables that decide how steady-state traffic is accounted and dispatched.

/// Commands issued by this layer itself (device commands are opaque strings)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the board who it is (`ID:`)
    Identify,

    /// Reset the remote CPU (`BR:`)
    ResetCpu,

    /// Configure the board family (`CH:<key>,FF`)
    ConfigureHardware { key: String },

    /// Read every switch (`SA:`)
    ReadAllSwitches,

    /// Query the IO board at a node id (`NN:<id>`)
    QueryNode { node_id: u8 },
}

impl Command {
    /// Command text without the terminator
    pub fn to_wire(&self) -> String {
        match self {
            Command::Identify => "ID:".to_string(),
            Command::ResetCpu => "BR:".to_string(),
            Command::ConfigureHardware { key } => format!("CH:{},FF", key),
            Command::ReadAllSwitches => "SA:".to_string(),
            Command::QueryNode { node_id } => format!("NN:{:02X}", node_id),
        }
    }

    /// Reply prefix that answers this command
    pub fn reply_prefix(&self) -> &'static str {
        match self {
            Command::Identify => "ID:",
            Command::ResetCpu => "BR:",
            Command::ConfigureHardware { .. } => "CH:",
            Command::ReadAllSwitches => "SA:",
            Command::QueryNode { .. } => "NN:",
        }
    }
}

/// Replies that acknowledge a command and carry nothing for the device layer
pub const NOISE_REPLIES: &[&str] = &[
    "RX:P", // RGB pass
    "SN:P", // network switch pass
    "SL:P", // local switch pass
    "LX:P", // lamp pass
    "PX:P", // segment pass
    "DN:P", // network driver pass
    "DL:P", // local driver pass
    "XX:F", // unrecognized command
    "R1:F",
    "L1:P",
    "GI:P",
    "TL:P",
    "TN:P",
    "XO:P", // servo/daughterboard pass
    "XX:U",
    "XX:N",
];

/// Unsolicited switch events; they never answer a command
pub const UNCOUNTED_PREFIXES: &[&[u8; 2]] = &[b"-N", b"/N", b"/L", b"-L"];

/// Sentinel reply ending IO board enumeration
pub const NODE_END: &str = "NN:F";

/// Model string of an empty bus slot
pub const NODE_NOT_FOUND: &str = "!Node Not Found!";

/// Number of node ids polled during discovery
pub const MAX_NODES: u8 = 128;

/// Prefix of replies the board sends when it did not understand a command
pub const UNRECOGNIZED_PREFIX: &str = "XX:";

pub fn is_noise(text: &str) -> bool {
    NOISE_REPLIES.contains(&text)
}

pub fn is_uncounted(prefix: &[u8]) -> bool {
    UNCOUNTED_PREFIXES.iter().any(|p| p.as_slice() == prefix)
}

/// Commands too frequent to log at debug level (watchdog, lights)
pub fn is_chatty(message: &str) -> bool {
    matches!(message.as_bytes().first(), Some(b'W') | Some(b'L'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_forms() {
        assert_eq!(Command::Identify.to_wire(), "ID:");
        assert_eq!(
            Command::ConfigureHardware { key: "2000".into() }.to_wire(),
            "CH:2000,FF"
        );
        assert_eq!(Command::QueryNode { node_id: 10 }.to_wire(), "NN:0A");
        assert_eq!(Command::QueryNode { node_id: 127 }.to_wire(), "NN:7F");
    }

    #[test]
    fn test_tables() {
        assert!(is_noise("XX:F"));
        assert!(!is_noise("XX:F2"));
        assert!(is_uncounted(b"-N"));
        assert!(is_uncounted(b"/L"));
        assert!(!is_uncounted(b"SA"));
        assert!(!is_uncounted(b"-"));
        assert!(is_chatty("WD:3E8"));
        assert!(!is_chatty("DN:01,81"));
    }
}

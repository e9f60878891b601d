//! Board identification
//!
//! Parses the `ID:` handshake reply, classifies the board generation and holds
//! the per-processor firmware floors.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::ProtocolError;

/// Model prefix of a first-generation (V1, "Nano") controller
pub const LEGACY_MODEL_PREFIX: &str = "FP-CPU-0";

/// Model prefix of a Retro controller
pub const RETRO_MODEL_PREFIX: &str = "FP-SBI";

/// Remote processor addressed by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Processor {
    /// Main CPU: switches, drivers and the IO bus
    Net,
    /// RGB LED controller
    Rgb,
    /// Dot matrix display
    Dmd,
    /// Segment display controller
    Seg,
    /// Expansion board
    Exp,
    /// LED expansion board
    Led,
}

impl Processor {
    /// Wire code of this processor
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::Net => "NET",
            Processor::Rgb => "RGB",
            Processor::Dmd => "DMD",
            Processor::Seg => "SEG",
            Processor::Exp => "EXP",
            Processor::Led => "LED",
        }
    }

    /// Which communicator variant drives this processor
    pub fn kind(&self) -> CommunicatorKind {
        match self {
            Processor::Seg => CommunicatorKind::Display,
            Processor::Exp | Processor::Led => CommunicatorKind::Expansion,
            Processor::Net | Processor::Rgb | Processor::Dmd => CommunicatorKind::Serial,
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Processor {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NET" => Ok(Processor::Net),
            "RGB" => Ok(Processor::Rgb),
            "DMD" => Ok(Processor::Dmd),
            "SEG" => Ok(Processor::Seg),
            "EXP" => Ok(Processor::Exp),
            "LED" => Ok(Processor::Led),
            other => Err(ProtocolError::UnknownProcessor(other.to_string())),
        }
    }
}

impl TryFrom<String> for Processor {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Processor> for String {
    fn from(p: Processor) -> Self {
        p.as_str().to_string()
    }
}

/// Communicator variant selected from the identified processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicatorKind {
    /// General CPU-class link (NET, RGB, DMD)
    Serial,
    /// Segment display link
    Display,
    /// Lighting/expansion link
    Expansion,
}

/// Dotted numeric firmware version
///
/// Components compare numerically, so `2.10` sorts after `2.9`, and trailing
/// zero components are insignificant (`2.0 == 2`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    raw: String,
    parts: Vec<u32>,
}

impl FirmwareVersion {
    /// Build a version from a literal known to be well formed
    fn known(raw: &'static str, parts: &[u32]) -> Self {
        Self {
            raw: raw.to_string(),
            parts: parts.to_vec(),
        }
    }

    /// Version string as reported by the board
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Numeric components
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl FromStr for FirmwareVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidVersion(s.to_string()));
        }
        let parts = trimmed
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ProtocolError::InvalidVersion(s.to_string()))?;
        Ok(Self {
            raw: trimmed.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(v: FirmwareVersion) -> Self {
        v.raw
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

/// Minimum firmware for a processor, or `None` when the class has no floor
pub fn minimum_firmware(processor: Processor, legacy_model: bool) -> Option<FirmwareVersion> {
    match (processor, legacy_model) {
        (Processor::Net, true) => Some(FirmwareVersion::known("0.88", &[0, 88])),
        (Processor::Net, false) => Some(FirmwareVersion::known("2.0", &[2, 0])),
        (Processor::Rgb, true) => Some(FirmwareVersion::known("0.87", &[0, 87])),
        (Processor::Rgb, false) => Some(FirmwareVersion::known("2.0", &[2, 0])),
        (Processor::Dmd, _) => Some(FirmwareVersion::known("0.88", &[0, 88])),
        (Processor::Seg | Processor::Exp | Processor::Led, _) => None,
    }
}

/// Minimum firmware for an IO board on a legacy or modern bus
pub fn io_board_minimum(legacy_link: bool) -> FirmwareVersion {
    if legacy_link {
        FirmwareVersion::known("0.87", &[0, 87])
    } else {
        FirmwareVersion::known("1.09", &[1, 9])
    }
}

/// Identity reported by a board during handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    /// Processor behind the link
    pub processor: Processor,
    /// Board model, e.g. `FP-CPU-2000`
    pub model: String,
    /// Firmware version
    pub firmware: FirmwareVersion,
}

impl Identification {
    /// Parse an `ID:` reply (without the trailing carriage return)
    ///
    /// Boards that omit the processor token (e.g. `ID:FP-CPU-2000 1.09`) are
    /// reported as NET.
    pub fn parse(reply: &str) -> Result<Self, ProtocolError> {
        let payload = reply
            .strip_prefix("ID:")
            .ok_or_else(|| ProtocolError::MalformedReply(reply.to_string()))?;
        let tokens: Vec<&str> = payload.split_whitespace().collect();

        let (processor, model, firmware) = match tokens.as_slice() {
            [processor, model, firmware] => (processor.parse()?, *model, *firmware),
            [model, firmware] => (Processor::Net, *model, *firmware),
            _ => return Err(ProtocolError::MalformedReply(reply.to_string())),
        };

        Ok(Self {
            processor,
            model: model.to_string(),
            firmware: firmware.parse()?,
        })
    }

    /// Model belongs to a Retro controller
    pub fn is_retro(&self) -> bool {
        self.model.starts_with(RETRO_MODEL_PREFIX)
    }

    /// Model belongs to a first-generation controller
    pub fn has_legacy_model(&self) -> bool {
        self.model.starts_with(LEGACY_MODEL_PREFIX)
    }

    /// Firmware floor for this board
    pub fn minimum_firmware(&self) -> Option<FirmwareVersion> {
        minimum_firmware(self.processor, self.has_legacy_model())
    }

    /// Reject boards running firmware older than their class minimum
    pub fn check_firmware(&self) -> Result<(), ProtocolError> {
        match self.minimum_firmware() {
            Some(required) if self.firmware < required => Err(ProtocolError::FirmwareMismatch {
                processor: self.processor,
                required,
                actual: self.firmware.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Hardware generation of a link, derived once after identification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkProfile {
    /// Older hardware generation with a reduced command set
    pub is_legacy: bool,
    /// Retro controller emulating an older driver board layout
    pub is_retro: bool,
    /// Board-family key sent with `CH:`, when the machine type has one
    pub hardware_key: Option<String>,
}

impl LinkProfile {
    /// Classify a link from its identification and the configured machine type
    pub fn classify(
        identification: &Identification,
        machine_type: &str,
        hardware_keys: &BTreeMap<String, String>,
    ) -> Self {
        let hardware_key = hardware_keys.get(machine_type).cloned();
        let is_retro = identification.is_retro();
        let is_legacy = match identification.processor.kind() {
            CommunicatorKind::Display | CommunicatorKind::Expansion => false,
            CommunicatorKind::Serial => !is_retro && hardware_key.is_none(),
        };

        Self {
            is_legacy,
            is_retro,
            hardware_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> FirmwareVersion {
        s.parse().expect("valid version")
    }

    fn keys() -> BTreeMap<String, String> {
        BTreeMap::from([("fast".to_string(), "2000".to_string())])
    }

    #[test]
    fn test_parse_three_tokens() {
        let id = Identification::parse("ID:NET FP-CPU-2000 1.09").unwrap();
        assert_eq!(id.processor, Processor::Net);
        assert_eq!(id.model, "FP-CPU-2000");
        assert_eq!(id.firmware, v("1.09"));
    }

    #[test]
    fn test_parse_two_tokens_defaults_to_net() {
        let id = Identification::parse("ID:FP-CPU-2000 1.09").unwrap();
        assert_eq!(id.processor, Processor::Net);
        assert_eq!(id.model, "FP-CPU-2000");
        assert_eq!(id.firmware.as_str(), "1.09");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Identification::parse("ID:"),
            Err(ProtocolError::MalformedReply(_))
        ));
        assert!(matches!(
            Identification::parse("XX:F"),
            Err(ProtocolError::MalformedReply(_))
        ));
        assert!(matches!(
            Identification::parse("ID:ABC FP-X 1.0"),
            Err(ProtocolError::UnknownProcessor(_))
        ));
        assert!(matches!(
            Identification::parse("ID:NET FP-X beta"),
            Err(ProtocolError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        assert!(v("2.10") > v("2.9"));
        assert!(v("0.87") > v("0.85"));
        assert!(v("1.09") < v("1.10"));
        assert_eq!(v("2.0"), v("2"));
        assert_eq!(v("1.09"), v("1.9"));
    }

    #[test]
    fn test_legacy_rgb_below_floor_is_rejected() {
        let id = Identification {
            processor: Processor::Rgb,
            model: "FP-CPU-002".to_string(),
            firmware: v("0.85"),
        };
        match id.check_firmware() {
            Err(ProtocolError::FirmwareMismatch { required, actual, .. }) => {
                assert_eq!(required, v("0.87"));
                assert_eq!(actual, v("0.85"));
            }
            other => panic!("expected firmware mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_modern_net_floor() {
        let mut id = Identification::parse("ID:NET FP-CPU-2000 1.99").unwrap();
        assert!(id.check_firmware().is_err());
        id.firmware = v("2.06");
        assert!(id.check_firmware().is_ok());
    }

    #[test]
    fn test_classes_without_floor_always_pass() {
        let id = Identification::parse("ID:SEG FP-SEG-0001 0.01").unwrap();
        assert!(id.check_firmware().is_ok());
        assert_eq!(id.processor.kind(), CommunicatorKind::Display);
    }

    #[test]
    fn test_classify_profiles() {
        let modern = Identification::parse("ID:NET FP-CPU-2000 2.06").unwrap();
        let profile = LinkProfile::classify(&modern, "fast", &keys());
        assert!(!profile.is_legacy);
        assert!(!profile.is_retro);
        assert_eq!(profile.hardware_key.as_deref(), Some("2000"));

        let legacy = LinkProfile::classify(&modern, "nano", &keys());
        assert!(legacy.is_legacy);

        let retro = Identification::parse("ID:NET FP-SBI-0095-3 2.06").unwrap();
        let profile = LinkProfile::classify(&retro, "nano", &keys());
        assert!(profile.is_retro);
        assert!(!profile.is_legacy);

        let exp = Identification::parse("ID:EXP FP-EXP-0071 0.11").unwrap();
        assert!(!LinkProfile::classify(&exp, "nano", &keys()).is_legacy);
    }
}

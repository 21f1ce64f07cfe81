use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Longest hardware address we accept, in hex digits (16 bytes).
pub const MAX_HEX_DIGITS: usize = 32;

/// Name the legacy database stores for meters nobody has named yet.
pub const UNNAMED_SENTINEL: &str = "Unavngivet";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("empty device id")]
    Empty,
    #[error("device id has an odd number of hex digits ({0})")]
    OddLength(usize),
    #[error("device id is too long ({0} hex digits, max 32)")]
    TooLong(usize),
    #[error("invalid character {0:?} in device id")]
    NotHex(char),
}

/// Hardware address of a meter, always held in canonical form:
/// lowercase hex pairs joined by colons (`08:84:dd:9f`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeterId(String);

impl MeterId {
    /// Accepts canonical, uppercase, dash separated or bare hex input.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let hex: String = raw.trim().chars().filter(|c| *c != ':' && *c != '-').collect();
        Self::from_hex(&hex)
    }

    /// Builds an id from separator-free hex, the form used inside broker topics.
    pub fn from_hex(hex: &str) -> Result<Self, IdError> {
        if hex.is_empty() {
            return Err(IdError::Empty);
        }
        if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(IdError::NotHex(bad));
        }
        if hex.len() > MAX_HEX_DIGITS {
            return Err(IdError::TooLong(hex.len()));
        }
        if hex.len() % 2 != 0 {
            return Err(IdError::OddLength(hex.len()));
        }

        let lower = hex.to_ascii_lowercase();
        let pairs: Vec<&str> = (0..lower.len())
            .step_by(2)
            .map(|i| &lower[i..i + 2])
            .collect();
        Ok(Self(pairs.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Separator-free lowercase hex (`0884dd9f`).
    pub fn hex(&self) -> String {
        self.0.replace(':', "")
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MeterId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MeterId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MeterId> for String {
    fn from(id: MeterId) -> Self {
        id.0
    }
}

/// On/off state of the relay inside a meter. Serialized with the labels the
/// UI has always shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "Tændt")]
    On,
    #[serde(rename = "Slukket")]
    Off,
}

impl PowerState {
    /// Device echoes carry `ON`; anything else counts as off.
    pub fn from_echo(payload: &str) -> Self {
        if payload == "ON" {
            PowerState::On
        } else {
            PowerState::Off
        }
    }

    /// Payload published on a command topic.
    pub fn command_payload(self) -> &'static str {
        match self {
            PowerState::On => "ON",
            PowerState::Off => "OFF",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PowerState::On => "Tændt",
            PowerState::Off => "Slukket",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One cumulative energy sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub mac: MeterId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub total_kwh: f64,
}

/// An observed power transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRow {
    pub mac: MeterId,
    pub status: PowerState,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Operator-assigned name and three digit number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterInfo {
    pub mac: MeterId,
    pub name: Option<String>,
    pub number: Option<u16>,
}

impl MeterInfo {
    pub fn is_unnamed(&self) -> bool {
        is_unnamed(self.name.as_deref())
    }
}

/// NULL, empty and the sentinel all mean "not named yet".
pub fn is_unnamed(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(n) => n.is_empty() || n == UNNAMED_SENTINEL,
    }
}

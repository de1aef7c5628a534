use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use convert_case::{Case, Casing};
use serde::Serialize;
use snafu::Snafu;

/// TCP port the FlashForge control protocol listens on.
pub const DEFAULT_CONTROL_PORT: u16 = 8899;

// /////////////// //
// Device identity //
// /////////////// //

/// Network identity of one configured printer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrinterEndpoint {
    pub host: String,
    pub port: u16,
}

impl PrinterEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Human-readable name used by the MQTT/Home Assistant layer.
    pub fn display_name(&self) -> String {
        format!("FlashForge {}", self.host)
    }

    /// Stable identifier usable as an MQTT topic segment or Home Assistant
    /// object id. Dots and colons in the host collapse to underscores.
    pub fn unique_id(&self) -> String {
        format!("flashforge {} {}", self.host, self.port).to_case(Case::Snake)
    }
}

impl fmt::Display for PrinterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("invalid printer address '{input}': expected host[:port]"))]
pub struct AddressParseError {
    input: String,
}

impl FromStr for PrinterEndpoint {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| AddressParseError { input: input.to_string() })?;
                (host, port)
            }
            None => (input, DEFAULT_CONTROL_PORT),
        };
        if host.is_empty() {
            return AddressParseSnafu { input }.fail();
        }
        Ok(Self::new(host, port))
    }
}

// //////// //
// Snapshot //
// //////// //

/// Outcome of one status query, produced atomically per attempt. A new query
/// replaces the previous snapshot, it never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub online: bool,
    pub printing: bool,
    /// Print job completion, 0..=100.
    pub progress: u8,
    /// Vendor fields carried verbatim; nothing here is interpreted.
    pub extra: BTreeMap<String, String>,
    pub taken_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Snapshot for a printer that answered a query.
    pub fn online(printing: bool, progress: u8, extra: BTreeMap<String, String>) -> Self {
        Self {
            online: true,
            printing,
            progress: progress.min(100),
            extra,
            taken_at: Utc::now(),
        }
    }

    /// Snapshot for an unreachable printer. Also serves as the placeholder
    /// before the first successful refresh. An offline printer is never
    /// printing.
    pub fn offline() -> Self {
        Self {
            online: false,
            printing: false,
            progress: 0,
            extra: BTreeMap::new(),
            taken_at: Utc::now(),
        }
    }
}

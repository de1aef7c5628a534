use std::time::Duration;

use serde_derive::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

use crate::printer_client::models::{AddressParseError, PrinterEndpoint};

// When changing anything here, make sure to add
// #[serde(alias = "ihavenounderscores")]
// where needed, so it can be read from the ENV vars.

#[derive(Debug, Deserialize)]
pub struct Mqtt {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    #[serde(alias = "ignoretlserrors")]
    pub ignore_tls_errors: bool,
    pub username: String,
    pub password: String,
    #[serde(alias = "clientid")]
    pub client_id: String,
    #[serde(alias = "roottopic")]
    pub root_topic: String,
    pub ha: HomeAssistant,
}

#[derive(Debug, Deserialize)]
pub struct HomeAssistant {
    #[serde(alias = "enablediscovery")]
    pub enable_discovery: bool,
    #[serde(alias = "discoverytopicprefix")]
    pub discovery_topic_prefix: String,
    #[serde(alias = "componentid")]
    pub component_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Printers {
    /// `host[:port]` entries; the port defaults to the FlashForge control
    /// port when omitted.
    pub addresses: Vec<String>,
    #[serde(alias = "scaninterval", with = "humantime_serde")]
    pub scan_interval: Duration,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub mqtt: Mqtt,
    pub printers: Printers,
    #[serde(alias = "sentrydsn")]
    pub sentry_dsn: Option<String>,
}

// ////////// //
// Validation //
// ////////// //

#[derive(Debug, Snafu)]
pub enum SettingsError {
    #[snafu(display("no printer addresses configured (set FF2M_PRINTERS_ADDRESSES)"))]
    NoPrinters,
    #[snafu(display("invalid printer address '{address}'"))]
    InvalidAddress {
        address: String,
        source: AddressParseError,
    },
    #[snafu(display("printer scan interval must be positive"))]
    ZeroScanInterval,
}

impl Printers {
    /// Validated device identities. Everything is checked here, before any
    /// coordinator exists.
    pub fn endpoints(&self) -> Result<Vec<PrinterEndpoint>, SettingsError> {
        ensure!(!self.scan_interval.is_zero(), ZeroScanIntervalSnafu);
        let addresses: Vec<_> =
            self.addresses.iter().filter(|address| !address.trim().is_empty()).collect();
        ensure!(!addresses.is_empty(), NoPrintersSnafu);
        addresses
            .into_iter()
            .map(|address| {
                address.parse().context(InvalidAddressSnafu { address: address.clone() })
            })
            .collect()
    }
}

#[cfg(test)]
impl Mqtt {
    pub fn defaults_for_tests() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            secure: false,
            ignore_tls_errors: false,
            username: String::new(),
            password: String::new(),
            client_id: "flashforge2mqtt".to_string(),
            root_topic: "flashforge2mqtt".to_string(),
            ha: HomeAssistant {
                enable_discovery: true,
                discovery_topic_prefix: "homeassistant".to_string(),
                component_id: "flashforge2mqtt".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printers(addresses: &[&str], scan_interval: Duration) -> Printers {
        Printers {
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
            scan_interval,
        }
    }

    #[test]
    fn endpoints_parse_with_and_without_ports() {
        let printers = printers(&["192.168.1.50", "guider.lan:9000"], Duration::from_secs(30));
        let endpoints = printers.endpoints().unwrap();
        assert_eq!(endpoints[0].port, 8899);
        assert_eq!(endpoints[1].host, "guider.lan");
        assert_eq!(endpoints[1].port, 9000);
    }

    #[test]
    fn an_empty_address_list_is_rejected() {
        let empty = printers(&[], Duration::from_secs(30));
        assert!(matches!(empty.endpoints(), Err(SettingsError::NoPrinters)));
        // Blank entries count as unset.
        let blanks = printers(&["", " "], Duration::from_secs(30));
        assert!(matches!(blanks.endpoints(), Err(SettingsError::NoPrinters)));
    }

    #[test]
    fn a_malformed_address_is_rejected() {
        let printers = printers(&["host:port:extra"], Duration::from_secs(30));
        assert!(matches!(printers.endpoints(), Err(SettingsError::InvalidAddress { .. })));
    }

    #[test]
    fn a_zero_scan_interval_is_rejected() {
        let printers = printers(&["192.168.1.50"], Duration::ZERO);
        assert!(matches!(printers.endpoints(), Err(SettingsError::ZeroScanInterval)));
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::models::Mqtt;
use crate::printer_client::models::{PrinterEndpoint, StatusSnapshot};

// ////// //
// Status //
// ////// //

#[derive(Debug, Serialize, Deserialize)]
pub struct MqttPrinterStatus {
    pub state: MqttPrinterState,
    pub online: bool,
    pub printing: bool,
    pub progress: u8,
    pub extra: BTreeMap<String, String>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MqttPrinterState {
    Printing,
    Online,
    Offline,
}

impl From<&StatusSnapshot> for MqttPrinterStatus {
    fn from(snapshot: &StatusSnapshot) -> Self {
        MqttPrinterStatus {
            state: match (snapshot.online, snapshot.printing) {
                (true, true) => MqttPrinterState::Printing,
                (true, false) => MqttPrinterState::Online,
                (false, _) => MqttPrinterState::Offline,
            },
            online: snapshot.online,
            printing: snapshot.printing,
            progress: snapshot.progress,
            extra: snapshot.extra.clone(),
            taken_at: snapshot.taken_at,
        }
    }
}

pub fn status_topic(root_topic: &str, endpoint: &PrinterEndpoint) -> String {
    format!("{}/{}", root_topic, endpoint.unique_id())
}

// ////////////// //
// Home Assistant //
// ////////////// //

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDiscoverySensorPayload {
    pub name: String,
    pub state_topic: String,
    pub unique_id: String,
    pub device: HomeAssistantDevice,
    pub value_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HomeAssistantDevice {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
}

fn device_for(endpoint: &PrinterEndpoint) -> HomeAssistantDevice {
    HomeAssistantDevice {
        identifiers: vec![endpoint.unique_id()],
        manufacturer: "FlashForge".to_string(),
        model: "Guider 2s".to_string(),
        name: endpoint.display_name(),
        sw_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    }
}

/// Discovery configs for one printer: a state sensor, a progress sensor and
/// an online binary sensor, all reading from the published status payload.
pub fn discovery_payloads(
    mqtt_settings: &Mqtt,
    endpoint: &PrinterEndpoint,
) -> Vec<(String, HomeAssistantDiscoverySensorPayload)> {
    let ha = &mqtt_settings.ha;
    let state_topic = status_topic(&mqtt_settings.root_topic, endpoint);
    let config_topic = |component: &str, suffix: &str| {
        format!(
            "{}/{}/{}/{}_{}/config",
            ha.discovery_topic_prefix,
            component,
            ha.component_id,
            endpoint.unique_id(),
            suffix
        )
    };

    vec![
        (
            config_topic("sensor", "state"),
            HomeAssistantDiscoverySensorPayload {
                name: format!("{} state", endpoint.display_name()),
                state_topic: state_topic.clone(),
                unique_id: format!("{}_state", endpoint.unique_id()),
                device: device_for(endpoint),
                value_template: "{{ value_json.state }}".to_string(),
                unit_of_measurement: None,
                icon: Some("mdi:printer-3d".to_string()),
                device_class: None,
            },
        ),
        (
            config_topic("sensor", "progress"),
            HomeAssistantDiscoverySensorPayload {
                name: format!("{} progress", endpoint.display_name()),
                state_topic: state_topic.clone(),
                unique_id: format!("{}_progress", endpoint.unique_id()),
                device: device_for(endpoint),
                value_template: "{{ value_json.progress }}".to_string(),
                unit_of_measurement: Some("%".to_string()),
                icon: Some("mdi:percent-circle".to_string()),
                device_class: None,
            },
        ),
        (
            config_topic("binary_sensor", "online"),
            HomeAssistantDiscoverySensorPayload {
                name: format!("{} online", endpoint.display_name()),
                state_topic,
                unique_id: format!("{}_online", endpoint.unique_id()),
                device: device_for(endpoint),
                value_template: "{{ 'ON' if value_json.online else 'OFF' }}".to_string(),
                unit_of_measurement: None,
                icon: None,
                device_class: Some("connectivity".to_string()),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> PrinterEndpoint {
        PrinterEndpoint::new("192.168.1.50", 8899)
    }

    #[test]
    fn status_state_follows_the_snapshot() {
        let printing = StatusSnapshot::online(true, 42, BTreeMap::new());
        assert_eq!(MqttPrinterStatus::from(&printing).state, MqttPrinterState::Printing);

        let idle = StatusSnapshot::online(false, 0, BTreeMap::new());
        assert_eq!(MqttPrinterStatus::from(&idle).state, MqttPrinterState::Online);

        let offline = StatusSnapshot::offline();
        assert_eq!(MqttPrinterStatus::from(&offline).state, MqttPrinterState::Offline);
    }

    #[test]
    fn status_payload_serializes_state_as_lowercase() {
        let status = MqttPrinterStatus::from(&StatusSnapshot::offline());
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"offline\""));
    }

    #[test]
    fn status_topic_uses_the_device_unique_id() {
        assert_eq!(
            status_topic("flashforge2mqtt", &endpoint()),
            "flashforge2mqtt/flashforge_192_168_1_50_8899"
        );
    }

    #[test]
    fn discovery_covers_state_progress_and_online() {
        let mqtt_settings = crate::config::models::Mqtt::defaults_for_tests();
        let payloads = discovery_payloads(&mqtt_settings, &endpoint());

        assert_eq!(payloads.len(), 3);
        let (topic, state) = &payloads[0];
        assert_eq!(
            topic,
            "homeassistant/sensor/flashforge2mqtt/flashforge_192_168_1_50_8899_state/config"
        );
        assert_eq!(state.device.manufacturer, "FlashForge");
        let (topic, progress) = &payloads[1];
        assert!(topic.contains("_progress/config"));
        assert_eq!(progress.unit_of_measurement.as_deref(), Some("%"));
        let (topic, online) = &payloads[2];
        assert!(topic.starts_with("homeassistant/binary_sensor/"));
        assert_eq!(online.device_class.as_deref(), Some("connectivity"));
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info};
use rumqttc::{tokio_rustls::rustls::ClientConfig, AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::config::models::Mqtt;
use crate::printer_client::models::PrinterEndpoint;

use super::models::discovery_payloads;
use super::tls::{system_root_store, NoopServerCertVerifier};

pub struct MqttClient {
    client: AsyncClient,
}

impl MqttClient {
    /// Connect to the broker and spawn a task driving the MQTT event loop.
    /// Messages arriving on `<root topic>/command/refresh` surface on the
    /// returned channel.
    pub fn new(mqtt_settings: &Mqtt) -> (Self, mpsc::UnboundedReceiver<()>) {
        let mut mqtt_options = MqttOptions::new(
            mqtt_settings.client_id.to_owned(),
            mqtt_settings.host.to_owned(),
            mqtt_settings.port,
        );
        if !mqtt_settings.username.is_empty() {
            mqtt_options.set_credentials(
                mqtt_settings.username.to_owned(),
                mqtt_settings.password.to_owned(),
            );
        }
        mqtt_options.set_transport(match mqtt_settings.secure {
            true => {
                let config: ClientConfig = match mqtt_settings.ignore_tls_errors {
                    // TLS without certificate verification.
                    true => ClientConfig::builder()
                        .dangerous()
                        .with_custom_certificate_verifier(Arc::new(NoopServerCertVerifier {}))
                        .with_no_client_auth(),
                    // TLS with certificate verification.
                    false => ClientConfig::builder()
                        .with_root_certificates(system_root_store().clone())
                        .with_no_client_auth(),
                };
                rumqttc::Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(Arc::new(
                    config,
                )))
            }
            // No TLS.
            false => rumqttc::Transport::tcp(),
        });
        mqtt_options.set_keep_alive(Duration::from_secs(10));

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);
        let command_topic = format!("{}/command/refresh", mqtt_settings.root_topic);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let loop_client = client.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    // The broker forgets our subscriptions between sessions,
                    // so resubscribe on every connection.
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(err) =
                            loop_client.subscribe(&command_topic, QoS::AtLeastOnce).await
                        {
                            error!("could not subscribe to {command_topic}: {err}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish)))
                        if publish.topic == command_topic =>
                    {
                        info!("refresh of all printers requested over MQTT");
                        let _ = refresh_tx.send(());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("MQTT connection error: {err}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        (Self { client }, refresh_rx)
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        Ok(self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?)
    }

    /// Retained publish, used for Home Assistant discovery configs.
    pub async fn publish_retained(&self, topic: &str, payload: &[u8]) -> Result<()> {
        Ok(self.client.publish(topic, QoS::AtLeastOnce, true, payload).await?)
    }

    pub async fn publish_home_assistant_discovery(
        &self,
        mqtt_settings: &Mqtt,
        endpoint: &PrinterEndpoint,
    ) -> Result<()> {
        for (topic, payload) in discovery_payloads(mqtt_settings, endpoint) {
            let payload = serde_json::to_string(&payload)?;
            self.publish_retained(&topic, payload.as_bytes()).await?;
        }
        Ok(())
    }
}

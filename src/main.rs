use std::sync::Arc;

use anyhow::{bail, Result};
use backon::{ExponentialBuilder, Retryable};
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

use cli::{Cli, Commands};
use coordinator::registry::PrinterRegistry;
use mqtt_client::client::MqttClient;
use mqtt_client::models::{status_topic, MqttPrinterStatus};
use printer_client::client::{FlashforgeClient, StatusSource, QUERY_TIMEOUT};
use printer_client::models::{PrinterEndpoint, StatusSnapshot};

mod cli;
mod config;
mod coordinator;
mod mqtt_client;
mod printer_client;

#[tokio::main]
async fn main() -> Result<()> {
    colog::init();

    let settings = config::loading::load_config();
    let _sentry = settings
        .sentry_dsn
        .as_deref()
        .filter(|dsn| !dsn.is_empty())
        .map(sentry::init);
    let endpoints = settings.printers.endpoints()?;

    let cli = Cli::parse();
    if let Some(Commands::Dump) = cli.command {
        return dump_statuses(&endpoints).await;
    }

    let registry = PrinterRegistry::new(Arc::new(FlashforgeClient), settings.printers.scan_interval);
    let (mqtt_client, mut refresh_requests) = MqttClient::new(&settings.mqtt);
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<(PrinterEndpoint, StatusSnapshot)>();

    let mut ready = 0;
    for endpoint in endpoints {
        let coordinator = registry.get_or_create(&endpoint);

        // A printer that is merely booting gets a few chances before we give
        // up on it for this run.
        let first = {
            let coordinator = coordinator.clone();
            (move || {
                let coordinator = coordinator.clone();
                async move { coordinator.first_refresh().await }
            })
            .retry(&ExponentialBuilder::default().with_factor(4.0))
            .await
        };
        match first {
            Ok(snapshot) => {
                info!("printer {} is ready (printing: {})", endpoint, snapshot.printing);
            }
            Err(err) => {
                error!("skipping printer for this run: {err}");
                registry.remove(&endpoint);
                continue;
            }
        }

        if settings.mqtt.ha.enable_discovery {
            mqtt_client
                .publish_home_assistant_discovery(&settings.mqtt, &endpoint)
                .await?;
        }

        let tx = status_tx.clone();
        let subscriber_endpoint = endpoint.clone();
        coordinator.subscribe(move |snapshot| {
            let _ = tx.send((subscriber_endpoint.clone(), snapshot.clone()));
        });
        let _ = status_tx.send((endpoint.clone(), coordinator.get_cached_snapshot()));

        tokio::spawn(coordinator.run());
        ready += 1;
    }

    if ready == 0 {
        bail!("none of the configured printers came up");
    }
    info!(
        "polling {} printer(s) every {}",
        ready,
        humantime::format_duration(settings.printers.scan_interval)
    );

    loop {
        tokio::select! {
            Some((endpoint, snapshot)) = status_rx.recv() => {
                let topic = status_topic(&settings.mqtt.root_topic, &endpoint);
                let payload = serde_json::to_string(&MqttPrinterStatus::from(&snapshot))?;
                if let Err(err) = mqtt_client.publish(&topic, payload.as_bytes()).await {
                    error!("could not publish to {topic}: {err:?}");
                }
            }
            Some(()) = refresh_requests.recv() => {
                registry.refresh_all().await;
            }
        }
    }
}

async fn dump_statuses(endpoints: &[PrinterEndpoint]) -> Result<()> {
    for endpoint in endpoints {
        match FlashforgeClient.query(endpoint, QUERY_TIMEOUT).await {
            Ok(snapshot) => {
                println!("{}: {}", endpoint, serde_json::to_string_pretty(&snapshot)?);
            }
            Err(err) => println!("{}: query failed: {}", endpoint, err),
        }
    }
    Ok(())
}

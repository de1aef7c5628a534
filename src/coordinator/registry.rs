//! Registry of poll coordinators, one per configured printer. Owned by the
//! application's top-level context and passed to whatever needs to look up or
//! create a coordinator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error};

use super::poll::PollCoordinator;
use crate::printer_client::client::StatusSource;
use crate::printer_client::models::PrinterEndpoint;

pub struct PrinterRegistry {
    source: Arc<dyn StatusSource>,
    poll_interval: Mutex<Duration>,
    coordinators: DashMap<PrinterEndpoint, Arc<PollCoordinator>>,
}

impl PrinterRegistry {
    pub fn new(source: Arc<dyn StatusSource>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            poll_interval: Mutex::new(poll_interval),
            coordinators: DashMap::new(),
        })
    }

    /// Fetch the coordinator for a printer, creating it on first use. One
    /// coordinator exists per configured device, shared by every consumer.
    pub fn get_or_create(&self, endpoint: &PrinterEndpoint) -> Arc<PollCoordinator> {
        let poll_interval = *self.poll_interval.lock().unwrap();
        self.coordinators
            .entry(endpoint.clone())
            .or_insert_with(|| {
                PollCoordinator::new(endpoint.clone(), Arc::clone(&self.source), poll_interval)
            })
            .value()
            .clone()
    }

    pub fn get(&self, endpoint: &PrinterEndpoint) -> Option<Arc<PollCoordinator>> {
        self.coordinators.get(endpoint).map(|entry| entry.value().clone())
    }

    /// Remove a printer and stop its timer loop.
    pub fn remove(&self, endpoint: &PrinterEndpoint) -> bool {
        match self.coordinators.remove(endpoint) {
            Some((_, coordinator)) => {
                coordinator.shutdown();
                true
            }
            None => false,
        }
    }

    /// Refresh every known printer at once. Printers refresh independently;
    /// one unreachable device never blocks or fails the others.
    pub async fn refresh_all(&self) {
        let coordinators: Vec<_> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let tasks: Vec<_> = coordinators
            .into_iter()
            .map(|coordinator| {
                tokio::spawn(async move {
                    let snapshot = coordinator.force_refresh().await;
                    debug!(
                        "refreshed printer {}: online={}",
                        coordinator.endpoint(),
                        snapshot.online
                    );
                })
            })
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                error!("refresh task failed: {err}");
            }
        }
    }

    /// Replace every coordinator with a freshly configured one. Existing
    /// coordinators are shut down, never mutated; callers re-run startup
    /// (first refresh, timer spawn) on the returned set.
    pub fn reload(
        &self,
        endpoints: &[PrinterEndpoint],
        poll_interval: Duration,
    ) -> Vec<Arc<PollCoordinator>> {
        *self.poll_interval.lock().unwrap() = poll_interval;
        for entry in self.coordinators.iter() {
            entry.value().shutdown();
        }
        self.coordinators.clear();
        endpoints.iter().map(|endpoint| self.get_or_create(endpoint)).collect()
    }
}

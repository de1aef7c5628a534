//! Per-printer polling: a cached snapshot, a cancellable refresh timer, and
//! coalescing of concurrent refresh requests into one device query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use snafu::Snafu;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::printer_client::client::{QueryError, StatusSource, QUERY_TIMEOUT};
use crate::printer_client::models::{PrinterEndpoint, StatusSnapshot};

// ////// //
// Errors //
// ////// //

/// Failure of the very first refresh. Later failures degrade the cached
/// snapshot to offline instead; a device that has never answered has no
/// meaningful cached state to degrade to, so the caller gets told and is
/// expected to retry setup later.
#[derive(Debug, Snafu)]
pub enum FirstRefreshError {
    #[snafu(display("printer {endpoint} is not ready: {cause}"))]
    NotReady {
        endpoint: PrinterEndpoint,
        cause: Arc<QueryError>,
    },
    #[snafu(display("first refresh task for printer {endpoint} stopped unexpectedly"))]
    RefreshTaskStopped { endpoint: PrinterEndpoint },
}

// /////////// //
// Coordinator //
// /////////// //

type Listener = Box<dyn Fn(&StatusSnapshot) + Send + Sync>;
type FetchOutcome = Result<StatusSnapshot, Arc<QueryError>>;

/// Handle returned by [`PollCoordinator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct CoordinatorState {
    cached: Option<StatusSnapshot>,
    last_success: Option<DateTime<Utc>>,
    /// Receiver for the fetch currently in flight, if any. The sole piece of
    /// shared mutable refresh state: at most one query runs per printer.
    in_flight: Option<watch::Receiver<Option<FetchOutcome>>>,
}

/// Owns the cache, timer, and refresh de-duplication for one printer.
///
/// Every refresh path (timer tick, explicit request, first refresh) funnels
/// through the same single-flight fetch, so overlapping callers share one
/// network exchange and observe the same outcome.
pub struct PollCoordinator {
    endpoint: PrinterEndpoint,
    source: Arc<dyn StatusSource>,
    query_timeout: Duration,
    interval: watch::Sender<Duration>,
    cancel: CancellationToken,
    state: Mutex<CoordinatorState>,
    subscribers: Mutex<HashMap<SubscriptionId, Listener>>,
    next_subscription: AtomicU64,
}

impl PollCoordinator {
    pub fn new(
        endpoint: PrinterEndpoint,
        source: Arc<dyn StatusSource>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (interval, _) = watch::channel(poll_interval);
        Arc::new(Self {
            endpoint,
            source,
            query_timeout: QUERY_TIMEOUT,
            interval,
            cancel: CancellationToken::new(),
            state: Mutex::new(CoordinatorState {
                cached: None,
                last_success: None,
                in_flight: None,
            }),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
        })
    }

    pub fn endpoint(&self) -> &PrinterEndpoint {
        &self.endpoint
    }

    pub fn poll_interval(&self) -> Duration {
        *self.interval.borrow()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_success
    }

    /// Last known snapshot, or the offline placeholder before the first
    /// successful refresh. Never blocks, never touches the network.
    pub fn get_cached_snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().unwrap();
        state.cached.clone().unwrap_or_else(StatusSnapshot::offline)
    }

    /// Register a callback invoked after every snapshot update, success or
    /// degrade. Callbacks run on the fetch task and should hand off quickly.
    pub fn subscribe(
        &self,
        listener: impl Fn(&StatusSnapshot) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().unwrap().insert(id, Box::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Refresh the snapshot, joining an already-running fetch if one is in
    /// flight. Failures never surface here: after the first success they
    /// degrade the cache to offline, and the degraded snapshot is returned.
    pub async fn request_refresh(self: &Arc<Self>) -> StatusSnapshot {
        match self.await_fetch().await {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(_)) => self.get_cached_snapshot(),
            None => {
                error!(
                    "refresh task for printer {} stopped without reporting a result",
                    self.endpoint
                );
                self.get_cached_snapshot()
            }
        }
    }

    /// Same as [`request_refresh`](Self::request_refresh); the entry point
    /// used by refresh-all, where each printer's outcome stays independent.
    pub async fn force_refresh(self: &Arc<Self>) -> StatusSnapshot {
        self.request_refresh().await
    }

    /// One-time startup refresh. Unlike later refreshes this reports failure
    /// to the caller instead of degrading, and caches nothing on failure.
    pub async fn first_refresh(self: &Arc<Self>) -> Result<StatusSnapshot, FirstRefreshError> {
        match self.await_fetch().await {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(cause)) => {
                NotReadySnafu { endpoint: self.endpoint.clone(), cause }.fail()
            }
            None => RefreshTaskStoppedSnafu { endpoint: self.endpoint.clone() }.fail(),
        }
    }

    /// Replace the poll interval. The pending timer is abandoned and the next
    /// automatic refresh fires one new interval from now.
    pub fn set_interval(&self, interval: Duration) {
        info!(
            "printer {}: poll interval set to {}",
            self.endpoint,
            humantime::format_duration(interval)
        );
        self.interval.send_replace(interval);
    }

    /// Stop the timer loop. A fetch already in flight still completes and
    /// updates the cache, but nothing further is scheduled.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Timer loop: sleep one interval, refresh, repeat. Runs until
    /// [`shutdown`](Self::shutdown). An interval change drops the pending
    /// sleep and rebuilds it, so two timers never coexist.
    pub async fn run(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let mut interval_rx = self.interval.subscribe();
        loop {
            let delay = *interval_rx.borrow_and_update();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    self.request_refresh().await;
                }
            }
        }
        debug!("poll loop for printer {} stopped", self.endpoint);
    }

    async fn await_fetch(self: &Arc<Self>) -> Option<FetchOutcome> {
        let mut rx = self.join_or_start_fetch();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome
    }

    /// Join the in-flight fetch if one exists, otherwise spawn a new fetch
    /// task. The fetch runs detached so joiners never depend on the caller
    /// that started it staying alive.
    fn join_or_start_fetch(self: &Arc<Self>) -> watch::Receiver<Option<FetchOutcome>> {
        let mut state = self.state.lock().unwrap();
        if let Some(rx) = &state.in_flight {
            if rx.has_changed().is_ok() {
                return rx.clone();
            }
            // Sender gone without an outcome: the fetch task died.
            warn!(
                "previous refresh task for printer {} vanished, starting a new fetch",
                self.endpoint
            );
        }
        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(rx.clone());
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_fetch(tx).await;
        });
        rx
    }

    async fn run_fetch(self: Arc<Self>, tx: watch::Sender<Option<FetchOutcome>>) {
        let result = self.source.query(&self.endpoint, self.query_timeout).await;
        let (outcome, to_notify): (FetchOutcome, Option<StatusSnapshot>) = {
            let mut state = self.state.lock().unwrap();
            state.in_flight = None;
            match result {
                Ok(snapshot) => {
                    state.cached = Some(snapshot.clone());
                    state.last_success = Some(snapshot.taken_at);
                    (Ok(snapshot.clone()), Some(snapshot))
                }
                Err(err) => {
                    log_query_failure(&self.endpoint, &err);
                    let err = Arc::new(err);
                    if state.last_success.is_some() {
                        let degraded = StatusSnapshot::offline();
                        state.cached = Some(degraded.clone());
                        (Err(err), Some(degraded))
                    } else {
                        // Never answered yet: leave the cache empty so the
                        // failure stays visible to first_refresh callers.
                        (Err(err), None)
                    }
                }
            }
        };
        tx.send_replace(Some(outcome));
        if let Some(snapshot) = to_notify {
            let subscribers = self.subscribers.lock().unwrap();
            for listener in subscribers.values() {
                listener(&snapshot);
            }
        }
    }
}

fn log_query_failure(endpoint: &PrinterEndpoint, err: &QueryError) {
    match err {
        QueryError::Network { source, .. } => {
            warn!("printer {endpoint} is unreachable: {source}");
        }
        QueryError::Timeout { after, .. } => {
            warn!("printer {endpoint} did not answer within {after:?}");
        }
        QueryError::Protocol { reason, .. } => {
            warn!("printer {endpoint} sent an unparseable response: {reason}");
        }
    }
}

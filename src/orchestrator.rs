//! Glue between the scanner and the trip.
//!
//! [`ScanOrchestrator`] listens to the [`BeaconScanner`], rate-limits what it
//! hears to one detection per forward window, hands each forwarded detection to
//! the [`TripLifecycle`] (when riding) and to local subscribers, and reports
//! whether the beacon is currently in range.

use crate::measurement::BeaconDetectionEvent;
use crate::scanner::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, BeaconScanner, ScanError};
use crate::trip::TripLifecycle;
use log::{debug, info};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Capacity of the local detection broadcast.
pub const BROADCAST_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Receives beacon link transitions.
pub trait StatusSink: Send + Sync {
    fn link_status(&self, status: LinkStatus);
}

/// Writes link transitions to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn link_status(&self, status: LinkStatus) {
        match status {
            LinkStatus::Connected => info!("beacon in range"),
            LinkStatus::Disconnected => info!("beacon out of range"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// At most one detection is forwarded per window.
    pub forward_window: Duration,
    /// The link counts as connected while a detection was forwarded this recently.
    pub link_timeout: Duration,
    pub status_check_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            forward_window: Duration::from_secs(10),
            link_timeout: Duration::from_secs(15),
            status_check_interval: Duration::from_secs(1),
        }
    }
}

struct Link {
    sink: Arc<dyn StatusSink>,
    timeout: Duration,
    state: Mutex<LinkState>,
}

struct LinkState {
    status: LinkStatus,
    last_forwarded: Option<Instant>,
}

impl Link {
    fn forwarded(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_forwarded = Some(now);
        if state.status != LinkStatus::Connected {
            state.status = LinkStatus::Connected;
            drop(state);
            self.sink.link_status(LinkStatus::Connected);
        }
    }

    fn check(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = state
            .last_forwarded
            .is_some_and(|t| now.saturating_duration_since(t) < self.timeout);
        if !fresh && state.status == LinkStatus::Connected {
            state.status = LinkStatus::Disconnected;
            drop(state);
            self.sink.link_status(LinkStatus::Disconnected);
        }
    }

    fn reset(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            LinkState {
                status: LinkStatus::Disconnected,
                last_forwarded: None,
            },
        );
        if previous.status == LinkStatus::Connected {
            self.sink.link_status(LinkStatus::Disconnected);
        }
    }
}

struct Tasks {
    forwarder: JoinHandle<()>,
    status: JoinHandle<()>,
}

pub struct ScanOrchestrator {
    scanner: Arc<BeaconScanner>,
    trips: Option<Arc<TripLifecycle>>,
    settings: OrchestratorSettings,
    link: Arc<Link>,
    detections: broadcast::Sender<BeaconDetectionEvent>,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

impl ScanOrchestrator {
    /// `trips` is `None` when detections are only published locally.
    pub fn new(
        scanner: Arc<BeaconScanner>,
        trips: Option<Arc<TripLifecycle>>,
        sink: Arc<dyn StatusSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (detections, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            scanner,
            trips,
            settings,
            link: Arc::new(Link {
                sink,
                timeout: settings.link_timeout,
                state: Mutex::new(LinkState {
                    status: LinkStatus::Disconnected,
                    last_forwarded: None,
                }),
            }),
            detections,
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    /// Receive every forwarded detection.
    pub fn subscribe(&self) -> broadcast::Receiver<BeaconDetectionEvent> {
        self.detections.subscribe()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Attach to the scanner and start it. No-op if already running.
    pub async fn start(&self) -> Result<(), ScanError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            debug!("orchestrator already running");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
        self.scanner.attach(tx);
        self.scanner.start().await?;

        let forwarder = tokio::spawn(forward(
            rx,
            self.settings.forward_window,
            self.trips.clone(),
            Arc::clone(&self.link),
            self.detections.clone(),
        ));
        let status = tokio::spawn(watch_link(
            Arc::clone(&self.link),
            self.settings.status_check_interval,
        ));
        *tasks = Some(Tasks { forwarder, status });
        info!("orchestrator started");
        Ok(())
    }

    /// Cancel timers, stop the scanner, then report the link as down if it was up.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        tasks.forwarder.abort();
        tasks.status.abort();
        self.scanner.stop().await;
        self.link.reset();
        info!("orchestrator stopped");
    }
}

async fn forward(
    mut rx: mpsc::Receiver<BeaconDetectionEvent>,
    window: Duration,
    trips: Option<Arc<TripLifecycle>>,
    link: Arc<Link>,
    detections: broadcast::Sender<BeaconDetectionEvent>,
) {
    let mut last_forward: Option<Instant> = None;
    while let Some(event) = rx.recv().await {
        let now = Instant::now();
        if last_forward.is_some_and(|t| now.saturating_duration_since(t) < window) {
            continue;
        }
        last_forward = Some(now);
        link.forwarded(now);

        match &trips {
            Some(trips) => {
                let outcome = trips.ingest(&event);
                debug!("forwarded {} = {} ({outcome:?})", event.kind, event.value);
            }
            None => debug!("forwarded {} = {}", event.kind, event.value),
        }
        // No local subscribers is fine.
        let _ = detections.send(event);
    }
}

async fn watch_link(link: Arc<Link>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        link.check(Instant::now());
    }
}

//! GPS odometer.
//!
//! [`DistanceSession`] holds the filtering rules and the running total;
//! [`DistanceAccumulator`] wires a session to a [`LocationSource`] and reports
//! progress on a channel.

use crate::location::{FixRequest, LocationSource, PositionFix};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the distance event channel.
pub const DISTANCE_CHANNEL_BUFFER_SIZE: usize = 32;

/// Filtering thresholds and fix cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceSettings {
    /// Fixes with an accuracy radius at or above this are ignored.
    pub max_accuracy_m: f64,
    /// Movements at or below this are treated as GPS jitter.
    pub min_delta_m: f64,
    pub fix_interval: Duration,
}

impl Default for DistanceSettings {
    fn default() -> Self {
        Self {
            max_accuracy_m: 15.0,
            min_delta_m: 5.0,
            fix_interval: Duration::from_secs(2),
        }
    }
}

/// Why a fix did not add distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Inaccurate,
    ProviderChanged,
    BelowNoiseFloor,
}

/// Result of feeding one fix into a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixOutcome {
    /// First fix of the session; contributes nothing.
    Baseline,
    Accepted { delta_m: f64, total_m: f64 },
    Rejected(RejectReason),
}

/// Accumulated distance for one tracking session.
#[derive(Debug)]
pub struct DistanceSession {
    settings: DistanceSettings,
    total_m: f64,
    last_accepted: Option<PositionFix>,
    started_at: SystemTime,
}

impl DistanceSession {
    pub fn new(settings: DistanceSettings) -> Self {
        Self {
            settings,
            total_m: 0.0,
            last_accepted: None,
            started_at: SystemTime::now(),
        }
    }

    pub fn total_m(&self) -> f64 {
        self.total_m
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn last_accepted(&self) -> Option<&PositionFix> {
        self.last_accepted.as_ref()
    }

    pub fn record(&mut self, fix: PositionFix) -> FixOutcome {
        let Some(last) = &self.last_accepted else {
            self.last_accepted = Some(fix);
            return FixOutcome::Baseline;
        };

        if fix.accuracy_m >= self.settings.max_accuracy_m {
            return FixOutcome::Rejected(RejectReason::Inaccurate);
        }
        if fix.provider != last.provider {
            return FixOutcome::Rejected(RejectReason::ProviderChanged);
        }
        let delta_m = last.position.distance_to(&fix.position);
        if delta_m <= self.settings.min_delta_m {
            return FixOutcome::Rejected(RejectReason::BelowNoiseFloor);
        }

        self.total_m += delta_m;
        self.last_accepted = Some(fix);
        FixOutcome::Accepted {
            delta_m,
            total_m: self.total_m,
        }
    }

    pub fn reset(&mut self) {
        self.total_m = 0.0;
        self.last_accepted = None;
        self.started_at = SystemTime::now();
    }
}

/// Progress notifications from a [`DistanceAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistanceEvent {
    /// Running total in meters.
    Updated(f64),
    /// Final total; emitted once per `stop()`.
    Stopped(f64),
}

struct Feed {
    task: JoinHandle<()>,
}

/// Drives a [`DistanceSession`] from a [`LocationSource`].
pub struct DistanceAccumulator {
    source: Arc<dyn LocationSource>,
    settings: DistanceSettings,
    session: Arc<Mutex<DistanceSession>>,
    feed: Mutex<Option<Feed>>,
    events: mpsc::Sender<DistanceEvent>,
}

impl DistanceAccumulator {
    pub fn new(
        source: Arc<dyn LocationSource>,
        settings: DistanceSettings,
    ) -> (Self, mpsc::Receiver<DistanceEvent>) {
        let (events, rx) = mpsc::channel(DISTANCE_CHANNEL_BUFFER_SIZE);
        let accumulator = Self {
            source,
            settings,
            session: Arc::new(Mutex::new(DistanceSession::new(settings))),
            feed: Mutex::new(None),
            events,
        };
        (accumulator, rx)
    }

    pub fn is_running(&self) -> bool {
        self.feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn total_m(&self) -> f64 {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_m()
    }

    /// Start tracking. No-op if already running or if positioning is unavailable.
    pub fn start(&self) {
        let mut feed = self.feed.lock().unwrap_or_else(PoisonError::into_inner);
        if feed.is_some() {
            debug!("distance tracking already running");
            return;
        }

        let request = FixRequest {
            interval: self.settings.fix_interval,
            high_accuracy: true,
        };
        let mut fixes = match self.source.subscribe(request) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("distance tracking not started: {e}");
                return;
            }
        };

        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        emit(&self.events, DistanceEvent::Updated(0.0));

        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(fix) = fixes.recv().await {
                let outcome = session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(fix);
                match outcome {
                    FixOutcome::Accepted { delta_m, total_m } => {
                        debug!("distance +{delta_m:.1} m, total {total_m:.1} m");
                        emit(&events, DistanceEvent::Updated(total_m));
                    }
                    FixOutcome::Baseline => debug!("distance baseline fix recorded"),
                    FixOutcome::Rejected(reason) => debug!("fix ignored: {reason:?}"),
                }
            }
            debug!("position fix stream ended");
        });

        *feed = Some(Feed { task });
        info!("distance tracking started");
    }

    /// Stop tracking, emit the final total and reset. Second call is a no-op.
    pub fn stop(&self) {
        let Some(feed) = self
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        feed.task.abort();
        self.source.unsubscribe();

        let total = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let total = session.total_m();
            session.reset();
            total
        };
        emit(&self.events, DistanceEvent::Stopped(total));
        info!("distance tracking stopped after {total:.1} m");
    }
}

impl Drop for DistanceAccumulator {
    fn drop(&mut self) {
        if let Some(feed) = self
            .feed
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            feed.task.abort();
        }
    }
}

fn emit(events: &mpsc::Sender<DistanceEvent>, event: DistanceEvent) {
    if let Err(e) = events.try_send(event) {
        debug!("distance event dropped: {e}");
    }
}

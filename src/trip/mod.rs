//! Trip lifecycle synchronized with the remote trip service.
//!
//! A trip is created remotely in two steps (create, then fetch the plate that
//! belongs to it) before measurements can be stored against it. While active
//! the plate status is refreshed by a heartbeat. Finalizing always returns the
//! local state to idle, whatever the remote side says.

#[cfg(feature = "http")]
pub mod http;
pub mod remote;

pub use remote::{
    BikeStatus, BikeStatusUpdate, MeasurementRecord, NewTrip, PlateStatus, PlateStatusUpdate,
    RemoteError, RemoteFuture, TripClosure, TripCreated, TripDetails, TripService,
};

use crate::distance::DistanceAccumulator;
use crate::location::{DEFAULT_FALLBACK, LocationSource, Position, resolve_position};
use crate::measurement::{BeaconDetectionEvent, MeasurementKind};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TripError {
    #[error("bike id must not be empty")]
    MissingBikeId,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("finalize-trip did not answer within {0:?}")]
    FinalizeTimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TripState {
    #[default]
    Idle,
    Starting,
    AwaitingPlate,
    Active,
    Finalizing,
}

/// Local view of the current trip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trip {
    pub state: TripState,
    /// Assigned by the remote service after creation.
    pub id: Option<String>,
    pub bike_id: Option<String>,
    /// Fetched once the trip exists remotely.
    pub plate_id: Option<String>,
    pub origin: Option<Position>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripSettings {
    /// Identity of the rider the trip is billed to.
    pub rider_id: String,
    pub fallback_position: Position,
    pub heartbeat_interval: Duration,
    pub retry_delay: Duration,
    pub finalize_timeout: Duration,
}

impl Default for TripSettings {
    fn default() -> Self {
        Self {
            rider_id: String::new(),
            fallback_position: DEFAULT_FALLBACK,
            heartbeat_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(3),
            finalize_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a detection was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownKind,
    NotActive,
    /// The plate was still unknown when the retry fired.
    StillIncomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Sent,
    RetryScheduled,
    Dropped(DropReason),
}

struct Inner {
    trip: Trip,
    /// Bumped on every start and finalize; continuations from an older
    /// generation are discarded.
    generation: u64,
    startup: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    retries: JoinSet<()>,
}

impl Inner {
    fn cancel_tasks(&mut self) {
        if let Some(task) = self.startup.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        self.retries.abort_all();
        self.retries.detach_all();
    }

    /// Drop the handles of retries that already ran.
    fn reap_retries(&mut self) {
        while self.retries.try_join_next().is_some() {}
    }
}

struct Shared {
    service: Arc<dyn TripService>,
    location: Arc<dyn LocationSource>,
    distance: Option<Arc<DistanceAccumulator>>,
    settings: TripSettings,
    inner: Mutex<Inner>,
}

/// Owns the one trip of a rider session.
pub struct TripLifecycle {
    shared: Arc<Shared>,
}

impl TripLifecycle {
    pub fn new(
        service: Arc<dyn TripService>,
        location: Arc<dyn LocationSource>,
        settings: TripSettings,
    ) -> Self {
        Self::build(service, location, None, settings)
    }

    /// Like [`TripLifecycle::new`], also starting and stopping `distance`
    /// with the trip.
    pub fn with_distance(
        service: Arc<dyn TripService>,
        location: Arc<dyn LocationSource>,
        distance: Arc<DistanceAccumulator>,
        settings: TripSettings,
    ) -> Self {
        Self::build(service, location, Some(distance), settings)
    }

    fn build(
        service: Arc<dyn TripService>,
        location: Arc<dyn LocationSource>,
        distance: Option<Arc<DistanceAccumulator>>,
        settings: TripSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                location,
                distance,
                settings,
                inner: Mutex::new(Inner {
                    trip: Trip::default(),
                    generation: 0,
                    startup: None,
                    heartbeat: None,
                    retries: JoinSet::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> TripState {
        self.shared.lock().trip.state
    }

    /// Snapshot of the current trip.
    pub fn trip(&self) -> Trip {
        self.shared.lock().trip.clone()
    }

    /// Begin a trip for `bike_id`, finalizing any trip in progress first.
    ///
    /// Returns once the trip is `Starting`; the remote creation chain runs in
    /// the background.
    pub async fn start(&self, bike_id: &str) -> Result<(), TripError> {
        let bike_id = bike_id.trim();
        if bike_id.is_empty() {
            return Err(TripError::MissingBikeId);
        }

        if self.state() != TripState::Idle {
            info!("finalizing current trip before starting a new one");
            if let Err(e) = self.finalize().await {
                warn!("previous trip finalized with error: {e}");
            }
        }

        let shared = &self.shared;
        let mut inner = shared.lock();
        inner.generation += 1;
        let generation = inner.generation;

        let request = NewTrip {
            rider_id: shared.settings.rider_id.clone(),
            bike_id: bike_id.to_string(),
            start_time: Utc::now(),
            origin: shared.position(),
        };
        inner.trip = Trip {
            state: TripState::Starting,
            bike_id: Some(request.bike_id.clone()),
            origin: Some(request.origin),
            started_at: Some(request.start_time),
            ..Trip::default()
        };
        inner.startup = Some(tokio::spawn(Arc::clone(shared).run_startup(generation, request)));
        info!("starting trip for bike {bike_id}");
        Ok(())
    }

    /// Store a detection against the active trip.
    pub fn ingest(&self, event: &BeaconDetectionEvent) -> IngestOutcome {
        self.shared.ingest(event, None)
    }

    /// Close the current trip and return to `Idle`.
    ///
    /// Local state is cleared whatever the remote outcome; the error only
    /// reports what the trip service said. No-op when idle.
    pub async fn finalize(&self) -> Result<(), TripError> {
        let shared = &self.shared;
        let (generation, trip) = {
            let mut inner = shared.lock();
            match inner.trip.state {
                TripState::Idle => {
                    debug!("no trip to finalize");
                    return Ok(());
                }
                TripState::Finalizing => {
                    debug!("trip already finalizing");
                    return Ok(());
                }
                _ => {}
            }
            inner.generation += 1;
            inner.cancel_tasks();
            inner.trip.state = TripState::Finalizing;
            (inner.generation, inner.trip.clone())
        };

        if let Some(distance) = &shared.distance {
            distance.stop();
        }

        let destination = shared.position();
        let result = match trip.id.clone() {
            Some(trip_id) => {
                let closure = TripClosure {
                    trip_id,
                    end_time: Utc::now(),
                    destination,
                };
                let timeout = shared.settings.finalize_timeout;
                match tokio::time::timeout(timeout, shared.service.finalize_trip(closure)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TripError::Remote(e)),
                    Err(_) => Err(TripError::FinalizeTimedOut(timeout)),
                }
            }
            None => {
                debug!("trip was never created remotely");
                Ok(())
            }
        };

        {
            let mut inner = shared.lock();
            if inner.generation == generation {
                inner.trip = Trip::default();
            }
        }

        match &result {
            Ok(()) if trip.id.is_some() => {
                info!("trip finalized");
                if let Some(bike_id) = trip.bike_id {
                    shared
                        .report_bike_status(bike_id, BikeStatus::Parked, destination)
                        .await;
                }
            }
            Ok(()) => {}
            Err(e) => error!("failed to finalize trip remotely, local state cleared: {e}"),
        }
        result
    }
}

impl Drop for TripLifecycle {
    fn drop(&mut self) {
        self.shared.lock().cancel_tasks();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position(&self) -> Position {
        resolve_position(self.location.as_ref(), self.settings.fallback_position)
    }

    /// Apply `f` to the trip if `generation` is still current.
    fn advance(&self, generation: u64, f: impl FnOnce(&mut Inner)) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("discarding result from superseded trip");
            return false;
        }
        f(&mut inner);
        true
    }

    fn fault(&self, generation: u64) {
        self.advance(generation, |inner| {
            inner.trip = Trip::default();
            inner.startup = None;
        });
    }

    async fn run_startup(self: Arc<Self>, generation: u64, request: NewTrip) {
        let bike_id = request.bike_id.clone();

        let trip_id = match self.service.create_trip(request).await {
            Ok(created) => created.trip_id,
            Err(e) => {
                error!("create-trip failed: {e}");
                self.fault(generation);
                return;
            }
        };
        let advanced = self.advance(generation, |inner| {
            inner.trip.id = Some(trip_id.clone());
            inner.trip.state = TripState::AwaitingPlate;
        });
        if !advanced {
            return;
        }
        info!("trip {trip_id} created");

        let plate_id = match self.service.trip_details(trip_id.clone()).await {
            Ok(details) => details.plate_id,
            Err(e) => {
                error!("get-trip-details failed for trip {trip_id}: {e}");
                self.fault(generation);
                return;
            }
        };
        let shared = Arc::clone(&self);
        let advanced = self.advance(generation, |inner| {
            inner.trip.plate_id = Some(plate_id.clone());
            inner.trip.state = TripState::Active;
            let heartbeat = shared.run_heartbeat(generation, plate_id.clone());
            inner.heartbeat = Some(tokio::spawn(heartbeat));
            if let Some(distance) = &self.distance {
                distance.start();
            }
        });
        if !advanced {
            return;
        }
        info!("trip {trip_id} active with plate {plate_id}");

        let position = self.position();
        self.report_bike_status(bike_id, BikeStatus::InUse, position)
            .await;
    }

    async fn run_heartbeat(self: Arc<Self>, generation: u64, plate_id: String) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !self.advance(generation, |inner| inner.trip.last_heartbeat = Some(now)) {
                return;
            }
            let update = PlateStatusUpdate {
                plate_id: plate_id.clone(),
                status: PlateStatus::Active,
                updated_at: now,
            };
            match self.service.update_plate_status(update).await {
                Ok(()) => debug!("plate {plate_id} heartbeat sent"),
                Err(e) => warn!("plate heartbeat failed: {e}"),
            }
        }
    }

    async fn report_bike_status(&self, bike_id: String, status: BikeStatus, position: Position) {
        let update = BikeStatusUpdate {
            bike_id,
            status,
            position,
        };
        if let Err(e) = self.service.update_bike_status(update).await {
            warn!("update-bike-status {status:?} failed: {e}");
        }
    }

    /// `retry_of` carries the generation of the first attempt when this is
    /// the one permitted retry.
    fn ingest(
        self: &Arc<Self>,
        event: &BeaconDetectionEvent,
        retry_of: Option<u64>,
    ) -> IngestOutcome {
        if event.kind == MeasurementKind::Unknown {
            debug!(
                "dropping measurement with unknown kind (code {})",
                event.frame.measurement_code()
            );
            return IngestOutcome::Dropped(DropReason::UnknownKind);
        }

        let mut inner = self.lock();
        if retry_of.is_some_and(|generation| generation != inner.generation) {
            return IngestOutcome::Dropped(DropReason::NotActive);
        }

        let trip = &inner.trip;
        let ids = (trip.id.clone(), trip.plate_id.clone(), trip.bike_id.is_some());
        match (trip.state, ids) {
            (TripState::Active, (Some(trip_id), Some(plate_id), true)) => {
                let record = MeasurementRecord {
                    trip_id,
                    plate_id,
                    kind: event.kind,
                    value: event.value,
                    timestamp: Utc::now(),
                    position: self.position(),
                };
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let (kind, value) = (record.kind, record.value);
                    match shared.service.save_measurement(record).await {
                        Ok(()) => debug!("stored {kind} = {value}"),
                        Err(e) => warn!("save-measurement failed: {e}"),
                    }
                });
                IngestOutcome::Sent
            }
            (_, (Some(_), None, _)) if retry_of.is_none() => {
                debug!(
                    "plate not known yet, retrying measurement in {:?}",
                    self.settings.retry_delay
                );
                let generation = inner.generation;
                let delay = self.settings.retry_delay;
                let shared = Arc::clone(self);
                let event = event.clone();
                inner.reap_retries();
                inner.retries.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let outcome = shared.ingest(&event, Some(generation));
                    debug!("measurement retry: {outcome:?}");
                });
                IngestOutcome::RetryScheduled
            }
            (_, (Some(_), None, _)) => {
                warn!("plate still unknown, measurement dropped");
                IngestOutcome::Dropped(DropReason::StillIncomplete)
            }
            _ => IngestOutcome::Dropped(DropReason::NotActive),
        }
    }
}

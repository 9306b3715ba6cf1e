use crate::location::{FixRequest, LocationError, LocationSource, Position, PositionFix};
use crate::mac_address::MacAddress;
use crate::scanner::{Radio, RadioFuture, RawAdvertisement, ScanError};
use crate::trip::{
    BikeStatusUpdate, MeasurementRecord, NewTrip, PlateStatusUpdate, RemoteError, RemoteFuture,
    TripClosure, TripCreated, TripDetails, TripService,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::{Semaphore, mpsc};

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A stable beacon UUID for unit tests.
pub const TEST_UUID: [u8; 16] = [
    0xE2, 0xC5, 0x6D, 0xB5, 0xDF, 0xFB, 0x48, 0xD2, 0xB0, 0x60, 0xD0, 0xF5, 0xA7, 0x10, 0x96, 0xE0,
];

/// Build a 30-byte iBeacon scan record.
pub fn ibeacon_record(uuid: [u8; 16], major: u16, minor: u16, tx_power: i8) -> Vec<u8> {
    let mut record = vec![0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15];
    record.extend_from_slice(&uuid);
    record.extend_from_slice(&major.to_be_bytes());
    record.extend_from_slice(&minor.to_be_bytes());
    record.push(tx_power as u8);
    record
}

/// A raw advertisement from [`TEST_MAC`] without a name.
pub fn advertisement(record: Vec<u8>) -> RawAdvertisement {
    RawAdvertisement {
        address: TEST_MAC,
        name: None,
        rssi: -60,
        record,
        timestamp: SystemTime::UNIX_EPOCH,
    }
}

/// The point `meters` due north of `origin`.
pub fn north_of(origin: Position, meters: f64) -> Position {
    let meters_per_degree = crate::location::EARTH_RADIUS_M.to_radians();
    Position::new(origin.lat + meters / meters_per_degree, origin.lon)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable positioning provider.
#[derive(Default)]
pub struct FakeLocation {
    unavailable: bool,
    current: Mutex<Option<Position>>,
    last_known: Mutex<Option<Position>>,
    fixes: Mutex<Option<mpsc::Sender<PositionFix>>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl FakeLocation {
    /// A provider that refuses every subscription.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn set_current(&self, position: Option<Position>) {
        *lock(&self.current) = position;
    }

    pub fn set_last_known(&self, position: Option<Position>) {
        *lock(&self.last_known) = position;
    }

    /// Deliver a fix to the live subscription, if any.
    pub async fn push_fix(&self, fix: PositionFix) {
        let tx = lock(&self.fixes).clone();
        if let Some(tx) = tx {
            let _ = tx.send(fix).await;
        }
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

impl LocationSource for FakeLocation {
    fn subscribe(
        &self,
        _request: FixRequest,
    ) -> Result<mpsc::Receiver<PositionFix>, LocationError> {
        if self.unavailable {
            return Err(LocationError::PermissionDenied);
        }
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        *lock(&self.fixes) = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&self) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.fixes) = None;
    }

    fn current(&self) -> Option<Position> {
        *lock(&self.current)
    }

    fn last_known(&self) -> Option<Position> {
        *lock(&self.last_known)
    }
}

/// Radio that delivers whatever the test emits.
#[derive(Default)]
pub struct FakeRadio {
    unavailable: bool,
    session: Mutex<Option<mpsc::Sender<RawAdvertisement>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeRadio {
    /// A radio whose `start_scan` always fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Deliver an advertisement to the current scan session, if any.
    pub async fn emit(&self, adv: RawAdvertisement) {
        let tx = lock(&self.session).clone();
        if let Some(tx) = tx {
            let _ = tx.send(adv).await;
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Radio for FakeRadio {
    fn start_scan(&self) -> RadioFuture<'_, mpsc::Receiver<RawAdvertisement>> {
        Box::pin(async move {
            if self.unavailable {
                return Err(ScanError::RadioUnavailable("adapter powered off".into()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            *lock(&self.session) = Some(tx);
            Ok(rx)
        })
    }

    fn stop_scan(&self) -> RadioFuture<'_, ()> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *lock(&self.session) = None;
            Ok(())
        })
    }
}

/// A call received by [`FakeTripService`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    CreateTrip(NewTrip),
    TripDetails(String),
    BikeStatus(BikeStatusUpdate),
    PlateStatus(PlateStatusUpdate),
    SaveMeasurement(MeasurementRecord),
    FinalizeTrip(TripClosure),
}

/// Trip service that records every call and answers `trip-1` / `plate-1`.
pub struct FakeTripService {
    calls: Mutex<Vec<RemoteCall>>,
    fail_create: AtomicBool,
    fail_finalize: AtomicBool,
    hang_finalize: AtomicBool,
    hold_details: AtomicBool,
    details_gate: Semaphore,
}

impl Default for FakeTripService {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
            hang_finalize: AtomicBool::new(false),
            hold_details: AtomicBool::new(false),
            details_gate: Semaphore::new(0),
        }
    }
}

impl FakeTripService {
    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_finalize(&self) {
        self.fail_finalize.store(true, Ordering::SeqCst);
    }

    /// Make finalize-trip never answer.
    pub fn hang_finalize(&self) {
        self.hang_finalize.store(true, Ordering::SeqCst);
    }

    /// Make get-trip-details wait until [`FakeTripService::release_details`].
    pub fn hold_details(&self) {
        self.hold_details.store(true, Ordering::SeqCst);
    }

    pub fn release_details(&self) {
        self.details_gate.add_permits(1);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn plate_heartbeats(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::PlateStatus(_)))
    }

    pub fn saved_measurements(&self) -> usize {
        self.count(|c| matches!(c, RemoteCall::SaveMeasurement(_)))
    }

    fn count(&self, f: impl Fn(&RemoteCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: RemoteCall) {
        lock(&self.calls).push(call);
    }
}

fn unavailable() -> RemoteError {
    RemoteError::Status {
        status: 503,
        body: "service unavailable".into(),
    }
}

impl TripService for FakeTripService {
    fn create_trip(&self, trip: NewTrip) -> RemoteFuture<'_, TripCreated> {
        Box::pin(async move {
            self.record(RemoteCall::CreateTrip(trip));
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            Ok(TripCreated {
                trip_id: "trip-1".into(),
            })
        })
    }

    fn trip_details(&self, trip_id: String) -> RemoteFuture<'_, TripDetails> {
        Box::pin(async move {
            self.record(RemoteCall::TripDetails(trip_id));
            if self.hold_details.load(Ordering::SeqCst) {
                let permit = self
                    .details_gate
                    .acquire()
                    .await
                    .map_err(|e| RemoteError::Transport(e.to_string()))?;
                permit.forget();
            }
            Ok(TripDetails {
                plate_id: "plate-1".into(),
            })
        })
    }

    fn update_bike_status(&self, update: BikeStatusUpdate) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.record(RemoteCall::BikeStatus(update));
            Ok(())
        })
    }

    fn update_plate_status(&self, update: PlateStatusUpdate) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.record(RemoteCall::PlateStatus(update));
            Ok(())
        })
    }

    fn save_measurement(&self, record: MeasurementRecord) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.record(RemoteCall::SaveMeasurement(record));
            Ok(())
        })
    }

    fn finalize_trip(&self, closure: TripClosure) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.record(RemoteCall::FinalizeTrip(closure));
            if self.hang_finalize.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_finalize.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            Ok(())
        })
    }
}

//! Core application runner for `bike-beacon-tracker`.
//!
//! This module is decoupled from CLI parsing, hardware and process exit codes
//! so the whole pipeline can be driven by fakes in tests: the radio, the trip
//! service, the location source, the output stream and the shutdown signal
//! are all injected.

use crate::config::{ConfigError, Settings, check_dedup_threshold, load_pairing_payload};
use crate::dedup::parse_duration;
use crate::distance::{DistanceAccumulator, DistanceEvent};
use crate::location::{LocationSource, Position, parse_position};
use crate::measurement::{
    BeaconDetectionEvent, MeasurementCode, MeasurementTable, parse_measurement_code,
};
use crate::orchestrator::{LogStatusSink, ScanOrchestrator};
use crate::output::{Format, OutputFormatter};
use crate::scanner::{Backend, BeaconScanner, Radio, ScanError};
use crate::trip::remote::{RemoteError, TripService};
use crate::trip::{TripError, TripLifecycle};
use clap::Parser;
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

/// Command-line options; every flag can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum, env = "BEACON_BACKEND")]
    pub backend: Backend,

    /// Pairing payload from the bike's QR code, inline JSON or a file path.
    /// Format: {"uuid": "...", "id_bici": "..."} or {"name": "..."}
    #[arg(long, env = "BEACON_QR", value_name = "JSON|PATH")]
    pub qr: String,

    /// Rider the trip is registered to. Without it no trip is started.
    #[arg(long, env = "RIDER_ID")]
    pub rider_id: Option<String>,

    /// Base URL of the trip backend. Without it detections are only printed.
    #[arg(long, env = "TRIP_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for the trip backend
    #[arg(long, env = "TRIP_API_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Suppress repeated detections of the same beacon within this interval (3s to 5s).
    /// Accepts duration with suffix: 3s, 4500ms.
    #[arg(long, value_parser = parse_duration, default_value = "3s")]
    pub dedup: Duration,

    /// Forward at most one detection per interval
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub forward_window: Duration,

    /// Payload written to stdout for every forwarded detection
    #[arg(long, default_value_t, value_enum)]
    pub format: Format,

    /// Map a major-byte measurement code to a kind.
    /// Format: --measurement-code 14=pm10
    #[arg(
        long = "measurement-code",
        value_parser = parse_measurement_code,
        value_name = "CODE=KIND"
    )]
    pub measurement_codes: Vec<MeasurementCode>,

    /// Position reported when no fix is available, as LAT,LON
    #[arg(long, value_parser = parse_position, default_value = "40.4168,-3.7038")]
    pub fallback_position: Position,

    /// Last position known to the device, as LAT,LON
    #[arg(long, value_parser = parse_position, env = "LAST_KNOWN_POSITION")]
    pub last_known_position: Option<Position>,

    /// Timeout for each request to the trip backend
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub request_timeout: Duration,

    /// Verbose output, log filtered frames and remote calls
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Fold the flags into the per-component settings.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::default();
        settings.scanner.dedup_threshold = check_dedup_threshold(self.dedup)?;
        settings.orchestrator.forward_window = self.forward_window;
        settings.trip.rider_id = self.rider_id.clone().unwrap_or_default();
        settings.trip.fallback_position = self.fallback_position;
        Ok(settings)
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Trip(#[from] TripError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn write_detection(
    formatter: &dyn OutputFormatter,
    event: &BeaconDetectionEvent,
    out: &mut dyn Write,
) -> io::Result<()> {
    let line = formatter.format(event);
    writeln!(out, "{line}")
}

fn log_distance(event: DistanceEvent) {
    match event {
        DistanceEvent::Updated(total) => debug!("distance {total:.1} m"),
        DistanceEvent::Stopped(total) => info!("trip distance {total:.1} m"),
    }
}

/// Run the tracker until `shutdown` resolves, writing one payload line to
/// `out` per forwarded detection.
///
/// A trip is started only when a trip service and a rider are given and the
/// pairing payload names a bike. Otherwise detections are just printed. On
/// shutdown the scanner is stopped before the trip is finalized.
pub async fn run_with_io(
    options: Options,
    radio: Arc<dyn Radio>,
    service: Option<Arc<dyn TripService>>,
    location: Arc<dyn LocationSource>,
    out: &mut dyn Write,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let settings = options.settings()?;
    let beacon = load_pairing_payload(&options.qr)?;
    info!("pairing with beacon {}", beacon.target);

    let table = MeasurementTable::with_overrides(&options.measurement_codes);
    let scanner = Arc::new(BeaconScanner::new(radio, settings.scanner, table));
    scanner.configure(beacon.target.clone());

    let (distance, mut distance_events) =
        DistanceAccumulator::new(Arc::clone(&location), settings.distance);

    let trip_bike = match (service, beacon.bike_id.as_deref()) {
        (Some(service), Some(bike_id)) if !settings.trip.rider_id.is_empty() => {
            let trips = Arc::new(TripLifecycle::with_distance(
                service,
                location,
                Arc::new(distance),
                settings.trip.clone(),
            ));
            Some((trips, bike_id))
        }
        (None, _) => {
            info!("no trip backend configured, printing detections only");
            None
        }
        (Some(_), None) => {
            info!("pairing payload names no bike, printing detections only");
            None
        }
        (Some(_), Some(_)) => {
            warn!("no rider id configured, printing detections only");
            None
        }
    };

    let formatter = options.format.formatter(beacon.bike_id.clone());
    let orchestrator = ScanOrchestrator::new(
        scanner,
        trip_bike.as_ref().map(|(trips, _)| Arc::clone(trips)),
        Arc::new(LogStatusSink),
        settings.orchestrator,
    );
    let mut detections = orchestrator.subscribe();
    orchestrator.start().await?;

    if let Some((trips, bike_id)) = &trip_bike
        && let Err(e) = trips.start(bike_id).await
    {
        orchestrator.stop().await;
        return Err(e.into());
    }

    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break Ok(());
            }
            received = detections.recv() => match received {
                Ok(event) => {
                    if let Err(e) = write_detection(formatter.as_ref(), &event, out) {
                        break Err(RunError::Io(e));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("output fell behind, skipped {skipped} detections")
                }
                Err(RecvError::Closed) => break Ok(()),
            },
            Some(event) = distance_events.recv() => log_distance(event),
        }
    };

    orchestrator.stop().await;
    if let Some((trips, _)) = &trip_bike
        && let Err(e) = trips.finalize().await
    {
        warn!("trip finalized with error: {e}");
    }
    while let Ok(event) = distance_events.try_recv() {
        log_distance(event);
    }

    out.flush()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        FakeLocation, FakeRadio, FakeTripService, RemoteCall, TEST_UUID, advertisement,
        ibeacon_record,
    };
    use crate::trip::remote::BikeStatus;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    const UUID_QR: &str = r#"{"uuid": "E2C56DB5-DFFB-48D2-B060-D0F5A71096E0"}"#;
    const BIKE_QR: &str =
        r#"{"uuid": "E2C56DB5-DFFB-48D2-B060-D0F5A71096E0", "id_bici": "bike-3"}"#;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["bike-beacon-tracker"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    /// Emit each minor after the tracker had time to start, then shut down.
    async fn run(
        options: Options,
        radio: Arc<FakeRadio>,
        service: Option<Arc<dyn TripService>>,
        minors: &[u16],
        gap: Duration,
    ) -> (Result<(), RunError>, String) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut out = Vec::<u8>::new();

        let emitter = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            for &minor in minors {
                radio
                    .emit(advertisement(ibeacon_record(TEST_UUID, 0x0B01, minor, -59)))
                    .await;
                tokio::time::sleep(gap).await;
            }
            let _ = stop_tx.send(());
        };
        let shutdown = async {
            let _ = stop_rx.await;
        };

        let (result, ()) = tokio::join!(
            run_with_io(
                options,
                radio.clone(),
                service,
                Arc::new(FakeLocation::default()),
                &mut out,
                shutdown,
            ),
            emitter,
        );
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_defaults() {
        let options = options(&["--qr", UUID_QR]);
        assert_eq!(options.dedup, Duration::from_secs(3));
        assert_eq!(options.forward_window, Duration::from_secs(10));
        assert_eq!(options.format, Format::Minimal);
        assert_eq!(options.fallback_position, Position::new(40.4168, -3.7038));

        let settings = options.settings().unwrap();
        assert_eq!(settings.scanner.dedup_threshold, Duration::from_millis(3000));
        assert_eq!(settings.orchestrator.forward_window, Duration::from_secs(10));
    }

    #[test]
    fn test_flags_reach_settings() {
        let options = options(&[
            "--qr",
            UUID_QR,
            "--dedup",
            "4500ms",
            "--forward-window",
            "20s",
            "--rider-id",
            "rider-7",
            "--measurement-code",
            "14=co2",
            "--fallback-position",
            "41.3874,2.1686",
        ]);
        let settings = options.settings().unwrap();
        assert_eq!(settings.scanner.dedup_threshold, Duration::from_millis(4500));
        assert_eq!(settings.orchestrator.forward_window, Duration::from_secs(20));
        assert_eq!(settings.trip.rider_id, "rider-7");
        assert_eq!(settings.trip.fallback_position, Position::new(41.3874, 2.1686));
        assert_eq!(options.measurement_codes.len(), 1);
    }

    #[test]
    fn test_dedup_outside_range_is_rejected() {
        let options = options(&["--qr", UUID_QR, "--dedup", "1s"]);
        let err = assert_err!(options.settings());
        assert!(matches!(err, ConfigError::DedupThreshold(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prints_detections_without_backend() {
        let radio = Arc::new(FakeRadio::default());
        let (result, out) = run(
            options(&["--qr", UUID_QR]),
            radio.clone(),
            None,
            &[1500, 1600],
            Duration::from_secs(11),
        )
        .await;

        assert_ok!(result);
        assert_eq!(out, "{\"medida\":1500}\n{\"medida\":1600}\n");
        assert_eq!(radio.start_count(), 1);
        assert_eq!(radio.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_window_limits_output() {
        let (result, out) = run(
            options(&["--qr", UUID_QR, "--dedup", "3s"]),
            Arc::new(FakeRadio::default()),
            None,
            &[1500, 1600, 1700],
            Duration::from_secs(6),
        )
        .await;

        assert_ok!(result);
        // 1600 falls inside the forward window of 1500.
        assert_eq!(out, "{\"medida\":1500}\n{\"medida\":1700}\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_format_carries_bike_id() {
        let (result, out) = run(
            options(&["--qr", BIKE_QR, "--format", "extended"]),
            Arc::new(FakeRadio::default()),
            None,
            &[1500],
            Duration::from_millis(100),
        )
        .await;

        assert_ok!(result);
        let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(value["id_bici"], "bike-3");
        assert_eq!(value["minor"], 1500);
        assert_eq!(value["tipo_medicion"], 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_runs_for_paired_bike() {
        let service = Arc::new(FakeTripService::default());
        let (result, out) = run(
            options(&["--qr", BIKE_QR, "--rider-id", "rider-7"]),
            Arc::new(FakeRadio::default()),
            Some(service.clone() as Arc<dyn TripService>),
            &[1500],
            Duration::from_millis(100),
        )
        .await;

        assert_ok!(result);
        assert_eq!(out.lines().count(), 1);
        assert_eq!(service.saved_measurements(), 1);

        let calls = service.calls();
        assert!(matches!(
            calls.first(),
            Some(RemoteCall::CreateTrip(trip))
                if trip.bike_id == "bike-3" && trip.rider_id == "rider-7"
        ));
        assert!(matches!(
            calls.last(),
            Some(RemoteCall::BikeStatus(update)) if update.status == BikeStatus::Parked
        ));
        assert!(calls.iter().any(|c| matches!(c, RemoteCall::FinalizeTrip(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_trip_without_rider() {
        let service = Arc::new(FakeTripService::default());
        let (result, out) = run(
            options(&["--qr", BIKE_QR]),
            Arc::new(FakeRadio::default()),
            Some(service.clone() as Arc<dyn TripService>),
            &[1500],
            Duration::from_millis(100),
        )
        .await;

        assert_ok!(result);
        assert_eq!(out.lines().count(), 1);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_radio_fails_run() {
        let mut out = Vec::<u8>::new();
        let result = run_with_io(
            options(&["--qr", UUID_QR]),
            Arc::new(FakeRadio::unavailable()),
            None,
            Arc::new(FakeLocation::default()),
            &mut out,
            std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Scan(ScanError::RadioUnavailable(_)))));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_bad_pairing_payload_never_touches_radio() {
        let radio = Arc::new(FakeRadio::default());
        let mut out = Vec::<u8>::new();
        let result = run_with_io(
            options(&["--qr", r#"{"id_bici": "bike-3"}"#]),
            radio.clone(),
            None,
            Arc::new(FakeLocation::default()),
            &mut out,
            std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Config(ConfigError::NoTarget))));
        assert_eq!(radio.start_count(), 0);
    }
}

//! Target beacon scanner.
//!
//! [`BeaconScanner`] sits on top of a [`Radio`] backend, keeps only the
//! advertisements of one configured beacon, drops repeats inside the dedup
//! window and hands decoded [`BeaconDetectionEvent`]s to a single listener.
//! The radio session is restarted periodically because long-running scans
//! on some stacks silently stop delivering results.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::dedup::DedupWindow;
use crate::frame::{decode_frame, uuid_region};
use crate::mac_address::MacAddress;
use crate::measurement::{BeaconDetectionEvent, MeasurementTable};
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Error type for scanner and radio operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth stack reported an error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Adapter missing, powered off or not accessible
    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),
    /// `start()` was called before `configure()`
    #[error("scanner has no target configured")]
    NotConfigured,
}

/// Channel buffer size for raw advertisements and detection events.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// One advertisement as delivered by a radio backend, before any filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    /// Advertised local name. `None` when absent or when the platform refused
    /// to disclose it.
    pub name: Option<String>,
    pub rssi: i16,
    /// The scan record in iBeacon layout.
    pub record: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Boxed future returned by [`Radio`] methods.
pub type RadioFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ScanError>> + Send + 'a>>;

/// Platform scanning capability.
///
/// `start_scan` begins a scan session and returns its advertisements;
/// `stop_scan` ends the session. Radio state (enabled, permissions) is a
/// precondition checked by the caller's environment, not here.
pub trait Radio: Send + Sync {
    fn start_scan(&self) -> RadioFuture<'_, mpsc::Receiver<RawAdvertisement>>;
    fn stop_scan(&self) -> RadioFuture<'_, ()>;
}

/// The one beacon the scanner follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    /// Exact, case-insensitive match on the advertised local name.
    ByName(String),
    /// Match on the 16-byte UUID region of the scan record.
    ByUuid(Uuid),
}

impl ScanTarget {
    pub fn matches(&self, adv: &RawAdvertisement) -> bool {
        match self {
            ScanTarget::ByName(wanted) => adv
                .name
                .as_deref()
                .is_some_and(|name| name.to_lowercase() == wanted.to_lowercase()),
            ScanTarget::ByUuid(wanted) => {
                uuid_region(&adv.record).is_some_and(|region| region == wanted.as_bytes())
            }
        }
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanTarget::ByName(name) => write!(f, "name '{name}'"),
            ScanTarget::ByUuid(uuid) => write!(f, "uuid {}", uuid.hyphenated()),
        }
    }
}

/// Scanner timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerSettings {
    pub dedup_threshold: Duration,
    pub rescan_interval: Duration,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            dedup_threshold: Duration::from_millis(3000),
            rescan_interval: Duration::from_secs(30),
        }
    }
}

/// Target matching, decoding and dedup for raw advertisements.
#[derive(Debug)]
pub struct ScanFilter {
    target: Option<ScanTarget>,
    dedup: DedupWindow,
    table: MeasurementTable,
}

impl ScanFilter {
    pub fn new(dedup_threshold: Duration, table: MeasurementTable) -> Self {
        Self {
            target: None,
            dedup: DedupWindow::new(dedup_threshold),
            table,
        }
    }

    pub fn target(&self) -> Option<&ScanTarget> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: ScanTarget) {
        self.target = Some(target);
        self.dedup.clear();
    }

    /// Returns the event to propagate, or `None` if the advertisement is from
    /// another device, malformed, or inside the dedup window.
    pub fn process(
        &mut self,
        adv: &RawAdvertisement,
        now: Instant,
    ) -> Option<BeaconDetectionEvent> {
        if !self.target.as_ref()?.matches(adv) {
            return None;
        }
        let frame = decode_frame(&adv.record)?;
        if !self.dedup.accept_at(adv.address, now) {
            return None;
        }
        Some(BeaconDetectionEvent::new(
            adv.address,
            adv.rssi,
            adv.timestamp,
            adv.name.clone(),
            frame,
            &self.table,
        ))
    }
}

/// State shared between the scanner handle and its session task.
struct Shared {
    filter: Mutex<ScanFilter>,
    listener: Mutex<Option<mpsc::Sender<BeaconDetectionEvent>>>,
}

impl Shared {
    fn handle(&self, adv: &RawAdvertisement) {
        let event = self
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(adv, Instant::now());
        let Some(event) = event else {
            return;
        };

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener.map(|tx| tx.try_send(event)) {
            Some(Ok(())) => {}
            Some(Err(TrySendError::Full(_))) => warn!("listener busy, detection dropped"),
            Some(Err(TrySendError::Closed(_))) => debug!("listener gone, detection dropped"),
            None => debug!("no listener attached, detection dropped"),
        }
    }
}

/// Follows one beacon and reports its detections.
pub struct BeaconScanner {
    radio: Arc<dyn Radio>,
    settings: ScannerSettings,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BeaconScanner {
    pub fn new(radio: Arc<dyn Radio>, settings: ScannerSettings, table: MeasurementTable) -> Self {
        Self {
            radio,
            settings,
            shared: Arc::new(Shared {
                filter: Mutex::new(ScanFilter::new(settings.dedup_threshold, table)),
                listener: Mutex::new(None),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Set the beacon to follow. Takes effect on the next `start()`.
    pub fn configure(&self, target: ScanTarget) {
        info!("scanner target set to {target}");
        self.shared
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_target(target);
    }

    pub fn target(&self) -> Option<ScanTarget> {
        self.shared
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .target()
            .cloned()
    }

    /// Route detections to `listener`. The radio is left untouched.
    pub fn attach(&self, listener: mpsc::Sender<BeaconDetectionEvent>) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub async fn is_scanning(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start scanning, restarting cleanly if a session is already running.
    ///
    /// Fails if no target is configured or the radio cannot start; the scanner
    /// is stopped in both cases.
    pub async fn start(&self) -> Result<(), ScanError> {
        let mut session = self.session.lock().await;
        if let Some(task) = session.take() {
            debug!("scanner already running, restarting");
            self.end_session(task).await;
        }

        if self.target().is_none() {
            return Err(ScanError::NotConfigured);
        }

        let advertisements = match self.radio.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("failed to start scan: {e}");
                return Err(e);
            }
        };

        *session = Some(tokio::spawn(run_session(
            Arc::clone(&self.radio),
            Arc::clone(&self.shared),
            self.settings.rescan_interval,
            advertisements,
        )));
        info!("scanner started");
        Ok(())
    }

    /// Stop scanning and cancel the rescan timer. No-op when already stopped.
    pub async fn stop(&self) {
        if let Some(task) = self.session.lock().await.take() {
            self.end_session(task).await;
            info!("scanner stopped");
        }
    }

    async fn end_session(&self, task: JoinHandle<()>) {
        task.abort();
        if let Err(e) = self.radio.stop_scan().await {
            warn!("failed to stop scan cleanly: {e}");
        }
    }
}

/// Pump advertisements into the filter, restarting the radio every
/// `rescan_interval`.
async fn run_session(
    radio: Arc<dyn Radio>,
    shared: Arc<Shared>,
    rescan_interval: Duration,
    mut advertisements: mpsc::Receiver<RawAdvertisement>,
) {
    loop {
        let rescan = tokio::time::sleep(rescan_interval);
        tokio::pin!(rescan);

        loop {
            tokio::select! {
                _ = &mut rescan => break,
                adv = advertisements.recv() => match adv {
                    Some(adv) => shared.handle(&adv),
                    None => {
                        debug!("radio closed the advertisement stream, waiting for rescan");
                        (&mut rescan).await;
                        break;
                    }
                },
            }
        }

        debug!("rescanning");
        if let Err(e) = radio.stop_scan().await {
            warn!("failed to stop scan before rescan: {e}");
        }
        advertisements = match radio.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("rescan failed, scanner stopped: {e}");
                return;
            }
        };
    }
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
        }
    }
}

/// Open the radio for `backend`.
pub async fn open_radio(backend: Backend) -> Result<Arc<dyn Radio>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Arc::new(bluer::BluerRadio::new().await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Arc::new(hci::HciRadio::new(0))),
    }
}

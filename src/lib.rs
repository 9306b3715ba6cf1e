//! `bike-beacon-tracker` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logger setup and
//! process exit codes. The pipeline lives in [`crate::app`], where it can be
//! tested deterministically with an injected radio, trip service, location
//! source and output stream.

pub mod app;
pub mod config;
pub mod dedup;
pub mod distance;
pub mod frame;
pub mod location;
pub mod mac_address;
pub mod measurement;
pub mod orchestrator;
pub mod output;
pub mod scanner;
pub mod trip;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use config::{BeaconConfig, ConfigError, Settings, parse_pairing_payload};
pub use dedup::{DedupWindow, parse_duration};
pub use distance::{DistanceAccumulator, DistanceEvent};
pub use frame::{AdvertisementFrame, decode_frame};
pub use location::{LocationSource, Position};
pub use mac_address::MacAddress;
pub use measurement::{BeaconDetectionEvent, MeasurementKind, MeasurementTable};
pub use orchestrator::{LinkStatus, ScanOrchestrator};
pub use output::{Format, OutputFormatter};
pub use scanner::{Backend, BeaconScanner, RawAdvertisement, ScanError, ScanFilter, ScanTarget};
pub use trip::{TripLifecycle, TripState};

//! Output formatters for beacon detections.
//!
//! Every detection forwarded by the orchestrator is also published locally,
//! one JSON payload per line. Consumers either want just the reading
//! ([`json::MinimalFormatter`]) or the full frame context
//! ([`json::ExtendedFormatter`]).

pub mod json;

use crate::measurement::BeaconDetectionEvent;

/// Trait for formatting detections into output strings.
pub trait OutputFormatter: Send + Sync {
    /// Format a detection as a single line (without the trailing newline).
    fn format(&self, event: &BeaconDetectionEvent) -> String;
}

/// Payload shape written for each forwarded detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Format {
    /// `{"medida": <minor>}`
    #[default]
    Minimal,
    /// Full frame context including UUID, address, RSSI and bike id
    Extended,
}

impl Format {
    pub fn formatter(self, bike_id: Option<String>) -> Box<dyn OutputFormatter> {
        match self {
            Format::Minimal => Box::new(json::MinimalFormatter),
            Format::Extended => Box::new(json::ExtendedFormatter::new(bike_id)),
        }
    }
}

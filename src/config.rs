//! Beacon pairing payload and tunable settings.
//!
//! A bike is paired by scanning a QR code that carries a small JSON object:
//! `{"uuid": "...", "id_bici": "..."}` for a bike with a trip, or
//! `{"name": "..."}` to follow a beacon by its advertised name. When both
//! identifiers are present the UUID wins.

use crate::distance::DistanceSettings;
use crate::orchestrator::OrchestratorSettings;
use crate::scanner::{ScanTarget, ScannerSettings};
use crate::trip::TripSettings;
use serde::{Deserialize, Deserializer};
use std::io;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Accepted range for the per-address dedup threshold.
pub const DEDUP_THRESHOLD_RANGE: RangeInclusive<Duration> =
    Duration::from_millis(3000)..=Duration::from_millis(5000);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid pairing payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("pairing payload names no beacon (expected \"uuid\" or \"name\")")]
    NoTarget,
    #[error("invalid beacon uuid '{0}'")]
    InvalidUuid(String),
    #[error("dedup threshold {0:?} outside 3s..=5s")]
    DedupThreshold(Duration),
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

#[derive(Deserialize)]
struct PairingPayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, rename = "id_bici", deserialize_with = "optional_id")]
    bike_id: Option<String>,
}

/// What a pairing payload tells us.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconConfig {
    pub target: ScanTarget,
    /// Present when the payload pairs a bike, which starts a trip.
    pub bike_id: Option<String>,
}

/// Parse a pairing payload.
///
/// ```
/// use bike_beacon_tracker::config::parse_pairing_payload;
/// use bike_beacon_tracker::scanner::ScanTarget;
///
/// let config = parse_pairing_payload(r#"{"name": "EmisoraBLE"}"#).unwrap();
/// assert_eq!(config.target, ScanTarget::ByName("EmisoraBLE".into()));
/// assert_eq!(config.bike_id, None);
/// ```
pub fn parse_pairing_payload(src: &str) -> Result<BeaconConfig, ConfigError> {
    let payload: PairingPayload = serde_json::from_str(src)?;
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let target = match (non_empty(payload.uuid), non_empty(payload.name)) {
        (Some(uuid), _) => ScanTarget::ByUuid(
            Uuid::parse_str(&uuid).map_err(|_| ConfigError::InvalidUuid(uuid.clone()))?,
        ),
        (None, Some(name)) => ScanTarget::ByName(name),
        (None, None) => return Err(ConfigError::NoTarget),
    };

    Ok(BeaconConfig {
        target,
        bike_id: non_empty(payload.bike_id),
    })
}

/// Read a pairing payload given inline (starting with `{`) or as a file path.
pub fn load_pairing_payload(arg: &str) -> Result<BeaconConfig, ConfigError> {
    if arg.trim_start().starts_with('{') {
        return parse_pairing_payload(arg);
    }
    let path = Path::new(arg);
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pairing_payload(&contents)
}

pub fn check_dedup_threshold(threshold: Duration) -> Result<Duration, ConfigError> {
    if DEDUP_THRESHOLD_RANGE.contains(&threshold) {
        Ok(threshold)
    } else {
        Err(ConfigError::DedupThreshold(threshold))
    }
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number for id_bici, got {other}"
        ))),
    }
}

/// All timing and threshold knobs, grouped per component.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    pub scanner: ScannerSettings,
    pub distance: DistanceSettings,
    pub trip: TripSettings,
    pub orchestrator: OrchestratorSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_payload_with_bike() {
        let config = parse_pairing_payload(
            r#"{"uuid": "e2c56db5-dffb-48d2-b060-d0f5a71096e0", "id_bici": "bike-3"}"#,
        )
        .unwrap();
        assert_eq!(
            config.target,
            ScanTarget::ByUuid(Uuid::from_bytes(crate::test_utils::TEST_UUID))
        );
        assert_eq!(config.bike_id.as_deref(), Some("bike-3"));
    }

    #[test]
    fn test_uuid_wins_over_name() {
        let config = parse_pairing_payload(
            r#"{"name": "EmisoraBLE", "uuid": "E2C56DB5DFFB48D2B060D0F5A71096E0"}"#,
        )
        .unwrap();
        assert!(matches!(config.target, ScanTarget::ByUuid(_)));
    }

    #[test]
    fn test_numeric_bike_id() {
        let config = parse_pairing_payload(r#"{"name": "b", "id_bici": 17}"#).unwrap();
        assert_eq!(config.bike_id.as_deref(), Some("17"));
    }

    #[test]
    fn test_blank_fields_count_as_missing() {
        let config = parse_pairing_payload(r#"{"uuid": " ", "name": "EmisoraBLE", "id_bici": ""}"#)
            .unwrap();
        assert_eq!(config.target, ScanTarget::ByName("EmisoraBLE".into()));
        assert_eq!(config.bike_id, None);
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(matches!(
            parse_pairing_payload("{}"),
            Err(ConfigError::NoTarget)
        ));
        assert!(matches!(
            parse_pairing_payload(r#"{"uuid": "not-a-uuid"}"#),
            Err(ConfigError::InvalidUuid(_))
        ));
        assert!(matches!(
            parse_pairing_payload("uuid=1234"),
            Err(ConfigError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_load_from_missing_file() {
        assert!(matches!(
            load_pairing_payload("/nonexistent/pairing.json"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_dedup_threshold_range() {
        assert!(check_dedup_threshold(Duration::from_millis(3000)).is_ok());
        assert!(check_dedup_threshold(Duration::from_millis(5000)).is_ok());
        assert!(check_dedup_threshold(Duration::from_millis(2999)).is_err());
        assert!(check_dedup_threshold(Duration::from_secs(6)).is_err());
    }
}

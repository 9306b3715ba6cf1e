//! Positioning seam.
//!
//! Satellite positioning is provided by the host platform. The crate only
//! needs three things from it: a stream of fixes, the latest live fix, and the
//! last fix the platform remembers from before the process started.

use log::{debug, warn};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;

/// Mean earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Fallback coordinate used when no fix is available (Madrid, Puerta del Sol).
pub const DEFAULT_FALLBACK: Position = Position {
    lat: 40.4168,
    lon: -3.7038,
};

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos()
                * other.lat.to_radians().cos()
                * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Parse `LAT,LON` in decimal degrees.
pub fn parse_position(src: &str) -> Result<Position, String> {
    let (lat, lon) = src
        .split_once(',')
        .ok_or_else(|| "invalid position: expected LAT,LON".to_string())?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| format!("invalid latitude: {lat}"))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| format!("invalid longitude: {lon}"))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("position out of range: {lat},{lon}"));
    }
    Ok(Position { lat, lon })
}

/// A single reading from the positioning provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub position: Position,
    /// Horizontal accuracy radius in meters.
    pub accuracy_m: f64,
    /// Name of the source that produced the fix ("gps", "network", ...).
    pub provider: String,
    pub timestamp: SystemTime,
}

/// How often and how precisely fixes should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixRequest {
    pub interval: Duration,
    pub high_accuracy: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("positioning unavailable: {0}")]
    Unavailable(String),
    #[error("positioning permission denied")]
    PermissionDenied,
}

/// Host positioning capability.
pub trait LocationSource: Send + Sync {
    /// Start delivering fixes. Only one subscription is live at a time; a new
    /// call replaces the previous one.
    fn subscribe(&self, request: FixRequest) -> Result<mpsc::Receiver<PositionFix>, LocationError>;

    /// Stop delivering fixes. Safe to call when not subscribed.
    fn unsubscribe(&self);

    /// Most recent fix from a live subscription, if any.
    fn current(&self) -> Option<Position>;

    /// Last fix the platform cached before this process started tracking.
    fn last_known(&self) -> Option<Position>;
}

/// A location source for hosts without positioning hardware.
///
/// Never produces fixes; optionally reports a configured position as the
/// last known one so trips still get a meaningful origin.
#[derive(Debug, Default)]
pub struct StaticLocation {
    last_known: Option<Position>,
}

impl StaticLocation {
    pub fn new(last_known: Option<Position>) -> Self {
        Self { last_known }
    }
}

impl LocationSource for StaticLocation {
    fn subscribe(
        &self,
        _request: FixRequest,
    ) -> Result<mpsc::Receiver<PositionFix>, LocationError> {
        Err(LocationError::Unavailable(
            "no positioning provider on this host".into(),
        ))
    }

    fn unsubscribe(&self) {}

    fn current(&self) -> Option<Position> {
        None
    }

    fn last_known(&self) -> Option<Position> {
        self.last_known
    }
}

/// Resolve a position for a trip record: live fix, then last known, then
/// `fallback`.
pub fn resolve_position(source: &dyn LocationSource, fallback: Position) -> Position {
    if let Some(p) = source.current() {
        return p;
    }
    if let Some(p) = source.last_known() {
        debug!("using last known position {},{}", p.lat, p.lon);
        return p;
    }
    warn!(
        "no position available, using fallback {},{}",
        fallback.lat,
        fallback.lon
    );
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeLocation;

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = Position::new(39.47, -0.376);
        assert!(p.distance_to(&p).abs() < 1e-9);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(1.0, 0.0);
        // One degree of arc on a 6371 km sphere.
        assert!((a.distance_to(&b) - 111_194.9).abs() < 1.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = Position::new(39.4699, -0.3763);
        let b = Position::new(39.4810, -0.3400);
        assert!((a.distance_to(&b) - b.distance_to(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(
            parse_position("39.47, -0.37").unwrap(),
            Position::new(39.47, -0.37)
        );
        assert!(parse_position("39.47").is_err());
        assert!(parse_position("91,0").is_err());
        assert!(parse_position("a,b").is_err());
    }

    #[test]
    fn test_resolve_prefers_live_then_last_known_then_fallback() {
        let source = FakeLocation::default();
        assert_eq!(resolve_position(&source, DEFAULT_FALLBACK), DEFAULT_FALLBACK);

        source.set_last_known(Some(Position::new(1.0, 1.0)));
        assert_eq!(
            resolve_position(&source, DEFAULT_FALLBACK),
            Position::new(1.0, 1.0)
        );

        source.set_current(Some(Position::new(2.0, 2.0)));
        assert_eq!(
            resolve_position(&source, DEFAULT_FALLBACK),
            Position::new(2.0, 2.0)
        );
    }

    #[test]
    fn test_static_location_never_subscribes() {
        let source = StaticLocation::new(Some(Position::new(1.0, 2.0)));
        let request = FixRequest {
            interval: Duration::from_secs(2),
            high_accuracy: true,
        };
        assert!(matches!(
            source.subscribe(request),
            Err(LocationError::Unavailable(_))
        ));
        assert_eq!(source.last_known(), Some(Position::new(1.0, 2.0)));
        assert_eq!(source.current(), None);
    }
}

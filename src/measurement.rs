//! Pollutant readings carried by beacon advertisements.

use crate::frame::AdvertisementFrame;
use crate::mac_address::MacAddress;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// The pollutant a reading refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MeasurementKind {
    #[serde(rename = "pm2_5")]
    Pm25,
    #[serde(rename = "pm10")]
    Pm10,
    #[serde(rename = "co2")]
    Co2,
    #[serde(rename = "desconocido")]
    Unknown,
}

impl MeasurementKind {
    /// Name understood by the trip service.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Pm25 => "pm2_5",
            MeasurementKind::Pm10 => "pm10",
            MeasurementKind::Co2 => "co2",
            MeasurementKind::Unknown => "desconocido",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pm2_5" | "pm2.5" | "pm25" => Ok(MeasurementKind::Pm25),
            "pm10" => Ok(MeasurementKind::Pm10),
            "co2" => Ok(MeasurementKind::Co2),
            _ => Err(format!("unknown measurement kind: {s}")),
        }
    }
}

/// Maps the measurement code in a frame's major high byte to a pollutant.
///
/// Firmware revisions have disagreed on the numbering, so the table is
/// configuration. [`MeasurementTable::default`] is the canonical mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementTable {
    codes: BTreeMap<u8, MeasurementKind>,
}

impl Default for MeasurementTable {
    fn default() -> Self {
        Self {
            codes: BTreeMap::from([
                (11, MeasurementKind::Pm25),
                (12, MeasurementKind::Pm10),
                (13, MeasurementKind::Co2),
            ]),
        }
    }
}

impl MeasurementTable {
    /// The default table with `overrides` applied on top.
    pub fn with_overrides(overrides: &[MeasurementCode]) -> Self {
        let mut table = Self::default();
        for o in overrides {
            table.codes.insert(o.code, o.kind);
        }
        table
    }

    pub fn kind(&self, code: u8) -> MeasurementKind {
        self.codes
            .get(&code)
            .copied()
            .unwrap_or(MeasurementKind::Unknown)
    }
}

/// A single `CODE=KIND` override, e.g. `14=pm10`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementCode {
    pub code: u8,
    pub kind: MeasurementKind,
}

/// Parse a measurement code override in the format `CODE=KIND`.
///
/// ```
/// use bike_beacon_tracker::measurement::{parse_measurement_code, MeasurementKind};
///
/// let parsed = parse_measurement_code("21=co2").unwrap();
/// assert_eq!(parsed.code, 21);
/// assert_eq!(parsed.kind, MeasurementKind::Co2);
/// ```
pub fn parse_measurement_code(src: &str) -> Result<MeasurementCode, String> {
    let (code, kind) = src
        .split_once('=')
        .ok_or_else(|| "invalid measurement code: expected format CODE=KIND".to_string())?;
    let code = code
        .trim()
        .parse::<u8>()
        .map_err(|_| format!("invalid measurement code: {code}"))?;
    Ok(MeasurementCode {
        code,
        kind: kind.parse()?,
    })
}

/// A frame from the target beacon that made it through filtering and dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconDetectionEvent {
    pub address: MacAddress,
    pub rssi: i16,
    pub timestamp: SystemTime,
    /// Advertised local name, when the radio could read it.
    pub name: Option<String>,
    pub frame: AdvertisementFrame,
    pub value: f64,
    pub kind: MeasurementKind,
    pub counter: u8,
}

impl BeaconDetectionEvent {
    pub fn new(
        address: MacAddress,
        rssi: i16,
        timestamp: SystemTime,
        name: Option<String>,
        frame: AdvertisementFrame,
        table: &MeasurementTable,
    ) -> Self {
        Self {
            address,
            rssi,
            timestamp,
            name,
            value: frame.value(),
            kind: table.kind(frame.measurement_code()),
            counter: frame.counter(),
            frame,
        }
    }
}

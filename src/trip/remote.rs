//! The remote trip service seam.
//!
//! Requests and responses serialize to the backend's JSON field names, so the
//! HTTP adapter can send them as-is.

use crate::location::Position;
use crate::measurement::MeasurementKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("request timed out")]
    Timeout,
}

/// Boxed future returned by [`TripService`] methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Asynchronous trip backend.
pub trait TripService: Send + Sync {
    fn create_trip(&self, trip: NewTrip) -> RemoteFuture<'_, TripCreated>;
    fn trip_details(&self, trip_id: String) -> RemoteFuture<'_, TripDetails>;
    fn update_bike_status(&self, update: BikeStatusUpdate) -> RemoteFuture<'_, ()>;
    fn update_plate_status(&self, update: PlateStatusUpdate) -> RemoteFuture<'_, ()>;
    fn save_measurement(&self, record: MeasurementRecord) -> RemoteFuture<'_, ()>;
    fn finalize_trip(&self, closure: TripClosure) -> RemoteFuture<'_, ()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTrip {
    #[serde(rename = "targeta_id")]
    pub rider_id: String,
    #[serde(rename = "bicicleta_id")]
    pub bike_id: String,
    #[serde(rename = "fecha_inicio")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "origen")]
    pub origin: Position,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TripCreated {
    #[serde(rename = "trayecto_id", deserialize_with = "string_or_number")]
    pub trip_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TripDetails {
    #[serde(rename = "placa_id", deserialize_with = "string_or_number")]
    pub plate_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BikeStatus {
    #[serde(rename = "en_uso")]
    InUse,
    #[serde(rename = "estacionada")]
    Parked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BikeStatusUpdate {
    #[serde(rename = "bicicleta_id")]
    pub bike_id: String,
    #[serde(rename = "estado")]
    pub status: BikeStatus,
    #[serde(rename = "posicion")]
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlateStatus {
    #[serde(rename = "activa")]
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateStatusUpdate {
    #[serde(rename = "placa_id")]
    pub plate_id: String,
    #[serde(rename = "estado")]
    pub status: PlateStatus,
    #[serde(rename = "ult_actualizacion_estado")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    #[serde(rename = "trayecto_id")]
    pub trip_id: String,
    #[serde(rename = "placa_id")]
    pub plate_id: String,
    #[serde(rename = "tipo")]
    pub kind: MeasurementKind,
    #[serde(rename = "valor")]
    pub value: f64,
    #[serde(rename = "fecha_hora")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "posicion")]
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripClosure {
    #[serde(rename = "trayecto_id")]
    pub trip_id: String,
    #[serde(rename = "fecha_fin")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "destino")]
    pub destination: Position,
}

/// Identifiers come back as strings or integers depending on the backend.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

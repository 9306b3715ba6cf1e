//! JSON payload formatters.

use crate::mac_address::MacAddress;
use crate::measurement::BeaconDetectionEvent;
use crate::output::OutputFormatter;
use serde::Serialize;

/// The reading alone, as the raw `minor` value.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimalFormatter;

#[derive(Serialize)]
struct MinimalPayload {
    medida: u16,
}

impl OutputFormatter for MinimalFormatter {
    fn format(&self, event: &BeaconDetectionEvent) -> String {
        to_line(&MinimalPayload {
            medida: event.frame.minor,
        })
    }
}

/// The reading with its frame context and the bike it was recorded on.
#[derive(Debug, Default, Clone)]
pub struct ExtendedFormatter {
    bike_id: Option<String>,
}

impl ExtendedFormatter {
    pub fn new(bike_id: Option<String>) -> Self {
        Self { bike_id }
    }
}

#[derive(Serialize)]
struct ExtendedPayload<'a> {
    uuid: String,
    mac: MacAddress,
    nombre: Option<&'a str>,
    rssi: i16,
    major: u16,
    tipo_medicion: u8,
    contador: u8,
    minor: u16,
    valor_medido: f64,
    id_bici: Option<&'a str>,
}

impl OutputFormatter for ExtendedFormatter {
    fn format(&self, event: &BeaconDetectionEvent) -> String {
        to_line(&ExtendedPayload {
            uuid: event.frame.uuid_string(),
            mac: event.address,
            nombre: event.name.as_deref(),
            rssi: event.rssi,
            major: event.frame.major,
            tipo_medicion: event.frame.measurement_code(),
            contador: event.counter,
            minor: event.frame.minor,
            valor_medido: event.value,
            id_bici: self.bike_id.as_deref(),
        })
    }
}

fn to_line<T: Serialize>(payload: &T) -> String {
    // Plain structs of numbers and strings always serialize.
    serde_json::to_string(payload).unwrap_or_default()
}

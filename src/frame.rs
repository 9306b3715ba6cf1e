//! iBeacon scan record decoding.
//!
//! The beacon firmware advertises a fixed 30-byte scan record:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 3    | Advertising flags AD structure |
//! | 3      | 2    | Manufacturer AD header (length, type `0xFF`) |
//! | 5      | 2    | Company id (little-endian) |
//! | 7      | 1    | Beacon type (`0x02`) |
//! | 8      | 1    | Beacon payload length (`0x15`) |
//! | 9      | 16   | Proximity UUID |
//! | 25     | 2    | Major (big-endian): measurement code, rolling counter |
//! | 27     | 2    | Minor (big-endian): measured value ×1000 |
//! | 29     | 1    | Calibrated TX power (signed) |
//!
//! Records shorter than [`MIN_RECORD_LEN`] are rejected. Records that contain
//! the whole UUID but are cut short afterwards read the missing trailing
//! bytes as zero.

use uuid::Uuid;

/// Shortest record that still carries the complete UUID region.
pub const MIN_RECORD_LEN: usize = 25;

/// Length of a complete iBeacon scan record.
pub const RECORD_LEN: usize = 30;

/// Byte range of the proximity UUID inside the scan record.
pub const UUID_RANGE: std::ops::Range<usize> = 9..25;

/// Fixed-offset header preceding the UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    pub adv_flags: [u8; 3],
    pub adv_header: [u8; 2],
    pub company_id: u16,
    pub beacon_type: u8,
    pub beacon_length: u8,
}

/// A decoded iBeacon advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisementFrame {
    pub prefix: FramePrefix,
    pub uuid: [u8; 16],
    pub major: u16,
    pub minor: u16,
    pub tx_power: i8,
}

impl AdvertisementFrame {
    /// Measurement type code carried in the high byte of `major`.
    pub fn measurement_code(&self) -> u8 {
        (self.major >> 8) as u8
    }

    /// Rolling counter carried in the low byte of `major`.
    pub fn counter(&self) -> u8 {
        (self.major & 0xFF) as u8
    }

    /// The firmware scales readings by 1000 before packing them into `minor`.
    pub fn value(&self) -> f64 {
        f64::from(self.minor) / 1000.0
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid)
    }

    /// Canonical 8-4-4-4-12 uppercase rendering of the UUID region.
    pub fn uuid_string(&self) -> String {
        format_uuid(&self.uuid)
    }
}

/// Render 16 raw bytes as an uppercase hyphenated UUID.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    Uuid::from_bytes(*bytes)
        .hyphenated()
        .to_string()
        .to_uppercase()
}

/// Borrow the UUID region of a raw record, or `None` if the record is too short.
pub fn uuid_region(record: &[u8]) -> Option<&[u8]> {
    record.get(UUID_RANGE)
}

/// Decode a raw scan record.
///
/// Returns `None` for records shorter than [`MIN_RECORD_LEN`]; never panics.
pub fn decode_frame(record: &[u8]) -> Option<AdvertisementFrame> {
    if record.len() < MIN_RECORD_LEN {
        return None;
    }

    let mut buf = [0u8; RECORD_LEN];
    let n = record.len().min(RECORD_LEN);
    buf[..n].copy_from_slice(&record[..n]);

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&buf[UUID_RANGE]);

    Some(AdvertisementFrame {
        prefix: FramePrefix {
            adv_flags: [buf[0], buf[1], buf[2]],
            adv_header: [buf[3], buf[4]],
            company_id: u16::from_le_bytes([buf[5], buf[6]]),
            beacon_type: buf[7],
            beacon_length: buf[8],
        },
        uuid,
        major: u16::from_be_bytes([buf[25], buf[26]]),
        minor: u16::from_be_bytes([buf[27], buf[28]]),
        tx_power: buf[29] as i8,
    })
}

/// Apple's company id, used by every iBeacon regardless of vendor.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Rebuild a full scan record from iBeacon manufacturer data.
///
/// BlueZ hands out manufacturer data keyed by company id with the AD framing
/// stripped; this puts the framing back so the record can go through
/// [`decode_frame`] like one captured from the raw socket.
pub fn record_from_manufacturer_data(company_id: u16, data: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(7 + data.len());
    record.extend_from_slice(&[0x02, 0x01, 0x06]);
    record.push((data.len() + 3) as u8);
    record.push(0xFF);
    record.extend_from_slice(&company_id.to_le_bytes());
    record.extend_from_slice(data);
    record
}

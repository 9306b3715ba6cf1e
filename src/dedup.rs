//! Per-address suppression of repeated beacon detections.
//!
//! The beacon advertises several times per second while the reading it carries
//! changes far more slowly. [`DedupWindow`] lets one detection per address
//! through every `threshold`, and [`parse_duration`] reads the thresholds from
//! the command line.

use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks the last accepted detection time for each address.
///
/// Entries are replaced on acceptance and never expire; the scanner only
/// follows one beacon, so the map stays tiny.
#[derive(Debug)]
pub struct DedupWindow {
    threshold: Duration,
    last_accepted: HashMap<MacAddress, Instant>,
}

impl DedupWindow {
    pub fn new(threshold: Duration) -> Self {
        DedupWindow {
            threshold,
            last_accepted: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Check a detection observed now. See [`DedupWindow::accept_at`].
    pub fn accept(&mut self, address: MacAddress) -> bool {
        self.accept_at(address, Instant::now())
    }

    /// Returns `true` if at least `threshold` has elapsed since the last
    /// accepted detection from `address` (or it has never been seen), and
    /// records `now` as the new acceptance time. Rejected detections leave
    /// the stored time untouched.
    pub fn accept_at(&mut self, address: MacAddress, now: Instant) -> bool {
        match self.last_accepted.get(&address) {
            Some(last) if now.saturating_duration_since(*last) < self.threshold => false,
            _ => {
                self.last_accepted.insert(address, now);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.last_accepted.clear();
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports `ms`, `s`, `m` and `h` suffixes; a bare number is seconds.
///
/// ```
/// use bike_beacon_tracker::dedup::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("4500ms").unwrap(), Duration::from_millis(4500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let parse = |num: &str, unit: &str| -> Result<u64, String> {
        num.trim()
            .parse()
            .map_err(|_| format!("invalid {unit}: {num}"))
    };

    if let Some(num) = src.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse(num, "milliseconds")?));
    }
    if let Some(num) = src.strip_suffix('h') {
        return Ok(Duration::from_secs(parse(num, "hours")? * 3600));
    }
    if let Some(num) = src.strip_suffix('m') {
        return Ok(Duration::from_secs(parse(num, "minutes")? * 60));
    }
    if let Some(num) = src.strip_suffix('s') {
        return Ok(Duration::from_secs(parse(num, "seconds")?));
    }

    Ok(Duration::from_secs(parse(src, "duration")?))
}

//! BlueZ D-Bus radio backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Radio, RadioFuture, RawAdvertisement, ScanError};
use crate::frame::{APPLE_COMPANY_ID, record_from_manufacturer_data};
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use log::debug;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// AD type for manufacturer specific data.
const MANUFACTURER_DATA_TYPE: u8 = 0xFF;

/// Apple company id followed by the iBeacon type and length bytes.
const IBEACON_PATTERN: [u8; 4] = [0x4C, 0x00, 0x02, 0x15];

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Radio backed by the default BlueZ adapter.
pub struct BluerRadio {
    _session: Session,
    adapter: Adapter,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BluerRadio {
    pub async fn new() -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| ScanError::RadioUnavailable(e.to_string()))?;
        Ok(Self {
            _session: session,
            adapter,
            monitor: Mutex::new(None),
        })
    }

    fn replace_monitor(&self, task: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.monitor.lock().unwrap_or_else(PoisonError::into_inner),
            task,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Radio for BluerRadio {
    fn start_scan(&self) -> RadioFuture<'_, mpsc::Receiver<RawAdvertisement>> {
        Box::pin(async move {
            if !self.adapter.is_powered().await? {
                self.adapter
                    .set_powered(true)
                    .await
                    .map_err(|e| ScanError::RadioUnavailable(e.to_string()))?;
            }

            let pattern = Pattern {
                data_type: MANUFACTURER_DATA_TYPE,
                start_position: 0,
                content: IBEACON_PATTERN.to_vec(),
            };
            let monitor_manager = self.adapter.monitor().await?;
            let mut monitor_handle = monitor_manager
                .register(Monitor {
                    patterns: Some(vec![pattern]),
                    ..Default::default()
                })
                .await?;

            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            let adapter = self.adapter.clone();

            // Dropping the monitor handle unregisters it, which ends the scan.
            let task = tokio::spawn(async move {
                let _monitor_manager = monitor_manager;

                while let Some(event) = monitor_handle.next().await {
                    if let MonitorEvent::DeviceFound(device_id) = event {
                        match read_advertisement(&adapter, device_id.device).await {
                            Ok(Some(adv)) => {
                                if tx.send(adv).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => debug!("skipping {}: {e}", device_id.device),
                        }
                    }
                }
            });
            self.replace_monitor(Some(task));

            Ok(rx)
        })
    }

    fn stop_scan(&self) -> RadioFuture<'_, ()> {
        Box::pin(async move {
            self.replace_monitor(None);
            Ok(())
        })
    }
}

/// Read the iBeacon payload of a found device and rebuild its scan record.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<RawAdvertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };
    let Some(payload) = manufacturer_data.get(&APPLE_COMPANY_ID) else {
        return Ok(None);
    };

    let name = match device.name().await {
        Ok(name) => name,
        Err(e) => {
            debug!("name of {address} not readable: {e}");
            None
        }
    };
    let rssi = device.rssi().await.ok().flatten().unwrap_or_default();

    Ok(Some(RawAdvertisement {
        address: address.into(),
        name,
        rssi,
        record: record_from_manufacturer_data(APPLE_COMPANY_ID, payload),
        timestamp: SystemTime::now(),
    }))
}

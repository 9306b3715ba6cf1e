//! Raw HCI socket radio backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Radio, RadioFuture, RawAdvertisement, ScanError};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::debug;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_ACTIVE: u8 = 0x01;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

const HCI_MAX_EVENT_SIZE: usize = 258;

// AD types
const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Build an HCI command packet.
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let [op_lo, op_hi] = ((ogf << 10) | ocf).to_le_bytes();
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.extend_from_slice(&[HCI_COMMAND_PKT, op_lo, op_hi, params.len() as u8]);
    packet.extend_from_slice(params);
    packet
}

/// Parameters of LE Set Scan Parameters: active scan, 10 ms interval and
/// window (in 0.625 ms units).
fn scan_parameters() -> [u8; 7] {
    let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
    let [window_lo, window_hi] = SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_ACTIVE,
        interval_lo,
        interval_hi,
        window_lo,
        window_hi,
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

fn os_error(what: &str) -> String {
    format!("{what}: {}", io::Error::last_os_error())
}

/// A raw, non-blocking HCI socket bound to one controller.
struct HciSocket(OwnedFd);

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // SOCK_NONBLOCK is required for AsyncFd
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(ScanError::RadioUnavailable(os_error("failed to create HCI socket")));
        }
        let socket = Self(unsafe { OwnedFd::from_raw_fd(fd) });

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.0.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(ScanError::RadioUnavailable(os_error(&format!(
                "failed to bind hci{dev_id}"
            ))));
        }
        Ok(socket)
    }

    /// Only deliver LE meta events.
    fn filter_le_events(&self) -> Result<(), ScanError> {
        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);

        let ret = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                &filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(ScanError::Bluetooth(os_error("failed to set HCI filter")));
        }
        Ok(())
    }

    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(ScanError::Bluetooth(os_error("failed to send HCI command")));
        }
        Ok(())
    }

    fn set_scan_enable(&self, enabled: bool) -> Result<(), ScanError> {
        // Duplicates are not filtered by the controller; dedup happens above.
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[u8::from(enabled), 0x00])
    }

    fn start_le_scan(&self) -> Result<(), ScanError> {
        self.send_command(OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters())?;
        self.set_scan_enable(true)
    }
}

/// Find the advertised local name among AD structures, preferring the
/// complete name.
fn local_name(ad_data: &[u8]) -> Option<String> {
    let mut short = None;
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }
        let value = &ad_data[offset + 2..offset + 1 + len];
        match ad_data[offset + 1] {
            AD_TYPE_COMPLETE_LOCAL_NAME => return Some(String::from_utf8_lossy(value).into_owned()),
            AD_TYPE_SHORT_LOCAL_NAME => short = Some(String::from_utf8_lossy(value).into_owned()),
            _ => {}
        }
        offset += 1 + len;
    }
    short
}

/// Parse an LE advertising report event into a raw advertisement.
///
/// Only the first report of the event is used; controllers deliver one per
/// event in practice.
fn parse_advertising_report(data: &[u8], timestamp: SystemTime) -> Option<RawAdvertisement> {
    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let report = data.get(4..)?;

    // Number of reports
    if *report.first()? == 0 {
        return None;
    }

    // Layout: num_reports(1) + event_type(1) + addr_type(1) + addr(6) + data_len(1)
    if report.len() < 10 {
        return None;
    }

    let mut addr = [0u8; 6];
    addr.copy_from_slice(&report[3..9]);

    let data_len = report[9] as usize;
    let ad_data = report.get(10..10 + data_len)?;
    // RSSI follows the AD data as a signed byte
    let rssi = report.get(10 + data_len).map_or(0, |&b| b as i8 as i16);

    Some(RawAdvertisement {
        address: MacAddress::from_le_bytes(addr),
        name: local_name(ad_data),
        rssi,
        record: ad_data.to_vec(),
        timestamp,
    })
}

/// Fill in the name of an advertisement that carries none from an earlier
/// report of the same address.
///
/// iBeacon advertisements leave no room for a local name; it arrives in the
/// scan response, which the controller reports separately.
fn remember_name(names: &mut HashMap<MacAddress, String>, adv: &mut RawAdvertisement) {
    match &adv.name {
        Some(name) => {
            names.insert(adv.address, name.clone());
        }
        None => adv.name = names.get(&adv.address).cloned(),
    }
}

/// Read HCI events from `events` and forward advertising reports.
///
/// Names are remembered for the lifetime of one scan session.
async fn read_reports(events: AsyncFd<HciSocket>, tx: mpsc::Sender<RawAdvertisement>) {
    let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
    let mut names = HashMap::new();

    loop {
        let mut guard = match events.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                debug!("HCI socket closed: {e}");
                return;
            }
        };

        // Drain everything queued before waiting again.
        while let Ok(Ok(n)) = guard.try_io(|socket| read_packet(socket.get_ref(), &mut buf)) {
            if n == 0 {
                break;
            }
            let packet = &buf[..n];
            let is_report = packet.len() >= 4
                && packet[0] == HCI_EVENT_PKT
                && packet[1] == EVT_LE_META_EVENT
                && packet[3] == EVT_LE_ADVERTISING_REPORT;
            if !is_report {
                continue;
            }
            if let Some(mut adv) = parse_advertising_report(packet, SystemTime::now()) {
                remember_name(&mut names, &mut adv);
                if tx.send(adv).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn read_packet(socket: &HciSocket, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe {
        libc::read(
            socket.0.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Radio backed by raw HCI sockets on one controller.
///
/// Scans actively so that scan responses, which carry the local name of an
/// iBeacon, are reported too.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub struct HciRadio {
    dev_id: u16,
    session: Mutex<Option<HciSession>>,
}

struct HciSession {
    commands: HciSocket,
    reader: JoinHandle<()>,
}

impl HciRadio {
    pub fn new(dev_id: u16) -> Self {
        Self {
            dev_id,
            session: Mutex::new(None),
        }
    }

    fn end_session(&self) -> Result<(), ScanError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match session {
            Some(session) => {
                session.reader.abort();
                session.commands.set_scan_enable(false)
            }
            None => Ok(()),
        }
    }
}

impl Radio for HciRadio {
    fn start_scan(&self) -> RadioFuture<'_, mpsc::Receiver<RawAdvertisement>> {
        Box::pin(async move {
            self.end_session()?;

            let events = HciSocket::open(self.dev_id)?;
            events.filter_le_events()?;
            let events = AsyncFd::new(events)
                .map_err(|e| ScanError::Bluetooth(format!("failed to register HCI socket: {e}")))?;

            let commands = HciSocket::open(self.dev_id)?;
            commands.start_le_scan()?;

            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            let reader = tokio::spawn(read_reports(events, tx));
            debug!("HCI scan started on hci{}", self.dev_id);

            *self.session.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(HciSession { commands, reader });
            Ok(rx)
        })
    }

    fn stop_scan(&self) -> RadioFuture<'_, ()> {
        Box::pin(async move { self.end_session() })
    }
}

//! Simulated Radio
//!
//! An in-process "air" shared by simulated centrals and peripherals. It
//! behaves like a platform stack from the outside: scans are filtered by
//! service, advertisements are limited to 31 bytes, reads are carried in
//! MTU-sized responses and reassembled with offset reads, and every
//! outcome is delivered as an event on the caller's channel.
//!
//! ```text
//!  SimCentral ──┐                    ┌── SimPeripheral
//!               ├──── Arc<SimAir> ───┤
//!  SimCentral ──┘  scans, adverts,   └── SimPeripheral
//!                  links, requests
//! ```

use super::{
    AdvertiseData, AdvertiseEvent, AdvertiseHandle, AdvertiseSettings, CentralRadio,
    GattClientEvent, GattServerEvent, LinkEvent, LinkId, LocalService, PeripheralRadio,
    RemoteCharacteristic, RemoteService, ScanEvent, ScanHandle, ServerHandle,
};
use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::domain::models::{DiscoveredDevice, RemoteDevice};
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol::{
    AdvertiseErrorCode, GattStatus, MAX_LEGACY_ADVERTISING_DATA, MAX_READ_RESPONSE_LEN,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct ActiveScan {
    filter: ServiceId,
    events: mpsc::UnboundedSender<ScanEvent>,
}

struct Advertisement {
    owner: String,
    name: String,
    service_ids: Vec<ServiceId>,
    connectable: bool,
    expires_at: Option<Instant>,
}

impl Advertisement {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

struct HostedServer {
    owner: String,
    events: mpsc::UnboundedSender<GattServerEvent>,
    services: Vec<LocalService>,
}

struct Link {
    central: RemoteDevice,
    peripheral: String,
    events: mpsc::UnboundedSender<LinkEvent>,
}

enum PendingKind {
    Read {
        link: LinkId,
        characteristic: CharacteristicId,
        received: Vec<u8>,
    },
    Write {
        link: LinkId,
        characteristic: CharacteristicId,
    },
    Probe(oneshot::Sender<(GattStatus, Vec<u8>)>),
}

struct PendingRequest {
    server: ServerHandle,
    device: RemoteDevice,
    kind: PendingKind,
}

#[derive(Default)]
struct Faults {
    scan_failure: Option<i32>,
    advertise_failure: Option<AdvertiseErrorCode>,
    refuse_connections: bool,
}

#[derive(Default)]
struct AirState {
    next_handle: u64,
    next_request_id: u32,
    scans: HashMap<u64, ActiveScan>,
    advertisements: HashMap<u64, Advertisement>,
    servers: HashMap<u64, HostedServer>,
    links: HashMap<u64, Link>,
    pending: HashMap<u32, PendingRequest>,
    faults: Faults,
    central_calls: usize,
    connect_attempts: usize,
}

impl AirState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn next_request_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    /// A peripheral that advertises only accepts links while a connectable
    /// advertisement is live; one that does not advertise is reachable if it hosts a server
    fn accepts_connections(&self, address: &str) -> bool {
        let mut adverts = self
            .advertisements
            .values()
            .filter(|a| a.owner == address)
            .peekable();
        if adverts.peek().is_some() {
            adverts.any(|a| a.connectable && a.is_live())
        } else {
            self.servers.values().any(|s| s.owner == address)
        }
    }

    /// Server on `peripheral` hosting the characteristic, first registered wins
    fn server_for(
        &self,
        peripheral: &str,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Option<ServerHandle> {
        let mut handles: Vec<_> = self
            .servers
            .iter()
            .filter(|(_, s)| s.owner == peripheral)
            .filter(|(_, s)| {
                s.services.iter().any(|svc| {
                    svc.id == service && svc.characteristics.iter().any(|c| c.id == characteristic)
                })
            })
            .map(|(h, _)| *h)
            .collect();
        handles.sort_unstable();
        handles.first().map(|h| ServerHandle(*h))
    }

    fn notify_server_connection(&self, peripheral: &str, device: &RemoteDevice, connected: bool) {
        for server in self.servers.values().filter(|s| s.owner == peripheral) {
            let _ = server.events.send(GattServerEvent::ConnectionStateChanged {
                device: device.clone(),
                connected,
            });
        }
    }

    fn report_to_scans(&self, device: &DiscoveredDevice) {
        for scan in self.scans.values() {
            if device.advertises(&scan.filter) {
                let _ = scan.events.send(ScanEvent::Result(device.clone()));
            }
        }
    }

    fn close_link(&mut self, link: u64) -> Option<Link> {
        let removed = self.links.remove(&link)?;
        self.notify_server_connection(&removed.peripheral, &removed.central, false);
        Some(removed)
    }
}

/// Shared simulated air
#[derive(Default)]
pub struct SimAir {
    state: Mutex<AirState>,
}

impl SimAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A central radio with its own address
    pub fn central(self: &Arc<Self>, address: &str) -> SimCentral {
        SimCentral {
            air: self.clone(),
            identity: RemoteDevice::new(address, None),
        }
    }

    /// A peripheral radio with its own address and device name
    pub fn peripheral(self: &Arc<Self>, address: &str, name: &str) -> SimPeripheral {
        SimPeripheral {
            air: self.clone(),
            address: address.to_string(),
            name: name.to_string(),
        }
    }

    /// Deliver an advertisement from a device that has no simulated stack
    pub fn inject_advertisement(&self, device: DiscoveredDevice) {
        self.lock().report_to_scans(&device);
    }

    /// Make the next scan start fail with `code`
    pub fn fail_next_scan(&self, code: i32) {
        self.lock().faults.scan_failure = Some(code);
    }

    /// Make advertising fail with `code` until cleared
    pub fn fail_advertising(&self, code: Option<AdvertiseErrorCode>) {
        self.lock().faults.advertise_failure = code;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().faults.refuse_connections = refuse;
    }

    /// Drop every link touching `address`, as if the remote went out of range
    pub fn drop_links(&self, address: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .links
            .iter()
            .filter(|(_, l)| l.peripheral == address || l.central.address == address)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(link) = state.close_link(id) {
                let _ = link.events.send(LinkEvent {
                    link: LinkId(id),
                    event: GattClientEvent::ConnectionStateChanged { connected: false },
                });
            }
        }
    }

    /// Report a connection state change from a central with no simulated stack
    pub fn probe_connection(&self, peripheral: &str, device: RemoteDevice, connected: bool) {
        self.lock()
            .notify_server_connection(peripheral, &device, connected);
    }

    /// Send a raw read request to the server hosting `characteristic` on
    /// `peripheral`. The response is returned unsplit.
    pub fn probe_read(
        &self,
        peripheral: &str,
        from: RemoteDevice,
        service: ServiceId,
        characteristic: CharacteristicId,
        offset: usize,
    ) -> Result<oneshot::Receiver<(GattStatus, Vec<u8>)>, GattError> {
        let mut state = self.lock();
        let server = state
            .server_for(peripheral, service, characteristic)
            .ok_or(GattError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        let request_id = state.next_request_id();
        state.pending.insert(
            request_id,
            PendingRequest {
                server,
                device: from.clone(),
                kind: PendingKind::Probe(tx),
            },
        );
        if let Some(hosted) = state.servers.get(&server.0) {
            let _ = hosted.events.send(GattServerEvent::CharacteristicReadRequest {
                device: from,
                request_id,
                offset,
                characteristic,
            });
        }
        Ok(rx)
    }

    /// Send a raw write request that expects a response
    pub fn probe_write(
        &self,
        peripheral: &str,
        from: RemoteDevice,
        service: ServiceId,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Result<oneshot::Receiver<(GattStatus, Vec<u8>)>, GattError> {
        let mut state = self.lock();
        let server = state
            .server_for(peripheral, service, characteristic)
            .ok_or(GattError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        let request_id = state.next_request_id();
        state.pending.insert(
            request_id,
            PendingRequest {
                server,
                device: from.clone(),
                kind: PendingKind::Probe(tx),
            },
        );
        if let Some(hosted) = state.servers.get(&server.0) {
            let _ = hosted.events.send(GattServerEvent::CharacteristicWriteRequest {
                device: from,
                request_id,
                characteristic,
                offset: 0,
                value: value.to_vec(),
                response_needed: true,
            });
        }
        Ok(rx)
    }

    pub fn active_scans(&self) -> usize {
        self.lock().scans.len()
    }

    pub fn active_advertisements(&self) -> usize {
        self.lock().advertisements.values().filter(|a| a.is_live()).count()
    }

    pub fn open_servers(&self) -> usize {
        self.lock().servers.len()
    }

    pub fn open_links(&self) -> usize {
        self.lock().links.len()
    }

    /// Number of calls made through any simulated central
    pub fn central_calls(&self) -> usize {
        self.lock().central_calls
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }
}

/// Central radio attached to a [`SimAir`]
pub struct SimCentral {
    air: Arc<SimAir>,
    identity: RemoteDevice,
}

impl SimCentral {
    fn issue_request(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
        write: Option<&[u8]>,
    ) -> Result<(), GattError> {
        let mut state = self.air.lock();
        state.central_calls += 1;

        let (peripheral, events) = match state.links.get(&link.0) {
            Some(l) => (l.peripheral.clone(), l.events.clone()),
            None => return Err(GattError::NotConnected),
        };

        let Some(server) = state.server_for(&peripheral, service, characteristic) else {
            let event = match write {
                Some(_) => GattClientEvent::CharacteristicWritten {
                    characteristic,
                    status: GattStatus::AttributeNotFound,
                },
                None => GattClientEvent::CharacteristicRead {
                    characteristic,
                    status: GattStatus::AttributeNotFound,
                    value: Vec::new(),
                },
            };
            let _ = events.send(LinkEvent { link, event });
            return Ok(());
        };

        let request_id = state.next_request_id();
        let device = self.identity.clone();
        let (kind, request) = match write {
            Some(value) => (
                PendingKind::Write {
                    link,
                    characteristic,
                },
                GattServerEvent::CharacteristicWriteRequest {
                    device: device.clone(),
                    request_id,
                    characteristic,
                    offset: 0,
                    value: value.to_vec(),
                    response_needed: true,
                },
            ),
            None => (
                PendingKind::Read {
                    link,
                    characteristic,
                    received: Vec::new(),
                },
                GattServerEvent::CharacteristicReadRequest {
                    device: device.clone(),
                    request_id,
                    offset: 0,
                    characteristic,
                },
            ),
        };
        state.pending.insert(
            request_id,
            PendingRequest {
                server,
                device,
                kind,
            },
        );
        if let Some(hosted) = state.servers.get(&server.0) {
            let _ = hosted.events.send(request);
        }
        Ok(())
    }
}

impl CentralRadio for SimCentral {
    fn start_scan(
        &self,
        filter: ServiceId,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<ScanHandle, GattError> {
        let mut state = self.air.lock();
        state.central_calls += 1;
        let handle = state.next_handle();

        if let Some(code) = state.faults.scan_failure.take() {
            debug!("Simulated scan failure {}", code);
            let _ = events.send(ScanEvent::Failed(code));
            return Ok(ScanHandle(handle));
        }

        for advert in state.advertisements.values().filter(|a| a.is_live()) {
            if advert.service_ids.contains(&filter) {
                let device = DiscoveredDevice::new(
                    advert.owner.clone(),
                    Some(advert.name.clone()),
                    advert.service_ids.iter().copied(),
                );
                let _ = events.send(ScanEvent::Result(device));
            }
        }
        state.scans.insert(handle, ActiveScan { filter, events });
        Ok(ScanHandle(handle))
    }

    fn stop_scan(&self, scan: ScanHandle) {
        self.air.lock().scans.remove(&scan.0);
    }

    fn connect(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<LinkId, GattError> {
        let mut state = self.air.lock();
        state.central_calls += 1;
        state.connect_attempts += 1;
        let link = LinkId(state.next_handle());

        if state.faults.refuse_connections || !state.accepts_connections(address) {
            debug!("Simulated connection to {} refused", address);
            let _ = events.send(LinkEvent {
                link,
                event: GattClientEvent::ConnectionStateChanged { connected: false },
            });
            return Ok(link);
        }

        let _ = events.send(LinkEvent {
            link,
            event: GattClientEvent::ConnectionStateChanged { connected: true },
        });
        state.notify_server_connection(address, &self.identity, true);
        state.links.insert(
            link.0,
            Link {
                central: self.identity.clone(),
                peripheral: address.to_string(),
                events,
            },
        );
        Ok(link)
    }

    fn discover_services(&self, link: LinkId) -> Result<(), GattError> {
        let mut state = self.air.lock();
        state.central_calls += 1;
        let Some(l) = state.links.get(&link.0) else {
            return Err(GattError::NotConnected);
        };

        let mut handles: Vec<_> = state
            .servers
            .iter()
            .filter(|(_, s)| s.owner == l.peripheral)
            .map(|(h, _)| *h)
            .collect();
        handles.sort_unstable();

        let services = handles
            .iter()
            .filter_map(|h| state.servers.get(h))
            .flat_map(|s| s.services.iter())
            .map(|svc| RemoteService {
                id: svc.id,
                characteristics: svc
                    .characteristics
                    .iter()
                    .map(|c| RemoteCharacteristic {
                        id: c.id,
                        properties: c.properties,
                    })
                    .collect(),
            })
            .collect();

        let _ = l.events.send(LinkEvent {
            link,
            event: GattClientEvent::ServicesDiscovered {
                status: GattStatus::Success,
                services,
            },
        });
        Ok(())
    }

    fn read_characteristic(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError> {
        self.issue_request(link, service, characteristic, None)
    }

    fn write_characteristic(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Result<(), GattError> {
        self.issue_request(link, service, characteristic, Some(value))
    }

    fn disconnect(&self, link: LinkId) {
        let mut state = self.air.lock();
        state.central_calls += 1;
        if state.close_link(link.0).is_some() {
            trace!("Simulated link {:?} closed by central", link);
        }
    }
}

/// Peripheral radio attached to a [`SimAir`]
pub struct SimPeripheral {
    air: Arc<SimAir>,
    address: String,
    name: String,
}

impl SimPeripheral {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl PeripheralRadio for SimPeripheral {
    fn open_gatt_server(
        &self,
        events: mpsc::UnboundedSender<GattServerEvent>,
    ) -> Result<ServerHandle, GattError> {
        let mut state = self.air.lock();
        let handle = state.next_handle();
        state.servers.insert(
            handle,
            HostedServer {
                owner: self.address.clone(),
                events,
                services: Vec::new(),
            },
        );
        Ok(ServerHandle(handle))
    }

    fn add_service(&self, server: ServerHandle, service: &LocalService) -> Result<(), GattError> {
        let mut state = self.air.lock();
        let hosted = state
            .servers
            .get_mut(&server.0)
            .ok_or_else(|| GattError::Radio(format!("GATT server {:?} is closed", server)))?;
        hosted.services.push(service.clone());
        Ok(())
    }

    fn send_response(
        &self,
        server: ServerHandle,
        device: &str,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), GattError> {
        let mut state = self.air.lock();
        let Some(pending) = state.pending.remove(&request_id) else {
            return Err(GattError::Radio(format!("Unknown request id {}", request_id)));
        };
        if pending.server != server || pending.device.address != device {
            let message = format!("Request {} does not belong to {}", request_id, device);
            state.pending.insert(request_id, pending);
            return Err(GattError::Radio(message));
        }

        match pending.kind {
            PendingKind::Probe(reply) => {
                let _ = reply.send((status, value.to_vec()));
            }
            PendingKind::Write {
                link,
                characteristic,
            } => {
                if let Some(l) = state.links.get(&link.0) {
                    let _ = l.events.send(LinkEvent {
                        link,
                        event: GattClientEvent::CharacteristicWritten {
                            characteristic,
                            status,
                        },
                    });
                } else {
                    trace!("Write response for closed link {:?} dropped", link);
                }
            }
            PendingKind::Read {
                link,
                characteristic,
                mut received,
            } => {
                let Some(l) = state.links.get(&link.0) else {
                    trace!("Read response for closed link {:?} dropped", link);
                    return Ok(());
                };
                let events = l.events.clone();

                if offset != received.len() {
                    warn!(
                        "Read response offset {} does not match requested {}",
                        offset,
                        received.len()
                    );
                }

                let chunk = &value[..value.len().min(MAX_READ_RESPONSE_LEN)];
                if status.is_success() {
                    received.extend_from_slice(chunk);
                }

                // A full response means the value may continue; read the blob at the next offset
                if status.is_success() && chunk.len() == MAX_READ_RESPONSE_LEN {
                    let next_id = state.next_request_id();
                    let request = GattServerEvent::CharacteristicReadRequest {
                        device: pending.device.clone(),
                        request_id: next_id,
                        offset: received.len(),
                        characteristic,
                    };
                    state.pending.insert(
                        next_id,
                        PendingRequest {
                            server,
                            device: pending.device,
                            kind: PendingKind::Read {
                                link,
                                characteristic,
                                received,
                            },
                        },
                    );
                    if let Some(hosted) = state.servers.get(&server.0) {
                        let _ = hosted.events.send(request);
                    }
                } else {
                    let _ = events.send(LinkEvent {
                        link,
                        event: GattClientEvent::CharacteristicRead {
                            characteristic,
                            status,
                            value: received,
                        },
                    });
                }
            }
        }
        Ok(())
    }

    fn close_gatt_server(&self, server: ServerHandle) {
        let mut state = self.air.lock();
        state.servers.remove(&server.0);
        state.pending.retain(|_, p| p.server != server);
    }

    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        events: mpsc::UnboundedSender<AdvertiseEvent>,
    ) -> Result<AdvertiseHandle, GattError> {
        let mut state = self.air.lock();
        let handle = state.next_handle();

        if let Some(code) = state.faults.advertise_failure {
            let _ = events.send(AdvertiseEvent::StartFailed(code));
            return Ok(AdvertiseHandle(handle));
        }
        if data.payload_len(&self.name) > MAX_LEGACY_ADVERTISING_DATA {
            let _ = events.send(AdvertiseEvent::StartFailed(AdvertiseErrorCode::DataTooLarge));
            return Ok(AdvertiseHandle(handle));
        }

        let device = DiscoveredDevice::new(
            self.address.clone(),
            Some(self.name.clone()),
            data.service_ids.iter().copied(),
        );
        state.advertisements.insert(
            handle,
            Advertisement {
                owner: self.address.clone(),
                name: self.name.clone(),
                service_ids: data.service_ids.clone(),
                connectable: settings.connectable,
                expires_at: (!settings.timeout.is_zero())
                    .then(|| Instant::now() + settings.timeout),
            },
        );
        debug!(
            "Simulated advertising from {} ({:?}, connectable: {})",
            self.address, settings.mode, settings.connectable
        );
        let _ = events.send(AdvertiseEvent::Started);
        state.report_to_scans(&device);
        Ok(AdvertiseHandle(handle))
    }

    fn stop_advertising(&self, advertisement: AdvertiseHandle) {
        self.air.lock().advertisements.remove(&advertisement.0);
    }
}

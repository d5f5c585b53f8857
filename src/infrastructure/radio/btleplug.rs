//! btleplug Backend
//!
//! Central role over the host's first Bluetooth adapter. btleplug exposes
//! async calls, so each request is spawned onto the runtime and its
//! outcome reported as an event, the same way the simulated radio does.

use super::{
    CentralRadio, GattClientEvent, LinkEvent, LinkId, RemoteCharacteristic, RemoteService,
    ScanEvent, ScanHandle,
};
use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::domain::models::DiscoveredDevice;
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol::{scan_error, CharacteristicProperties, GattStatus};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct LinkEntry {
    peripheral: Option<Peripheral>,
    events: mpsc::UnboundedSender<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkEntry {
    /// Keep `task` abortable until the link goes; completed requests are dropped
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }
}

#[derive(Default)]
struct BackendState {
    next_handle: u64,
    scans: HashMap<u64, JoinHandle<()>>,
    links: HashMap<u64, LinkEntry>,
}

impl BackendState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct BtleplugCentral {
    adapter: Adapter,
    runtime: Handle,
    state: Arc<Mutex<BackendState>>,
}

impl BtleplugCentral {
    /// Open the first adapter; must be called from within a tokio runtime
    pub async fn new() -> Result<Self, GattError> {
        let manager = Manager::new().await.map_err(radio_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_error)?
            .into_iter()
            .next()
            .ok_or_else(|| GattError::Radio("No Bluetooth adapter found".to_string()))?;
        info!(
            "Using Bluetooth adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );

        Ok(Self {
            adapter,
            runtime: Handle::current(),
            state: Arc::new(Mutex::new(BackendState::default())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        lock(&self.state)
    }

    fn peripheral(
        &self,
        link: LinkId,
    ) -> Result<(Peripheral, mpsc::UnboundedSender<LinkEvent>), GattError> {
        let state = self.lock();
        let entry = state.links.get(&link.0).ok_or(GattError::NotConnected)?;
        let peripheral = entry.peripheral.clone().ok_or(GattError::NotConnected)?;
        Ok((peripheral, entry.events.clone()))
    }

    fn track(&self, link: LinkId, task: JoinHandle<()>) {
        match self.lock().links.get_mut(&link.0) {
            Some(entry) => entry.track(task),
            None => task.abort(),
        }
    }
}

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn radio_error(error: btleplug::Error) -> GattError {
    GattError::Radio(error.to_string())
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: ServiceId,
    characteristic: CharacteristicId,
) -> Option<btleplug::api::Characteristic> {
    peripheral.characteristics().into_iter().find(|c| {
        c.uuid == characteristic.as_uuid() && c.service_uuid == service.as_uuid()
    })
}

impl CentralRadio for BtleplugCentral {
    fn start_scan(
        &self,
        filter: ServiceId,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<ScanHandle, GattError> {
        let adapter = self.adapter.clone();
        let task = self.runtime.spawn(async move {
            let mut stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to subscribe to adapter events: {}", e);
                    let code = scan_error::APPLICATION_REGISTRATION_FAILED;
                    let _ = events.send(ScanEvent::Failed(code));
                    return;
                }
            };
            let scan_filter = ScanFilter {
                services: vec![filter.as_uuid()],
            };
            if let Err(e) = adapter.start_scan(scan_filter).await {
                warn!("Failed to start scan: {}", e);
                let _ = events.send(ScanEvent::Failed(scan_error::INTERNAL_ERROR));
                return;
            }

            while let Some(event) = stream.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };

                // Not every platform honours the scan filter
                let services: Vec<ServiceId> =
                    props.services.iter().copied().map(ServiceId::from_uuid).collect();
                if !services.contains(&filter) {
                    continue;
                }

                let device =
                    DiscoveredDevice::new(props.address.to_string(), props.local_name, services);
                if events.send(ScanEvent::Result(device)).is_err() {
                    break;
                }
            }
        });

        let mut state = self.lock();
        let handle = state.next_handle();
        state.scans.insert(handle, task);
        Ok(ScanHandle(handle))
    }

    fn stop_scan(&self, scan: ScanHandle) {
        let Some(task) = self.lock().scans.remove(&scan.0) else {
            return;
        };
        task.abort();

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<LinkId, GattError> {
        let link = {
            let mut state = self.lock();
            let link = LinkId(state.next_handle());
            state.links.insert(
                link.0,
                LinkEntry {
                    peripheral: None,
                    events: events.clone(),
                    tasks: Vec::new(),
                },
            );
            link
        };

        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let address = address.to_string();
        let task = self.runtime.spawn(async move {
            let connected = async {
                let peripheral = adapter
                    .peripherals()
                    .await?
                    .into_iter()
                    .find(|p| p.address().to_string().eq_ignore_ascii_case(&address))
                    .ok_or(btleplug::Error::DeviceNotFound)?;
                peripheral.connect().await?;
                Ok::<_, btleplug::Error>(peripheral)
            }
            .await;

            let peripheral = match connected {
                Ok(peripheral) => peripheral,
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    let _ = events.send(LinkEvent {
                        link,
                        event: GattClientEvent::ConnectionStateChanged { connected: false },
                    });
                    return;
                }
            };

            match lock(&state).links.get_mut(&link.0) {
                Some(entry) => entry.peripheral = Some(peripheral.clone()),
                None => {
                    // Disconnected while connecting
                    let _ = peripheral.disconnect().await;
                    return;
                }
            }
            let _ = events.send(LinkEvent {
                link,
                event: GattClientEvent::ConnectionStateChanged { connected: true },
            });

            // Report link loss
            let Ok(mut adapter_events) = adapter.events().await else {
                return;
            };
            let id = peripheral.id();
            while let Some(event) = adapter_events.next().await {
                if matches!(event, CentralEvent::DeviceDisconnected(ref gone) if *gone == id) {
                    let _ = events.send(LinkEvent {
                        link,
                        event: GattClientEvent::ConnectionStateChanged { connected: false },
                    });
                    break;
                }
            }
        });

        self.track(link, task);
        Ok(link)
    }

    fn discover_services(&self, link: LinkId) -> Result<(), GattError> {
        let (peripheral, events) = self.peripheral(link)?;
        let task = self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => GattClientEvent::ServicesDiscovered {
                    status: GattStatus::Success,
                    services: peripheral
                        .services()
                        .into_iter()
                        .map(|service| RemoteService {
                            id: ServiceId::from_uuid(service.uuid),
                            characteristics: service
                                .characteristics
                                .into_iter()
                                .map(|c| RemoteCharacteristic {
                                    id: CharacteristicId::from_uuid(c.uuid),
                                    properties: CharacteristicProperties(c.properties.bits()),
                                })
                                .collect(),
                        })
                        .collect(),
                },
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    GattClientEvent::ServicesDiscovered {
                        status: GattStatus::Failure,
                        services: Vec::new(),
                    }
                }
            };
            let _ = events.send(LinkEvent { link, event });
        });
        self.track(link, task);
        Ok(())
    }

    fn read_characteristic(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError> {
        let (peripheral, events) = self.peripheral(link)?;
        let task = self.runtime.spawn(async move {
            let (status, value) = match find_characteristic(&peripheral, service, characteristic) {
                None => (GattStatus::AttributeNotFound, Vec::new()),
                Some(target) => match peripheral.read(&target).await {
                    Ok(value) => (GattStatus::Success, value),
                    Err(e) => {
                        warn!("Read of {} failed: {}", characteristic, e);
                        (GattStatus::Failure, Vec::new())
                    }
                },
            };
            let _ = events.send(LinkEvent {
                link,
                event: GattClientEvent::CharacteristicRead {
                    characteristic,
                    status,
                    value,
                },
            });
        });
        self.track(link, task);
        Ok(())
    }

    fn write_characteristic(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Result<(), GattError> {
        let (peripheral, events) = self.peripheral(link)?;
        let value = value.to_vec();
        let task = self.runtime.spawn(async move {
            let status = match find_characteristic(&peripheral, service, characteristic) {
                None => GattStatus::AttributeNotFound,
                Some(target) => {
                    match peripheral
                        .write(&target, &value, WriteType::WithResponse)
                        .await
                    {
                        Ok(()) => GattStatus::Success,
                        Err(e) => {
                            warn!("Write of {} failed: {}", characteristic, e);
                            GattStatus::Failure
                        }
                    }
                }
            };
            let _ = events.send(LinkEvent {
                link,
                event: GattClientEvent::CharacteristicWritten {
                    characteristic,
                    status,
                },
            });
        });
        self.track(link, task);
        Ok(())
    }

    fn disconnect(&self, link: LinkId) {
        let Some(entry) = self.lock().links.remove(&link.0) else {
            return;
        };
        for task in entry.tasks {
            task.abort();
        }
        if let Some(peripheral) = entry.peripheral {
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect failed: {}", e);
                }
            });
        }
    }
}

//! Peripheral GATT Server Module
//!
//! Hosts one service with one read/write characteristic, advertises the
//! service and answers requests from connected centrals.

use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::domain::models::{AppEvent, MessageSeverity, RemoteDevice, StatusMessage, WriteRequest};
use crate::error::GattError;
use crate::infrastructure::bluetooth::advertiser::Advertiser;
use crate::infrastructure::bluetooth::protocol::{
    read_slice, AttributePermissions, CharacteristicProperties, GattStatus,
};
use crate::infrastructure::radio::{
    AdvertiseSettings, GattServerEvent, LocalCharacteristic, LocalService, PeripheralRadio,
    ServerHandle,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The attribute table hosted by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicTable {
    pub service: ServiceId,
    pub characteristic: CharacteristicId,
}

impl CharacteristicTable {
    pub fn to_local_service(self) -> LocalService {
        LocalService {
            id: self.service,
            characteristics: vec![LocalCharacteristic {
                id: self.characteristic,
                properties: CharacteristicProperties::read_write(),
                permissions: AttributePermissions::read_write(),
            }],
        }
    }
}

struct RunningServer {
    handle: ServerHandle,
    task: JoinHandle<()>,
}

/// GATT server plus its advertisement
pub struct PeripheralServer {
    radio: Arc<dyn PeripheralRadio>,
    advertiser: Advertiser,
    advertise_settings: AdvertiseSettings,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    read_value: watch::Sender<Vec<u8>>,
    connected: Arc<watch::Sender<Vec<RemoteDevice>>>,
    running: Option<RunningServer>,
}

impl PeripheralServer {
    pub fn new(
        radio: Arc<dyn PeripheralRadio>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            advertiser: Advertiser::new(radio.clone()),
            radio,
            advertise_settings: AdvertiseSettings::default(),
            event_sender,
            read_value: watch::channel(Vec::new()).0,
            connected: Arc::new(watch::channel(Vec::new()).0),
            running: None,
        }
    }

    /// Settings used by the next `start`
    pub fn set_advertise_settings(&mut self, settings: AdvertiseSettings) {
        self.advertise_settings = settings;
    }

    /// Register the attribute table and begin advertising `service`
    ///
    /// A running server is stopped first. If advertising is rejected the
    /// freshly opened server is closed again before the error is returned.
    /// Must be called from within a tokio runtime.
    pub async fn start(
        &mut self,
        service: ServiceId,
        characteristic: CharacteristicId,
        initial_value: Vec<u8>,
    ) -> Result<(), GattError> {
        self.stop();

        let table = CharacteristicTable {
            service,
            characteristic,
        };
        self.read_value.send_replace(initial_value);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.radio.open_gatt_server(tx)?;
        if let Err(e) = self.radio.add_service(handle, &table.to_local_service()) {
            error!("Failed to register service {}: {}", service, e);
            self.radio.close_gatt_server(handle);
            return Err(e);
        }

        if let Err(e) = self.advertiser.start(service, &self.advertise_settings).await {
            self.radio.close_gatt_server(handle);
            self.send_log(&format!("Advertising failed: {}", e), MessageSeverity::Error);
            return Err(e);
        }

        let actor = ServerActor {
            radio: self.radio.clone(),
            handle,
            table,
            read_value: self.read_value.subscribe(),
            connected: BTreeMap::new(),
            connected_tx: self.connected.clone(),
            event_sender: self.event_sender.clone(),
        };
        let task = tokio::spawn(actor.run(rx));

        info!("GATT server started: service {}, characteristic {}", service, characteristic);
        self.send_log("GATT server started", MessageSeverity::Success);
        self.running = Some(RunningServer {
            handle,
            task,
        });
        Ok(())
    }

    /// Unregister the server and stop advertising; a no-op when not started
    pub fn stop(&mut self) {
        self.advertiser.stop();
        if let Some(running) = self.running.take() {
            info!("Stopping GATT server {:?}", running.handle);
            self.radio.close_gatt_server(running.handle);
            running.task.abort();
            if !self.connected.borrow().is_empty() {
                self.connected.send_replace(Vec::new());
                let _ = self.event_sender.send(AppEvent::ConnectedDevices(Vec::new()));
            }
        }
    }

    /// Payload returned to subsequent read requests
    pub fn set_read_value(&self, value: impl Into<Vec<u8>>) {
        self.read_value.send_replace(value.into());
    }

    pub fn read_value(&self) -> Vec<u8> {
        self.read_value.borrow().clone()
    }

    /// Centrals currently connected, ordered by address
    pub fn connected_devices(&self) -> Vec<RemoteDevice> {
        self.connected.borrow().clone()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<Vec<RemoteDevice>> {
        self.connected.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for PeripheralServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the request side of a running server
struct ServerActor {
    radio: Arc<dyn PeripheralRadio>,
    handle: ServerHandle,
    table: CharacteristicTable,
    read_value: watch::Receiver<Vec<u8>>,
    connected: BTreeMap<String, RemoteDevice>,
    connected_tx: Arc<watch::Sender<Vec<RemoteDevice>>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ServerActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<GattServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                GattServerEvent::ConnectionStateChanged { device, connected } => {
                    self.connection_changed(device, connected)
                }
                GattServerEvent::CharacteristicReadRequest {
                    device,
                    request_id,
                    offset,
                    characteristic,
                } => self.read_requested(&device, request_id, offset, characteristic),
                GattServerEvent::CharacteristicWriteRequest {
                    device,
                    request_id,
                    characteristic,
                    offset,
                    value,
                    response_needed,
                } => self.write_requested(
                    device,
                    request_id,
                    characteristic,
                    offset,
                    value,
                    response_needed,
                ),
            }
        }
        debug!("GATT server {:?} event channel closed", self.handle);
    }

    fn connection_changed(&mut self, device: RemoteDevice, connected: bool) {
        let changed = if connected {
            info!("Central connected: {}", device.address);
            self.connected.insert(device.address.clone(), device).is_none()
        } else {
            // Unknown devices are ignored
            self.connected.remove(&device.address).is_some()
        };

        if changed {
            let devices: Vec<RemoteDevice> = self.connected.values().cloned().collect();
            self.connected_tx.send_replace(devices.clone());
            let _ = self.event_sender.send(AppEvent::ConnectedDevices(devices));
        }
    }

    fn read_requested(
        &self,
        device: &RemoteDevice,
        request_id: u32,
        offset: usize,
        characteristic: CharacteristicId,
    ) {
        if characteristic != self.table.characteristic {
            self.respond(device, request_id, GattStatus::AttributeNotFound, offset, &[]);
            return;
        }

        let value = self.read_value.borrow().clone();
        match read_slice(&value, offset) {
            Ok(slice) => {
                debug!("Read request {} from {} at offset {}", request_id, device.address, offset);
                self.respond(device, request_id, GattStatus::Success, offset, slice);
            }
            Err(status) => {
                warn!("Read request {} at invalid offset {}", request_id, offset);
                self.respond(device, request_id, status, offset, &[]);
            }
        }
    }

    fn write_requested(
        &self,
        device: RemoteDevice,
        request_id: u32,
        characteristic: CharacteristicId,
        offset: usize,
        value: Vec<u8>,
        response_needed: bool,
    ) {
        if characteristic != self.table.characteristic {
            if response_needed {
                self.respond(&device, request_id, GattStatus::AttributeNotFound, offset, &[]);
            }
            return;
        }

        let request = WriteRequest {
            device,
            request_id,
            offset,
            value,
        };
        info!("Write from {}: {}", request.device.address, request.text());

        // Acknowledge with the written bytes; the read value is left unchanged
        if response_needed {
            self.respond(
                &request.device,
                request_id,
                GattStatus::Success,
                offset,
                &request.value,
            );
        }
        let _ = self.event_sender.send(AppEvent::WriteReceived(request));
    }

    fn respond(
        &self,
        device: &RemoteDevice,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) {
        if let Err(e) =
            self.radio
                .send_response(self.handle, &device.address, request_id, status, offset, value)
        {
            error!("Failed to answer request {}: {}", request_id, e);
        }
    }
}

//! Radio Backends
//!
//! The platform BLE stack is driven through two traits. Methods only
//! *issue* requests; outcomes arrive later as events on the channel the
//! caller handed over, mirroring how platform stacks call back from their
//! own notification context. Components marshal those events onto their
//! own task before touching state.
//!
//! - [`sim`] - in-process simulated radio connecting centrals and peripherals
//! - `btleplug` - real adapters, central role only (feature `btleplug`)

#[cfg(feature = "btleplug")]
pub mod btleplug;
pub mod sim;

use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::domain::models::{DiscoveredDevice, RemoteDevice};
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol::{
    advertising_payload_len, AdvertiseErrorCode, AttributePermissions, CharacteristicProperties,
    GattStatus,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertiseHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result(DiscoveredDevice),
    Failed(i32),
}

/// Characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub id: CharacteristicId,
    pub properties: CharacteristicProperties,
}

/// Service found during service discovery, characteristics in discovery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub id: ServiceId,
    pub characteristics: Vec<RemoteCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattClientEvent {
    ConnectionStateChanged {
        connected: bool,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<RemoteService>,
    },
    CharacteristicRead {
        characteristic: CharacteristicId,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        characteristic: CharacteristicId,
        status: GattStatus,
    },
}

/// Client event tagged with the link it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link: LinkId,
    pub event: GattClientEvent,
}

/// Central role of the platform stack
pub trait CentralRadio: Send + Sync {
    /// Start a filtered scan. Matching advertisements and failures are sent
    /// on `events`; the sender is dropped once the scan is stopped.
    fn start_scan(
        &self,
        filter: ServiceId,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<ScanHandle, GattError>;

    /// Stop a scan. Unknown or already stopped handles are ignored.
    fn stop_scan(&self, scan: ScanHandle);

    /// Begin connecting; the outcome arrives as `ConnectionStateChanged`
    fn connect(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<LinkId, GattError>;

    fn discover_services(&self, link: LinkId) -> Result<(), GattError>;

    fn read_characteristic(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError>;

    fn write_characteristic(
        &self,
        link: LinkId,
        service: ServiceId,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Result<(), GattError>;

    /// Tear the link down and release it. No further events are delivered.
    fn disconnect(&self, link: LinkId);
}

/// Characteristic hosted by the local GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCharacteristic {
    pub id: CharacteristicId,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
}

/// Primary service hosted by the local GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalService {
    pub id: ServiceId,
    pub characteristics: Vec<LocalCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattServerEvent {
    ConnectionStateChanged {
        device: RemoteDevice,
        connected: bool,
    },
    CharacteristicReadRequest {
        device: RemoteDevice,
        request_id: u32,
        offset: usize,
        characteristic: CharacteristicId,
    },
    CharacteristicWriteRequest {
        device: RemoteDevice,
        request_id: u32,
        characteristic: CharacteristicId,
        offset: usize,
        value: Vec<u8>,
        response_needed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    #[default]
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    /// `Duration::ZERO` advertises until stopped
    pub timeout: Duration,
    pub connectable: bool,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::LowPower,
            timeout: Duration::ZERO,
            connectable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseData {
    pub service_ids: Vec<ServiceId>,
    pub include_device_name: bool,
}

impl AdvertiseData {
    /// Service identifier only. The device name does not fit next to a
    /// 128-bit UUID in a legacy advertisement.
    pub fn for_service(service: ServiceId) -> Self {
        Self {
            service_ids: vec![service],
            include_device_name: false,
        }
    }

    pub fn payload_len(&self, device_name: &str) -> usize {
        let name = self.include_device_name.then_some(device_name);
        advertising_payload_len(self.service_ids.len(), name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseEvent {
    Started,
    StartFailed(AdvertiseErrorCode),
}

/// Peripheral role of the platform stack
pub trait PeripheralRadio: Send + Sync {
    /// Open a GATT server; connection and request events go to `events`
    fn open_gatt_server(
        &self,
        events: mpsc::UnboundedSender<GattServerEvent>,
    ) -> Result<ServerHandle, GattError>;

    fn add_service(&self, server: ServerHandle, service: &LocalService) -> Result<(), GattError>;

    /// Answer a read or write request. Must be called once per request id.
    fn send_response(
        &self,
        server: ServerHandle,
        device: &str,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), GattError>;

    /// Close and unregister a server. Unknown handles are ignored.
    fn close_gatt_server(&self, server: ServerHandle);

    /// Begin advertising; the outcome arrives on `events`
    fn start_advertising(
        &self,
        settings: &AdvertiseSettings,
        data: &AdvertiseData,
        events: mpsc::UnboundedSender<AdvertiseEvent>,
    ) -> Result<AdvertiseHandle, GattError>;

    /// Stop advertising. Unknown handles are ignored.
    fn stop_advertising(&self, advertisement: AdvertiseHandle);
}

use crate::domain::identifier::ServiceId;
use crate::infrastructure::bluetooth::protocol::GattStatus;
use std::collections::BTreeSet;
use std::fmt;

/// Peripheral seen by the scanner, snapshotted at discovery time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Stable hardware identifier
    pub address: String,
    pub name: Option<String>,
    pub service_ids: BTreeSet<ServiceId>,
}

impl DiscoveredDevice {
    pub fn new(
        address: impl Into<String>,
        name: Option<String>,
        service_ids: impl IntoIterator<Item = ServiceId>,
    ) -> Self {
        Self {
            address: address.into(),
            name,
            service_ids: service_ids.into_iter().collect(),
        }
    }

    pub fn advertises(&self, service: &ServiceId) -> bool {
        self.service_ids.contains(service)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Central connected to our GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub address: String,
    pub name: Option<String>,
}

impl RemoteDevice {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }
}

/// Central session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    ServicesDiscovering,
    ServicesReady,
    Disconnected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::ServicesDiscovering => "discovering services",
            Self::ServicesReady => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// One entry of the central's read history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub address: String,
    pub status: GattStatus,
    pub value: Vec<u8>,
}

impl ReadRecord {
    /// Value decoded as UTF-8, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Write request received by the peripheral server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub device: RemoteDevice,
    pub request_id: u32,
    pub offset: usize,
    pub value: Vec<u8>,
}

impl WriteRequest {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Events emitted to the presentation layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(DiscoveredDevice),
    SessionState(SessionState),
    ReadCompleted(ReadRecord),
    WriteCompleted(GattStatus),
    ConnectedDevices(Vec<RemoteDevice>),
    WriteReceived(WriteRequest),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

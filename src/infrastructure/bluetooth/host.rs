//! Host Service Module
//!
//! Peripheral-role coordinator: starts the GATT server from settings and
//! applies read-value changes at runtime.

use crate::domain::models::{AppEvent, MessageSeverity, RemoteDevice, StatusMessage};
use crate::domain::settings::SettingsService;
use crate::error::GattError;
use crate::infrastructure::bluetooth::server::PeripheralServer;
use crate::infrastructure::radio::{AdvertiseSettings, PeripheralRadio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub struct HostService {
    server: PeripheralServer,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
}

impl HostService {
    pub fn new(
        radio: Arc<dyn PeripheralRadio>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        Self {
            server: PeripheralServer::new(radio, event_sender.clone()),
            event_sender,
            settings,
        }
    }

    /// Start (or restart) the server with the configured table and read text
    pub async fn start(&mut self) -> Result<(), GattError> {
        let (identifiers, read_text, mode) = {
            let settings = self.lock_settings();
            let s = settings.get();
            (s.identifiers(), s.read_text.clone(), s.advertise_mode)
        };
        let (service, characteristic) = match identifiers {
            Ok(ids) => ids,
            Err(e) => {
                self.send_log(&e.to_string(), MessageSeverity::Error);
                return Err(e);
            }
        };

        self.server.set_advertise_settings(AdvertiseSettings {
            mode,
            ..AdvertiseSettings::default()
        });
        self.server
            .start(service, characteristic, read_text.into_bytes())
            .await
    }

    pub fn stop(&mut self) {
        self.server.stop();
    }

    /// Change the text served to reads and persist it
    pub fn set_read_text(&mut self, text: &str) {
        self.server.set_read_value(text.as_bytes());
        info!("Read text set to {:?}", text);

        if let Err(e) = self.lock_settings().update_read_text(text) {
            warn!("Failed to persist read text: {}", e);
            self.send_log("Read text could not be saved", MessageSeverity::Warning);
        }
    }

    pub fn read_text(&self) -> String {
        String::from_utf8_lossy(&self.server.read_value()).into_owned()
    }

    pub fn connected_devices(&self) -> Vec<RemoteDevice> {
        self.server.connected_devices()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<Vec<RemoteDevice>> {
        self.server.subscribe_connected()
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    fn lock_settings(&self) -> MutexGuard<'_, SettingsService> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        GattStatus, DEFAULT_CHARACTERISTIC_ID, DEFAULT_SERVICE_ID,
    };
    use crate::infrastructure::radio::sim::SimAir;
    use std::path::PathBuf;

    const ADDRESS: &str = "AA:00:00:00:02:00";

    fn settings_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("ble_gatt_sample_host_{}_{}", name, std::process::id()))
            .join("settings.json")
    }

    fn host(air: &Arc<SimAir>, path: &PathBuf) -> HostService {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = Arc::new(Mutex::new(SettingsService::with_path(path)));
        HostService::new(Arc::new(air.peripheral(ADDRESS, "host")), tx, settings)
    }

    #[tokio::test]
    async fn test_serves_configured_text() {
        let air = SimAir::new();
        let path = settings_path("serve");
        let mut host = host(&air, &path);
        host.start().await.unwrap();
        assert!(host.is_running());

        let reply = air
            .probe_read(
                ADDRESS,
                RemoteDevice::new("CC:00", None),
                DEFAULT_SERVICE_ID,
                DEFAULT_CHARACTERISTIC_ID,
                0,
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(reply, (GattStatus::Success, b"Hello BLE".to_vec()));
    }

    #[tokio::test]
    async fn test_read_text_change_is_persisted() {
        let air = SimAir::new();
        let path = settings_path("persist");
        let mut host = host(&air, &path);
        host.start().await.unwrap();

        host.set_read_text("Updated");
        assert_eq!(host.read_text(), "Updated");
        assert_eq!(SettingsService::with_path(&path).get().read_text, "Updated");

        // Restart picks the persisted value up again
        host.start().await.unwrap();
        assert_eq!(host.read_text(), "Updated");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_stop_releases_resources() {
        let air = SimAir::new();
        let mut host = host(&air, &settings_path("stop"));
        host.start().await.unwrap();
        host.stop();
        host.stop();
        assert_eq!(air.open_servers(), 0);
        assert_eq!(air.active_advertisements(), 0);
    }
}

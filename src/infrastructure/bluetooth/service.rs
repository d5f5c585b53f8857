//! Bluetooth Service Module
//!
//! Central-role coordinator: turns the application's triggers (scan,
//! connect, read, write, stop) into session calls using the configured
//! identifiers and payloads, and reports failures as notifications.

use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::domain::models::{
    AppEvent, DiscoveredDevice, MessageSeverity, ReadRecord, SessionState, StatusMessage,
};
use crate::domain::settings::SettingsService;
use crate::error::GattError;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::session::{CentralSession, SessionConfig};
use crate::infrastructure::radio::CentralRadio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Main Bluetooth service coordinating the central role
pub struct BluetoothService {
    radio: Arc<dyn CentralRadio>,
    scanner: Arc<BleScanner>,
    session: CentralSession,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
    devices: Vec<DiscoveredDevice>,
}

impl BluetoothService {
    /// Create a new Bluetooth service; must be called from within a tokio runtime
    pub fn new(
        radio: Arc<dyn CentralRadio>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        let scanner = Arc::new(BleScanner::new(radio.clone()));
        let config = session_config(&lock(&settings));
        let session =
            CentralSession::spawn(radio.clone(), scanner.clone(), config, event_sender.clone());

        Self {
            radio,
            scanner,
            session,
            event_sender,
            settings,
            devices: Vec::new(),
        }
    }

    /// Scan for the configured service and collect what was seen
    ///
    /// Runs for the configured scan window. Repeated advertisements from the
    /// same address are collapsed when `dedupe_scan_results` is set.
    pub async fn scan_devices(&mut self) -> Result<Vec<DiscoveredDevice>, GattError> {
        let (service, _) = self.identifiers()?;
        let (timeout, dedupe) = {
            let settings = lock(&self.settings);
            let s = settings.get();
            (s.scan_timeout(), s.dedupe_scan_results)
        };

        self.devices.clear();
        let mut scan = self.scanner.start_scan(service, timeout)?;
        while let Some(result) = scan.next().await {
            let device = match result {
                Ok(device) => device,
                Err(e) => return Err(self.notify_failure(e)),
            };
            if dedupe && self.devices.iter().any(|d| d.address == device.address) {
                debug!("Duplicate advertisement from {}", device.address);
                continue;
            }
            let _ = self.event_sender.send(AppEvent::DeviceFound(device.clone()));
            self.devices.push(device);
        }

        info!("Scan finished with {} device(s)", self.devices.len());
        Ok(self.devices.clone())
    }

    /// Stop a running device list scan
    pub fn stop_scan(&self) {
        self.scanner.stop();
    }

    /// Devices collected by the last scan
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Find the first device serving the configured service and connect
    pub async fn find_and_connect(&self) -> Result<DiscoveredDevice, GattError> {
        let (service, characteristic) = self.identifiers()?;
        self.configure_session()?;
        self.session
            .find_device_and_connect(service, characteristic)
            .await
            .map_err(|e| self.notify_failure(e))
    }

    /// Connect to a device picked from the list
    pub async fn connect_to(&self, device: &DiscoveredDevice) -> Result<(), GattError> {
        let (service, characteristic) = self.identifiers()?;
        self.configure_session()?;
        self.session
            .connect(device.clone(), service, characteristic)
            .await
            .map(|_| ())
            .map_err(|e| self.notify_failure(e))
    }

    /// Read the characteristic and decode it as text
    pub async fn read(&self) -> Result<String, GattError> {
        self.configure_session()?;
        let value = self
            .session
            .read_characteristic()
            .await
            .map_err(|e| self.notify_failure(e))?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    /// Write the configured payload text
    pub async fn write(&self) -> Result<(), GattError> {
        let payload = lock(&self.settings).get().write_text.clone();
        self.write_text(&payload).await
    }

    pub async fn write_text(&self, text: &str) -> Result<(), GattError> {
        self.configure_session()?;
        self.session
            .write_characteristic(text.as_bytes())
            .await
            .map_err(|e| self.notify_failure(e))?;
        self.send_log("Write completed", MessageSeverity::Success);
        Ok(())
    }

    /// Connect, read once and disconnect without touching the main session
    pub async fn read_once(&self, device: &DiscoveredDevice) -> Result<String, GattError> {
        let (service, characteristic) = self.identifiers()?;
        let config = session_config(&lock(&self.settings));
        let session = CentralSession::spawn(
            self.radio.clone(),
            self.scanner.clone(),
            config,
            self.event_sender.clone(),
        );

        let result = async {
            session.connect(device.clone(), service, characteristic).await?;
            session.read_characteristic().await
        }
        .await;
        session.close().await;

        let value = result.map_err(|e| self.notify_failure(e))?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    /// Stop the session's scan or drop its link
    pub async fn disconnect(&self) {
        self.session.close().await;
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &CentralSession {
        &self.session
    }

    pub fn read_history(&self) -> Vec<ReadRecord> {
        self.session.read_history()
    }

    fn identifiers(&self) -> Result<(ServiceId, CharacteristicId), GattError> {
        lock(&self.settings)
            .get()
            .identifiers()
            .map_err(|e| self.notify_failure(e))
    }

    /// Push the current timeouts to the session
    fn configure_session(&self) -> Result<(), GattError> {
        let config = session_config(&lock(&self.settings));
        self.session
            .set_config(config)
            .map_err(|e| self.notify_failure(e))
    }

    /// Report a failure; calls cancelled by `disconnect` are not failures
    fn notify_failure(&self, error: GattError) -> GattError {
        if error == GattError::SessionClosed {
            debug!("{}", error);
        } else {
            self.send_log(&error.to_string(), MessageSeverity::Error);
        }
        error
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

fn lock(settings: &Mutex<SettingsService>) -> MutexGuard<'_, SettingsService> {
    settings.lock().unwrap_or_else(|e| e.into_inner())
}

fn session_config(settings: &SettingsService) -> SessionConfig {
    let s = settings.get();
    SessionConfig {
        scan_timeout: s.scan_timeout(),
        operation_timeout: s.operation_timeout(),
    }
}

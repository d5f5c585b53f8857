//! Central Session Module
//!
//! Drives one connection through scan → connect → service discovery →
//! characteristic read/write → disconnect.
//!
//! The session is an actor: a tokio task owns the connection and receives
//! both caller commands and radio events, so every state change happens on
//! one task. Callers hold a cheap [`CentralSession`] handle and await
//! single-shot replies.
//!
//! ```text
//!   Idle ─► Scanning ─► Connecting ─► ServicesDiscovering ─► ServicesReady
//!              │            │                 │                    │
//!              ▼            ▼                 ▼                    ▼
//!            Failed    Disconnected     Failed/Disconnected   Disconnected
//! ```

use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::domain::models::{
    AppEvent, DiscoveredDevice, MessageSeverity, ReadRecord, SessionState, StatusMessage,
};
use crate::error::{GattError, Result};
use crate::infrastructure::bluetooth::protocol::{
    GattStatus, DEFAULT_OPERATION_TIMEOUT, DEFAULT_SCAN_TIMEOUT,
};
use crate::infrastructure::bluetooth::scanner::{BleScanner, ScanEnd, ScanStream};
use crate::infrastructure::radio::{
    CentralRadio, GattClientEvent, LinkEvent, LinkId, RemoteCharacteristic, RemoteService,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to scan before giving up
    pub scan_timeout: Duration,
    /// Bound on connect, discovery and each characteristic operation
    pub operation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

type ConnectReply = oneshot::Sender<Result<DiscoveredDevice>>;

enum Command {
    FindAndConnect {
        service: ServiceId,
        characteristic: CharacteristicId,
        reply: ConnectReply,
    },
    Connect {
        device: DiscoveredDevice,
        service: ServiceId,
        characteristic: CharacteristicId,
        reply: ConnectReply,
    },
    Operation(Operation),
    Configure(SessionConfig),
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Operation {
    Read {
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Write {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Operation {
    fn fail(self, error: GattError) {
        match self {
            Self::Read { reply } => {
                let _ = reply.send(Err(error));
            }
            Self::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Handle to a central session actor
#[derive(Clone)]
pub struct CentralSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    history: Arc<Mutex<Vec<ReadRecord>>>,
}

impl CentralSession {
    /// Spawn the session task; must be called from within a tokio runtime
    pub fn spawn(
        radio: Arc<dyn CentralRadio>,
        scanner: Arc<BleScanner>,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let history = Arc::new(Mutex::new(Vec::new()));

        let actor = SessionActor {
            radio,
            scanner,
            config,
            event_sender,
            state: state_tx,
            history: history.clone(),
            target: None,
            scan: None,
            session: None,
            pending_connect: None,
            in_flight: None,
            queue: VecDeque::new(),
            deadline: None,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            state,
            history,
        }
    }

    /// Scan for the first device advertising `service`, connect to it and
    /// locate `characteristic`. Resolves once the session is ready.
    pub async fn find_device_and_connect(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<DiscoveredDevice> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindAndConnect {
            service,
            characteristic,
            reply,
        })?;
        rx.await.unwrap_or(Err(GattError::SessionClosed))
    }

    /// Connect to an already discovered device without scanning
    pub async fn connect(
        &self,
        device: DiscoveredDevice,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<DiscoveredDevice> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            device,
            service,
            characteristic,
            reply,
        })?;
        rx.await.unwrap_or(Err(GattError::SessionClosed))
    }

    /// Read the characteristic; the response is also appended to the history
    pub async fn read_characteristic(&self) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Operation(Operation::Read { reply }))?;
        rx.await.unwrap_or(Err(GattError::SessionClosed))
    }

    pub async fn write_characteristic(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Operation(Operation::Write {
            payload: payload.into(),
            reply,
        }))?;
        rx.await.unwrap_or(Err(GattError::SessionClosed))
    }

    /// Replace the timeouts used from the next scan or request on
    pub fn set_config(&self, config: SessionConfig) -> Result<()> {
        self.send(Command::Configure(config))
    }

    /// Stop scanning or disconnect; idempotent
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Snapshot of every read response received so far, oldest first
    pub fn read_history(&self) -> Vec<ReadRecord> {
        lock(&self.history).clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| GattError::SessionClosed)
    }
}

fn lock(history: &Mutex<Vec<ReadRecord>>) -> MutexGuard<'_, Vec<ReadRecord>> {
    history.lock().unwrap_or_else(|e| e.into_inner())
}

/// Live connection owned by the actor
struct GattSession {
    link: LinkId,
    device: DiscoveredDevice,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    service: Option<RemoteService>,
    characteristic: Option<RemoteCharacteristic>,
}

#[derive(Clone, Copy)]
struct Target {
    service: ServiceId,
    characteristic: CharacteristicId,
}

enum InFlight {
    Read(oneshot::Sender<Result<Vec<u8>>>),
    Write(oneshot::Sender<Result<()>>),
}

impl InFlight {
    fn fail(self, error: GattError) {
        match self {
            Self::Read(reply) => {
                let _ = reply.send(Err(error));
            }
            Self::Write(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

struct SessionActor {
    radio: Arc<dyn CentralRadio>,
    scanner: Arc<BleScanner>,
    config: SessionConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    state: watch::Sender<SessionState>,
    history: Arc<Mutex<Vec<ReadRecord>>>,
    target: Option<Target>,
    scan: Option<ScanStream>,
    session: Option<GattSession>,
    pending_connect: Option<ConnectReply>,
    in_flight: Option<InFlight>,
    queue: VecDeque<Operation>,
    deadline: Option<Instant>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                scanned = next_scan_result(&mut self.scan) => self.handle_scan_result(scanned),
                event = next_link_event(&mut self.session) => self.handle_link_event(event),
                _ = expired(deadline) => self.handle_deadline(),
            }
        }

        debug!("Session handle dropped, shutting down");
        self.teardown(GattError::SessionClosed);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::FindAndConnect {
                service,
                characteristic,
                reply,
            } => {
                self.teardown(GattError::SessionClosed);
                self.target = Some(Target {
                    service,
                    characteristic,
                });

                match self.scanner.start_scan(service, self.config.scan_timeout) {
                    Ok(stream) => {
                        self.scan = Some(stream);
                        self.pending_connect = Some(reply);
                        self.set_state(SessionState::Scanning);
                        self.send_log("Scanning for GATT server...", MessageSeverity::Info);
                    }
                    Err(e) => {
                        self.pending_connect = Some(reply);
                        self.fail_connect(e, SessionState::Failed);
                    }
                }
            }
            Command::Connect {
                device,
                service,
                characteristic,
                reply,
            } => {
                self.teardown(GattError::SessionClosed);
                self.target = Some(Target {
                    service,
                    characteristic,
                });
                self.pending_connect = Some(reply);
                self.begin_connect(device);
            }
            Command::Operation(operation) => {
                if self.state() != SessionState::ServicesReady {
                    operation.fail(GattError::NotConnected);
                } else if self.in_flight.is_some() {
                    debug!("Operation queued behind in-flight request");
                    self.queue.push_back(operation);
                } else {
                    self.issue(operation);
                }
            }
            Command::Configure(config) => {
                debug!("Session config updated: {:?}", config);
                self.config = config;
            }
            Command::Close { reply } => {
                self.teardown(GattError::SessionClosed);
                let _ = reply.send(());
            }
        }
    }

    fn handle_scan_result(&mut self, scanned: Option<Result<DiscoveredDevice>>) {
        match scanned {
            Some(Ok(device)) => {
                // First match wins
                if let Some(mut scan) = self.scan.take() {
                    scan.stop();
                }
                info!("Found device {} ({})", device.address, device.display_name());
                let _ = self.event_sender.send(AppEvent::DeviceFound(device.clone()));
                self.send_log("Device found", MessageSeverity::Info);
                self.begin_connect(device);
            }
            Some(Err(e)) => {
                self.scan = None;
                self.fail_connect(e, SessionState::Failed);
            }
            None => {
                let ended = self.scan.take().and_then(|scan| scan.end_reason());
                if ended != Some(ScanEnd::WindowElapsed) {
                    self.scan_cancelled();
                    return;
                }
                let error = match self.target {
                    Some(target) => GattError::NoDeviceFound(target.service),
                    None => GattError::ConnectFailed,
                };
                self.fail_connect(error, SessionState::Failed);
            }
        }
    }

    /// Scan stopped from outside before anything matched
    fn scan_cancelled(&mut self) {
        info!("Scan stopped before a device was found");
        self.set_state(SessionState::Disconnected);
        self.send_log("Scan stopped", MessageSeverity::Info);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(GattError::SessionClosed));
        }
    }

    fn begin_connect(&mut self, device: DiscoveredDevice) {
        info!("Connecting to {}", device.address);
        self.set_state(SessionState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        match self.radio.connect(&device.address, tx) {
            Ok(link) => {
                self.session = Some(GattSession {
                    link,
                    device,
                    events: rx,
                    service: None,
                    characteristic: None,
                });
                self.deadline = Some(Instant::now() + self.config.operation_timeout);
            }
            Err(e) => {
                error!("Connect request rejected: {}", e);
                self.fail_connect(GattError::ConnectFailed, SessionState::Failed);
            }
        }
    }

    fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(LinkEvent { link, event }) = event else {
            self.link_lost();
            return;
        };
        if self.session.as_ref().map(|s| s.link) != Some(link) {
            self.discard_stale(GattError::StaleResponseDiscarded);
            return;
        }

        match event {
            GattClientEvent::ConnectionStateChanged { connected: true } => {
                if self.state() == SessionState::Connecting {
                    self.set_state(SessionState::ServicesDiscovering);
                    if let Err(e) = self.radio.discover_services(link) {
                        error!("Service discovery request rejected: {}", e);
                        self.abandon_link(GattError::ConnectFailed, SessionState::Failed);
                    }
                }
            }
            GattClientEvent::ConnectionStateChanged { connected: false } => self.link_lost(),
            GattClientEvent::ServicesDiscovered { status, services } => {
                if self.state() == SessionState::ServicesDiscovering {
                    self.services_discovered(status, services);
                } else {
                    self.discard_stale(GattError::StaleResponseDiscarded);
                }
            }
            GattClientEvent::CharacteristicRead { status, value, .. } => {
                match self.in_flight.take() {
                    Some(InFlight::Read(reply)) => {
                        self.deadline = None;
                        self.record_read(status, value.clone());
                        let result = if status.is_success() {
                            Ok(value)
                        } else {
                            Err(GattError::OperationFailed(status))
                        };
                        let _ = reply.send(result);
                        self.issue_next();
                    }
                    other => {
                        self.in_flight = other;
                        self.discard_stale(GattError::StaleResponseDiscarded);
                    }
                }
            }
            GattClientEvent::CharacteristicWritten { status, .. } => match self.in_flight.take() {
                Some(InFlight::Write(reply)) => {
                    self.deadline = None;
                    let _ = self.event_sender.send(AppEvent::WriteCompleted(status));
                    let result = if status.is_success() {
                        Ok(())
                    } else {
                        Err(GattError::OperationFailed(status))
                    };
                    let _ = reply.send(result);
                    self.issue_next();
                }
                other => {
                    self.in_flight = other;
                    self.discard_stale(GattError::StaleResponseDiscarded);
                }
            },
        }
    }

    fn services_discovered(&mut self, status: GattStatus, services: Vec<RemoteService>) {
        let Some(target) = self.target else {
            self.abandon_link(GattError::ConnectFailed, SessionState::Failed);
            return;
        };
        if !status.is_success() {
            warn!("Service discovery failed: {}", status);
            self.abandon_link(GattError::OperationFailed(status), SessionState::Failed);
            return;
        }

        // Duplicates resolve to the first in discovery order
        let Some(service) = services.into_iter().find(|s| s.id == target.service) else {
            self.abandon_link(GattError::ServiceNotFound(target.service), SessionState::Failed);
            return;
        };
        let Some(characteristic) = service
            .characteristics
            .iter()
            .find(|c| c.id == target.characteristic)
            .cloned()
        else {
            self.abandon_link(
                GattError::CharacteristicNotFound(target.characteristic),
                SessionState::Failed,
            );
            return;
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        info!(
            "Found service {} with characteristic {} on {}",
            service.id, characteristic.id, session.device.address
        );
        session.service = Some(service);
        session.characteristic = Some(characteristic);
        let device = session.device.clone();

        self.deadline = None;
        self.set_state(SessionState::ServicesReady);
        self.send_log("Connection established!", MessageSeverity::Success);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(device));
        }
    }

    fn issue(&mut self, operation: Operation) {
        let Some(session) = self.session.as_ref() else {
            operation.fail(GattError::NotConnected);
            return;
        };
        let (Some(service), Some(characteristic)) = (&session.service, &session.characteristic)
        else {
            operation.fail(GattError::NotConnected);
            return;
        };
        let (link, service, characteristic) = (session.link, service.id, characteristic.id);

        let issued = match operation {
            Operation::Read { reply } => {
                debug!("Reading {}", characteristic);
                match self.radio.read_characteristic(link, service, characteristic) {
                    Ok(()) => Ok(InFlight::Read(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e.clone()));
                        Err(e)
                    }
                }
            }
            Operation::Write { payload, reply } => {
                debug!("Writing {} bytes to {}", payload.len(), characteristic);
                match self
                    .radio
                    .write_characteristic(link, service, characteristic, &payload)
                {
                    Ok(()) => Ok(InFlight::Write(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e.clone()));
                        Err(e)
                    }
                }
            }
        };

        match issued {
            Ok(in_flight) => {
                self.in_flight = Some(in_flight);
                self.deadline = Some(Instant::now() + self.config.operation_timeout);
            }
            Err(e) => {
                warn!("Characteristic request rejected: {}", e);
                self.issue_next();
            }
        }
    }

    fn issue_next(&mut self) {
        if self.in_flight.is_none() {
            if let Some(next) = self.queue.pop_front() {
                self.issue(next);
            }
        }
    }

    fn record_read(&mut self, status: GattStatus, value: Vec<u8>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let record = ReadRecord {
            address: session.device.address.clone(),
            status,
            value,
        };
        lock(&self.history).push(record.clone());
        let _ = self.event_sender.send(AppEvent::ReadCompleted(record));
    }

    fn handle_deadline(&mut self) {
        self.deadline = None;
        match self.state() {
            SessionState::Connecting | SessionState::ServicesDiscovering => {
                warn!("Connection attempt timed out");
                self.abandon_link(GattError::OperationTimedOut, SessionState::Failed);
            }
            SessionState::ServicesReady => {
                if let Some(in_flight) = self.in_flight.take() {
                    // No further requests may be sent on a bearer after a transaction timeout
                    warn!("Characteristic operation timed out, dropping link");
                    in_flight.fail(GattError::OperationTimedOut);
                    self.link_lost();
                }
            }
            _ => {}
        }
    }

    /// Platform reported the link gone
    fn link_lost(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!("Link to {} lost", session.device.address);
        self.radio.disconnect(session.link);
        self.deadline = None;
        self.fail_outstanding(GattError::NotConnected);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(GattError::ConnectFailed));
        }
        self.set_state(SessionState::Disconnected);
        self.send_log("Disconnected from device", MessageSeverity::Warning);
    }

    /// Give up on the current link and settle in `state`
    fn abandon_link(&mut self, error: GattError, state: SessionState) {
        if let Some(session) = self.session.take() {
            self.radio.disconnect(session.link);
        }
        self.deadline = None;
        self.fail_outstanding(GattError::NotConnected);
        self.fail_connect(error, state);
    }

    fn fail_connect(&mut self, error: GattError, state: SessionState) {
        error!("Connection failed: {}", error);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(error.clone()));
        }
        self.set_state(state);
        self.send_log(&format!("Connection failed: {}", error), MessageSeverity::Error);
    }

    fn fail_outstanding(&mut self, error: GattError) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.fail(error.clone());
        }
        for operation in self.queue.drain(..) {
            operation.fail(error.clone());
        }
    }

    /// Stop scanning and release the link; late responses are discarded
    fn teardown(&mut self, error: GattError) {
        let was_active = self.scan.is_some() || self.session.is_some();

        if let Some(mut scan) = self.scan.take() {
            scan.stop();
        }
        if let Some(session) = self.session.take() {
            info!("Disconnecting from {}", session.device.address);
            self.radio.disconnect(session.link);
        }
        self.deadline = None;
        self.fail_outstanding(error.clone());
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(error));
        }

        if was_active {
            self.set_state(SessionState::Disconnected);
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
    }

    fn discard_stale(&self, reason: GattError) {
        debug!("{}", reason);
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        if self.state.send_replace(state) != state {
            debug!("Session state -> {}", state);
            let _ = self.event_sender.send(AppEvent::SessionState(state));
        }
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

async fn next_scan_result(scan: &mut Option<ScanStream>) -> Option<Result<DiscoveredDevice>> {
    match scan {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(session: &mut Option<GattSession>) -> Option<LinkEvent> {
    match session {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RemoteDevice;
    use crate::infrastructure::bluetooth::protocol::{
        scan_error, AttributePermissions, CharacteristicProperties, DEFAULT_CHARACTERISTIC_ID,
        DEFAULT_SERVICE_ID,
    };
    use crate::infrastructure::bluetooth::server::PeripheralServer;
    use crate::infrastructure::radio::sim::{SimAir, SimPeripheral};
    use crate::infrastructure::radio::{
        AdvertiseData, AdvertiseSettings, GattServerEvent, LocalCharacteristic, LocalService,
        PeripheralRadio, ServerHandle,
    };
    use uuid::Uuid;

    const PERIPHERAL: &str = "AA:BB:CC:00:00:01";
    const CENTRAL: &str = "11:22:33:00:00:01";

    fn config() -> SessionConfig {
        SessionConfig {
            scan_timeout: Duration::from_millis(50),
            operation_timeout: Duration::from_millis(500),
        }
    }

    fn central_session(air: &Arc<SimAir>) -> (CentralSession, mpsc::UnboundedReceiver<AppEvent>) {
        let radio: Arc<dyn CentralRadio> = Arc::new(air.central(CENTRAL));
        let scanner = Arc::new(BleScanner::new(radio.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        (CentralSession::spawn(radio, scanner, config(), tx), rx)
    }

    /// Session whose scan window outlasts the test
    fn scanning_session(
        air: &Arc<SimAir>,
    ) -> (
        CentralSession,
        Arc<BleScanner>,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let radio: Arc<dyn CentralRadio> = Arc::new(air.central(CENTRAL));
        let scanner = Arc::new(BleScanner::new(radio.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            scan_timeout: Duration::from_secs(5),
            ..config()
        };
        let session = CentralSession::spawn(radio, scanner.clone(), config, tx);
        (session, scanner, rx)
    }

    /// Start `find_device_and_connect` and wait until the session is scanning
    async fn start_finding(
        session: &CentralSession,
    ) -> tokio::task::JoinHandle<Result<DiscoveredDevice>> {
        let finder = session.clone();
        let pending = tokio::spawn(async move {
            finder
                .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
                .await
        });
        session
            .subscribe()
            .wait_for(|s| *s == SessionState::Scanning)
            .await
            .unwrap();
        pending
    }

    fn no_error_logged(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> bool {
        !std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
            matches!(e, AppEvent::LogMessage(m) if m.severity == MessageSeverity::Error)
        })
    }

    async fn running_server(air: &Arc<SimAir>, read_text: &str) -> PeripheralServer {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut server = PeripheralServer::new(Arc::new(air.peripheral(PERIPHERAL, "sample")), tx);
        server
            .start(
                DEFAULT_SERVICE_ID,
                DEFAULT_CHARACTERISTIC_ID,
                read_text.as_bytes().to_vec(),
            )
            .await
            .unwrap();
        server
    }

    /// GATT server whose requests are answered by the test itself
    async fn manual_server(
        air: &Arc<SimAir>,
    ) -> (
        SimPeripheral,
        ServerHandle,
        mpsc::UnboundedReceiver<GattServerEvent>,
    ) {
        let peripheral = air.peripheral(PERIPHERAL, "manual");
        let (tx, rx) = mpsc::unbounded_channel();
        let server = peripheral.open_gatt_server(tx).unwrap();
        peripheral
            .add_service(
                server,
                &LocalService {
                    id: DEFAULT_SERVICE_ID,
                    characteristics: vec![LocalCharacteristic {
                        id: DEFAULT_CHARACTERISTIC_ID,
                        properties: CharacteristicProperties::read_write(),
                        permissions: AttributePermissions::read_write(),
                    }],
                },
            )
            .unwrap();
        let (adv_tx, _adv_rx) = mpsc::unbounded_channel();
        peripheral
            .start_advertising(
                &AdvertiseSettings::default(),
                &AdvertiseData::for_service(DEFAULT_SERVICE_ID),
                adv_tx,
            )
            .unwrap();
        (peripheral, server, rx)
    }

    async fn next_read_request(rx: &mut mpsc::UnboundedReceiver<GattServerEvent>) -> u32 {
        loop {
            match rx.recv().await {
                Some(GattServerEvent::CharacteristicReadRequest { request_id, .. }) => {
                    return request_id
                }
                Some(_) => continue,
                None => panic!("server channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_no_device_before_timeout_fails_without_connecting() {
        let air = SimAir::new();
        let (session, _events) = central_session(&air);

        let result = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await;

        assert_eq!(result, Err(GattError::NoDeviceFound(DEFAULT_SERVICE_ID)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(air.connect_attempts(), 0);
        assert_eq!(air.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_close_while_scanning_is_not_a_failure() {
        let air = SimAir::new();
        let (session, _scanner, mut events) = scanning_session(&air);
        let pending = start_finding(&session).await;

        session.close().await;

        assert_eq!(pending.await.unwrap(), Err(GattError::SessionClosed));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(air.active_scans(), 0);
        assert!(no_error_logged(&mut events));
    }

    #[tokio::test]
    async fn test_scanner_stop_while_scanning_is_not_a_failure() {
        let air = SimAir::new();
        let (session, scanner, mut events) = scanning_session(&air);
        let pending = start_finding(&session).await;

        scanner.stop();

        assert_eq!(pending.await.unwrap(), Err(GattError::SessionClosed));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(air.connect_attempts(), 0);
        assert!(no_error_logged(&mut events));
    }

    #[tokio::test]
    async fn test_config_update_applies_to_next_scan() {
        let air = SimAir::new();
        let (session, _scanner, _events) = scanning_session(&air);
        session.set_config(config()).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            session.find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID),
        )
        .await
        .expect("scan window from updated config");
        assert_eq!(result, Err(GattError::NoDeviceFound(DEFAULT_SERVICE_ID)));
    }

    #[tokio::test]
    async fn test_scan_failure_fails_session() {
        let air = SimAir::new();
        air.fail_next_scan(scan_error::FEATURE_UNSUPPORTED);
        let (session, _events) = central_session(&air);

        let result = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await;

        assert_eq!(
            result,
            Err(GattError::ScanFailed(scan_error::FEATURE_UNSUPPORTED))
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(air.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_read_appends_history() {
        let air = SimAir::new();
        let _server = running_server(&air, "Hello BLE").await;
        let (session, _events) = central_session(&air);

        let device = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();
        assert_eq!(device.address, PERIPHERAL);
        assert_eq!(session.state(), SessionState::ServicesReady);
        assert_eq!(air.active_scans(), 0);
        assert!(session.read_history().is_empty());

        let value = session.read_characteristic().await.unwrap();
        assert_eq!(value, b"Hello BLE");
        let history = session.read_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "Hello BLE");
        assert_eq!(history[0].status, GattStatus::Success);

        session.read_characteristic().await.unwrap();
        assert_eq!(session.read_history().len(), 2);
    }

    #[tokio::test]
    async fn test_first_match_short_circuits_scan() {
        let air = SimAir::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut servers = Vec::new();
        for address in ["AA:BB:CC:00:00:01", "AA:BB:CC:00:00:02"] {
            let mut server =
                PeripheralServer::new(Arc::new(air.peripheral(address, "sample")), tx.clone());
            server
                .start(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID, b"x".to_vec())
                .await
                .unwrap();
            servers.push(server);
        }
        let (session, _events) = central_session(&air);

        let device = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();
        assert!(device.address.starts_with("AA:BB:CC"));
        assert_eq!(air.connect_attempts(), 1);
        assert_eq!(air.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_operations_require_ready_session() {
        let air = SimAir::new();
        let (session, _events) = central_session(&air);
        let calls = air.central_calls();

        assert_eq!(
            session.read_characteristic().await,
            Err(GattError::NotConnected)
        );
        assert_eq!(
            session.write_characteristic("payload").await,
            Err(GattError::NotConnected)
        );
        assert_eq!(air.central_calls(), calls);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_close_discards_outstanding_read() {
        let air = SimAir::new();
        let (peripheral, server, mut requests) = manual_server(&air).await;
        let (session, _events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read_characteristic().await });
        let request_id = next_read_request(&mut requests).await;

        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(pending.await.unwrap(), Err(GattError::SessionClosed));

        // The late answer reaches a link that no longer exists
        peripheral
            .send_response(server, CENTRAL, request_id, GattStatus::Success, 0, b"late")
            .unwrap();
        tokio::task::yield_now().await;
        assert!(session.read_history().is_empty());
        assert_eq!(air.open_links(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let air = SimAir::new();
        let _server = running_server(&air, "Hello BLE").await;
        let (session, _events) = central_session(&air);

        session.close().await;
        assert_eq!(session.state(), SessionState::Idle);

        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(air.open_links(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_fails() {
        let air = SimAir::new();
        let _server = running_server(&air, "Hello BLE").await;
        let (session, _events) = central_session(&air);
        let wanted = ServiceId::from_uuid(Uuid::from_u128(0xabcdef));

        // Connect directly: the device does not advertise `wanted`
        let device = DiscoveredDevice::new(PERIPHERAL, None, [DEFAULT_SERVICE_ID]);
        let result = session
            .connect(device, wanted, DEFAULT_CHARACTERISTIC_ID)
            .await;

        assert_eq!(result, Err(GattError::ServiceNotFound(wanted)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(air.open_links(), 0);
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails() {
        let air = SimAir::new();
        let _server = running_server(&air, "Hello BLE").await;
        let (session, _events) = central_session(&air);
        let wanted = CharacteristicId::from_uuid(Uuid::from_u128(0x123456));

        let result = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, wanted)
            .await;

        assert_eq!(result, Err(GattError::CharacteristicNotFound(wanted)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_first_duplicate_service_wins() {
        let air = SimAir::new();
        let peripheral = air.peripheral(PERIPHERAL, "duplicate");
        let other = CharacteristicId::from_uuid(Uuid::from_u128(0x2a00));

        // Both servers expose the same service; only the second has the target characteristic
        let mut servers = Vec::new();
        for characteristic in [other, DEFAULT_CHARACTERISTIC_ID] {
            let (tx, rx) = mpsc::unbounded_channel();
            let server = peripheral.open_gatt_server(tx).unwrap();
            peripheral
                .add_service(
                    server,
                    &LocalService {
                        id: DEFAULT_SERVICE_ID,
                        characteristics: vec![LocalCharacteristic {
                            id: characteristic,
                            properties: CharacteristicProperties::read_write(),
                            permissions: AttributePermissions::read_write(),
                        }],
                    },
                )
                .unwrap();
            servers.push(rx);
        }
        let (adv_tx, _adv_rx) = mpsc::unbounded_channel();
        peripheral
            .start_advertising(
                &AdvertiseSettings::default(),
                &AdvertiseData::for_service(DEFAULT_SERVICE_ID),
                adv_tx,
            )
            .unwrap();
        let (session, _events) = central_session(&air);

        let result = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await;

        assert_eq!(
            result,
            Err(GattError::CharacteristicNotFound(DEFAULT_CHARACTERISTIC_ID))
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(air.open_links(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_ends_disconnected() {
        let air = SimAir::new();
        let _server = running_server(&air, "Hello BLE").await;
        air.refuse_connections(true);
        let (session, _events) = central_session(&air);

        let result = session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await;

        assert_eq!(result, Err(GattError::ConnectFailed));
        assert_eq!(session.state(), SessionState::Disconnected);

        // Retry from Disconnected succeeds once the peer accepts
        air.refuse_connections(false);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::ServicesReady);
    }

    #[tokio::test]
    async fn test_remote_disconnect() {
        let air = SimAir::new();
        let _server = running_server(&air, "Hello BLE").await;
        let (session, _events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let mut state = session.subscribe();
        air.drop_links(PERIPHERAL);
        state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();

        assert_eq!(
            session.read_characteristic().await,
            Err(GattError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_operations_are_serialized() {
        let air = SimAir::new();
        let (peripheral, server, mut requests) = manual_server(&air).await;
        let (session, _events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let first = {
            let s = session.clone();
            tokio::spawn(async move { s.read_characteristic().await })
        };
        let first_id = next_read_request(&mut requests).await;
        let second = {
            let s = session.clone();
            tokio::spawn(async move { s.read_characteristic().await })
        };

        // The second read must wait for the first response
        tokio::task::yield_now().await;
        assert!(requests.try_recv().is_err());

        peripheral
            .send_response(server, CENTRAL, first_id, GattStatus::Success, 0, b"one")
            .unwrap();
        let second_id = next_read_request(&mut requests).await;
        peripheral
            .send_response(server, CENTRAL, second_id, GattStatus::Success, 0, b"two")
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), b"one");
        assert_eq!(second.await.unwrap().unwrap(), b"two");
        let texts: Vec<String> = session.read_history().iter().map(|r| r.text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_failed_read_status_is_recorded() {
        let air = SimAir::new();
        let (peripheral, server, mut requests) = manual_server(&air).await;
        let (session, _events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read_characteristic().await });
        let request_id = next_read_request(&mut requests).await;
        peripheral
            .send_response(
                server,
                CENTRAL,
                request_id,
                GattStatus::ReadNotPermitted,
                0,
                &[],
            )
            .unwrap();

        assert_eq!(
            pending.await.unwrap(),
            Err(GattError::OperationFailed(GattStatus::ReadNotPermitted))
        );
        let history = session.read_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, GattStatus::ReadNotPermitted);
    }

    #[tokio::test]
    async fn test_unanswered_read_times_out_and_drops_link() {
        let air = SimAir::new();
        let (_peripheral, _server, mut requests) = manual_server(&air).await;
        let (session, _events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read_characteristic().await });
        next_read_request(&mut requests).await;

        assert_eq!(pending.await.unwrap(), Err(GattError::OperationTimedOut));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(air.open_links(), 0);
    }

    #[tokio::test]
    async fn test_write_reaches_server() {
        let air = SimAir::new();
        let (peripheral, server, mut requests) = manual_server(&air).await;
        let (session, mut events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let writer = session.clone();
        let pending = tokio::spawn(async move { writer.write_characteristic("Pixel").await });
        let (request_id, value) = loop {
            match requests.recv().await {
                Some(GattServerEvent::CharacteristicWriteRequest {
                    request_id,
                    value,
                    device,
                    ..
                }) => {
                    assert_eq!(device, RemoteDevice::new(CENTRAL, None));
                    break (request_id, value);
                }
                Some(_) => continue,
                None => panic!("server channel closed"),
            }
        };
        assert_eq!(value, b"Pixel");
        peripheral
            .send_response(server, CENTRAL, request_id, GattStatus::Success, 0, &value)
            .unwrap();

        assert_eq!(pending.await.unwrap(), Ok(()));
        assert!(session.read_history().is_empty());

        let mut saw_write_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AppEvent::WriteCompleted(GattStatus::Success)) {
                saw_write_completed = true;
            }
        }
        assert!(saw_write_completed);
    }

    #[tokio::test]
    async fn test_long_value_read() {
        let air = SimAir::new();
        let long_text = "A characteristic value longer than one ATT response";
        let _server = running_server(&air, long_text).await;
        let (session, _events) = central_session(&air);
        session
            .find_device_and_connect(DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID)
            .await
            .unwrap();

        let value = session.read_characteristic().await.unwrap();
        assert_eq!(value, long_text.as_bytes());
        assert_eq!(session.read_history().len(), 1);
    }
}

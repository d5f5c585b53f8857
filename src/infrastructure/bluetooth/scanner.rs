//! BLE Scanner Module
//!
//! Discovers peripherals advertising a given service. The radio allows one
//! useful scan at a time, so starting a new scan stops the previous one.

use crate::domain::identifier::ServiceId;
use crate::domain::models::DiscoveredDevice;
use crate::error::GattError;
use crate::infrastructure::radio::{CentralRadio, ScanEvent, ScanHandle};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Why a scan stopped producing results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// The scan window ran out
    WindowElapsed,
    /// Stopped by a caller or replaced by a newer scan
    Stopped,
    /// The radio reported a scan failure
    Failed,
}

/// Ownership of one running radio scan
struct ScanLease {
    radio: Arc<dyn CentralRadio>,
    handle: ScanHandle,
    ended: watch::Sender<Option<ScanEnd>>,
}

impl ScanLease {
    /// Release the radio; only the first call reaches it and records `reason`
    fn end(&self, reason: ScanEnd) {
        let first = self.ended.send_if_modified(|ended| {
            if ended.is_some() {
                return false;
            }
            *ended = Some(reason);
            true
        });
        if first {
            info!("Stopping BLE scan {:?} ({:?})", self.handle, reason);
            self.radio.stop_scan(self.handle);
        }
    }

    fn end_reason(&self) -> Option<ScanEnd> {
        *self.ended.borrow()
    }

    fn is_stopped(&self) -> bool {
        self.end_reason().is_some()
    }
}

/// Finite sequence of scan results
///
/// Ends when the scan window elapses, the scan is stopped (explicitly or
/// by a newer scan) or the radio reports a failure. The same device may be
/// reported more than once.
pub struct ScanStream {
    events: mpsc::UnboundedReceiver<ScanEvent>,
    stop_signal: watch::Receiver<Option<ScanEnd>>,
    lease: Arc<ScanLease>,
    finished: bool,
}

impl ScanStream {
    /// Next matching device, or `None` once the scan has ended
    pub async fn next(&mut self) -> Option<Result<DiscoveredDevice, GattError>> {
        if self.finished {
            return None;
        }

        tokio::select! {
            biased;
            _ = stopped(&mut self.stop_signal) => {
                self.finished = true;
                None
            }
            event = self.events.recv() => match event {
                Some(ScanEvent::Result(device)) => Some(Ok(device)),
                Some(ScanEvent::Failed(code)) => {
                    warn!("BLE scan failed with code {}", code);
                    self.finish(ScanEnd::Failed);
                    Some(Err(GattError::ScanFailed(code)))
                }
                None => {
                    self.finish(ScanEnd::Stopped);
                    None
                }
            },
        }
    }

    /// Stop scanning; safe to call repeatedly
    pub fn stop(&mut self) {
        self.finish(ScanEnd::Stopped);
    }

    /// Why the scan ended, or `None` while it is still running
    pub fn end_reason(&self) -> Option<ScanEnd> {
        self.lease.end_reason()
    }

    fn finish(&mut self, reason: ScanEnd) {
        self.finished = true;
        self.lease.end(reason);
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.lease.end(ScanEnd::Stopped);
    }
}

async fn stopped(signal: &mut watch::Receiver<Option<ScanEnd>>) {
    let _ = signal.wait_for(|ended| ended.is_some()).await;
}

/// BLE Scanner sharing one radio between callers
pub struct BleScanner {
    radio: Arc<dyn CentralRadio>,
    active: Mutex<Option<Arc<ScanLease>>>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(radio: Arc<dyn CentralRadio>) -> Self {
        Self {
            radio,
            active: Mutex::new(None),
        }
    }

    /// Start scanning for devices advertising `filter`
    ///
    /// Must be called from within a tokio runtime; a timer task stops the
    /// scan once `timeout` has elapsed even if the stream is never polled.
    pub fn start_scan(
        &self,
        filter: ServiceId,
        timeout: Duration,
    ) -> Result<ScanStream, GattError> {
        // Stop any existing scan
        self.stop();

        info!("Starting BLE scan for service UUID: {} ({:?})", filter, timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.radio.start_scan(filter, tx)?;

        let (ended, stop_signal) = watch::channel(None);
        let lease = Arc::new(ScanLease {
            radio: self.radio.clone(),
            handle,
            ended,
        });

        let timer: Weak<ScanLease> = Arc::downgrade(&lease);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(lease) = timer.upgrade() {
                if !lease.is_stopped() {
                    debug!("Scan window of {:?} elapsed", timeout);
                }
                lease.end(ScanEnd::WindowElapsed);
            }
        });

        *self.lock_active() = Some(lease.clone());

        Ok(ScanStream {
            events: rx,
            stop_signal,
            lease,
            finished: false,
        })
    }

    /// Stop scanning; a no-op when nothing is running
    pub fn stop(&self) {
        if let Some(lease) = self.lock_active().take() {
            lease.end(ScanEnd::Stopped);
        }
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.lock_active()
            .as_ref()
            .map(|lease| !lease.is_stopped())
            .unwrap_or(false)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Arc<ScanLease>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{scan_error, DEFAULT_SERVICE_ID};
    use crate::infrastructure::radio::sim::SimAir;
    use uuid::Uuid;

    fn other_service() -> ServiceId {
        ServiceId::from_uuid(Uuid::from_u128(0x1234))
    }

    #[tokio::test]
    async fn test_only_matching_devices_are_reported() {
        let air = SimAir::new();
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:01")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_millis(100))
            .unwrap();

        air.inject_advertisement(DiscoveredDevice::new("11:11", None, [other_service()]));
        air.inject_advertisement(DiscoveredDevice::new(
            "22:22",
            Some("match".to_string()),
            [DEFAULT_SERVICE_ID],
        ));

        let device = scan.next().await.unwrap().unwrap();
        assert_eq!(device.address, "22:22");
        assert_eq!(scan.next().await, None);
    }

    #[tokio::test]
    async fn test_repeated_advertisements_are_not_deduplicated() {
        let air = SimAir::new();
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:02")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_millis(100))
            .unwrap();

        let device = DiscoveredDevice::new("33:33", None, [DEFAULT_SERVICE_ID]);
        air.inject_advertisement(device.clone());
        air.inject_advertisement(device.clone());

        assert_eq!(scan.next().await, Some(Ok(device.clone())));
        assert_eq!(scan.next().await, Some(Ok(device)));
    }

    #[tokio::test]
    async fn test_timeout_releases_radio() {
        let air = SimAir::new();
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:03")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_millis(30))
            .unwrap();
        assert_eq!(air.active_scans(), 1);

        assert_eq!(scan.next().await, None);
        assert_eq!(scan.end_reason(), Some(ScanEnd::WindowElapsed));
        assert_eq!(air.active_scans(), 0);
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_double_stop_is_noop() {
        let air = SimAir::new();
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:04")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_secs(5))
            .unwrap();

        scan.stop();
        scan.stop();
        scanner.stop();
        scanner.stop();
        assert_eq!(air.active_scans(), 0);
        assert_eq!(scan.end_reason(), Some(ScanEnd::Stopped));
        assert_eq!(scan.next().await, None);
    }

    #[tokio::test]
    async fn test_new_scan_stops_previous() {
        let air = SimAir::new();
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:05")));
        let mut first = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_secs(5))
            .unwrap();
        let _second = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_secs(5))
            .unwrap();

        assert_eq!(air.active_scans(), 1);
        assert_eq!(first.next().await, None);
        assert_eq!(first.end_reason(), Some(ScanEnd::Stopped));
    }

    #[tokio::test]
    async fn test_stop_before_window_is_not_reported_as_elapsed() {
        let air = SimAir::new();
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:07")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_millis(30))
            .unwrap();

        scanner.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(scan.next().await, None);
        assert_eq!(scan.end_reason(), Some(ScanEnd::Stopped));
    }

    #[tokio::test]
    async fn test_scan_failure_ends_sequence() {
        let air = SimAir::new();
        air.fail_next_scan(scan_error::INTERNAL_ERROR);
        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:06")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            scan.next().await,
            Some(Err(GattError::ScanFailed(scan_error::INTERNAL_ERROR)))
        );
        assert_eq!(scan.next().await, None);
        assert_eq!(scan.end_reason(), Some(ScanEnd::Failed));
        assert!(!scanner.is_scanning());
    }
}

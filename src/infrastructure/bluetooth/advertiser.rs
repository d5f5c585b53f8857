//! BLE Advertiser Module
//!
//! Broadcasts the server's service identifier so centrals can find it.

use crate::domain::identifier::ServiceId;
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol::AdvertiseErrorCode;
use crate::infrastructure::radio::{
    AdvertiseData, AdvertiseEvent, AdvertiseHandle, AdvertiseSettings, PeripheralRadio,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// How long to wait for the stack to confirm an advertisement
const START_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns at most one advertisement at a time
pub struct Advertiser {
    radio: Arc<dyn PeripheralRadio>,
    active: Option<AdvertiseHandle>,
}

impl Advertiser {
    pub fn new(radio: Arc<dyn PeripheralRadio>) -> Self {
        Self {
            radio,
            active: None,
        }
    }

    /// Start advertising `service`, replacing any running advertisement
    ///
    /// Resolves once the stack confirms or rejects the advertisement.
    pub async fn start(
        &mut self,
        service: ServiceId,
        settings: &AdvertiseSettings,
    ) -> Result<(), GattError> {
        self.stop();

        let data = AdvertiseData::for_service(service);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.radio.start_advertising(settings, &data, tx)?;

        match tokio::time::timeout(START_CONFIRM_TIMEOUT, rx.recv()).await {
            Ok(Some(AdvertiseEvent::Started)) => {
                info!("Advertising {} ({:?})", service, settings.mode);
                self.active = Some(handle);
                Ok(())
            }
            Ok(Some(AdvertiseEvent::StartFailed(code))) => {
                error!("Advertising failed: {}", code);
                self.radio.stop_advertising(handle);
                Err(GattError::AdvertiseFailed(code))
            }
            Ok(None) => {
                self.radio.stop_advertising(handle);
                Err(GattError::AdvertiseFailed(AdvertiseErrorCode::InternalError))
            }
            Err(_) => {
                error!("Advertising start was never confirmed");
                self.radio.stop_advertising(handle);
                Err(GattError::OperationTimedOut)
            }
        }
    }

    /// Stop advertising; safe to call when never started
    pub fn stop(&mut self) {
        if let Some(handle) = self.active.take() {
            info!("Stopping advertisement {:?}", handle);
            self.radio.stop_advertising(handle);
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DiscoveredDevice;
    use crate::infrastructure::bluetooth::protocol::DEFAULT_SERVICE_ID;
    use crate::infrastructure::bluetooth::scanner::BleScanner;
    use crate::infrastructure::radio::sim::SimAir;

    #[tokio::test]
    async fn test_advertisement_is_discoverable() {
        let air = SimAir::new();
        let mut advertiser = Advertiser::new(Arc::new(
            air.peripheral("AA:00:00:00:00:01", "A rather long peripheral name"),
        ));
        advertiser
            .start(DEFAULT_SERVICE_ID, &AdvertiseSettings::default())
            .await
            .unwrap();
        assert!(advertiser.is_advertising());

        let scanner = BleScanner::new(Arc::new(air.central("CC:00:00:00:00:01")));
        let mut scan = scanner
            .start_scan(DEFAULT_SERVICE_ID, Duration::from_millis(50))
            .unwrap();
        let device: DiscoveredDevice = scan.next().await.unwrap().unwrap();
        assert_eq!(device.address, "AA:00:00:00:00:01");
        assert!(device.advertises(&DEFAULT_SERVICE_ID));
    }

    #[tokio::test]
    async fn test_restart_keeps_single_advertisement() {
        let air = SimAir::new();
        let mut advertiser = Advertiser::new(Arc::new(air.peripheral("AA:00:00:00:00:02", "p")));
        let settings = AdvertiseSettings::default();
        advertiser.start(DEFAULT_SERVICE_ID, &settings).await.unwrap();
        advertiser.start(DEFAULT_SERVICE_ID, &settings).await.unwrap();
        assert_eq!(air.active_advertisements(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let air = SimAir::new();
        air.fail_advertising(Some(AdvertiseErrorCode::TooManyAdvertisers));
        let mut advertiser = Advertiser::new(Arc::new(air.peripheral("AA:00:00:00:00:03", "p")));

        let result = advertiser
            .start(DEFAULT_SERVICE_ID, &AdvertiseSettings::default())
            .await;
        assert_eq!(
            result,
            Err(GattError::AdvertiseFailed(
                AdvertiseErrorCode::TooManyAdvertisers
            ))
        );
        assert!(!advertiser.is_advertising());
        assert_eq!(air.active_advertisements(), 0);
    }

    #[test]
    fn test_stop_when_never_started() {
        let air = SimAir::new();
        let mut advertiser = Advertiser::new(Arc::new(air.peripheral("AA:00:00:00:00:04", "p")));
        advertiser.stop();
        advertiser.stop();
        assert!(!advertiser.is_advertising());
    }
}

//! GATT Sample Protocol
//!
//! Identifiers, status codes and wire-level limits shared by the central
//! and peripheral roles.

use crate::domain::identifier::{CharacteristicId, ServiceId};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default service UUID hosted by the peripheral (randomly generated)
pub const DEFAULT_SERVICE_UUID: &str = "6b9f2474-71de-4528-a1ad-07322d7a28fa";

/// Default read/write characteristic UUID inside the service
pub const DEFAULT_CHARACTERISTIC_UUID: &str = "fcfeed22-55e4-4e41-aeef-45e10ae4bf3c";

pub const DEFAULT_SERVICE_ID: ServiceId =
    ServiceId::from_uuid(Uuid::from_u128(0x6b9f2474_71de_4528_a1ad_07322d7a28fa));
pub const DEFAULT_CHARACTERISTIC_ID: CharacteristicId =
    CharacteristicId::from_uuid(Uuid::from_u128(0xfcfeed22_55e4_4e41_aeef_45e10ae4bf3c));

/// Text returned to read requests until reconfigured
pub const DEFAULT_READ_TEXT: &str = "Hello BLE";

/// Scanning stops after this long; scanning drains the battery
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// ATT transaction timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// ATT MTU used when no exchange has taken place
pub const ATT_DEFAULT_MTU: usize = 23;

/// Largest value slice carried by a single read response (MTU minus opcode)
pub const MAX_READ_RESPONSE_LEN: usize = ATT_DEFAULT_MTU - 1;

/// Legacy advertising PDU payload ceiling
pub const MAX_LEGACY_ADVERTISING_DATA: usize = 31;

/// Scan failure codes reported by the platform scanner
pub mod scan_error {
    pub const ALREADY_STARTED: i32 = 1;
    pub const APPLICATION_REGISTRATION_FAILED: i32 = 2;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const FEATURE_UNSUPPORTED: i32 = 4;
}

/// ATT/GATT status attached to responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    AttributeNotFound,
    InvalidAttributeLength,
    Failure,
}

impl GattStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 0x00,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::InvalidOffset => 0x07,
            Self::AttributeNotFound => 0x0A,
            Self::InvalidAttributeLength => 0x0D,
            Self::Failure => 0x101,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#04x})", self, self.code())
    }
}

/// Reasons the advertiser refuses to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertiseErrorCode {
    /// Payload exceeds 31 bytes, typically because the device name was included
    DataTooLarge,
    TooManyAdvertisers,
    AlreadyStarted,
    InternalError,
    FeatureUnsupported,
}

impl AdvertiseErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::DataTooLarge => 1,
            Self::TooManyAdvertisers => 2,
            Self::AlreadyStarted => 3,
            Self::InternalError => 4,
            Self::FeatureUnsupported => 5,
        }
    }
}

impl fmt::Display for AdvertiseErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (code {})", self, self.code())
    }
}

/// Characteristic properties as advertised in the declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x08;

    pub fn read_write() -> Self {
        Self(Self::READ | Self::WRITE)
    }
}

/// Attribute permissions on the server side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributePermissions(pub u16);

impl AttributePermissions {
    pub const READ: u16 = 0x01;
    pub const WRITE: u16 = 0x10;

    pub fn read_write() -> Self {
        Self(Self::READ | Self::WRITE)
    }
}

/// Slice a characteristic value for a read request at `offset`
///
/// Long reads fetch the value in pieces; each piece starts at the offset
/// the client has already received. An offset equal to the value length
/// yields an empty slice (end of value), anything past it is an error.
pub fn read_slice(value: &[u8], offset: usize) -> Result<&[u8], GattStatus> {
    value.get(offset..).ok_or(GattStatus::InvalidOffset)
}

/// Size in bytes of the advertising payload
///
/// ```text
/// Flags                      : 1 (len) + 1 (type) + 1
/// Complete 128-bit UUID list : 1 (len) + 1 (type) + 16 per service
/// Complete local name        : 1 (len) + 1 (type) + name bytes
/// ```
pub fn advertising_payload_len(service_count: usize, device_name: Option<&str>) -> usize {
    const FLAGS: usize = 3;
    const AD_HEADER: usize = 2;

    let services = if service_count == 0 {
        0
    } else {
        AD_HEADER + 16 * service_count
    };
    let name = device_name.map(|n| AD_HEADER + n.len()).unwrap_or(0);

    FLAGS + services + name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ids_match_text() {
        assert_eq!(DEFAULT_SERVICE_ID.to_string(), DEFAULT_SERVICE_UUID);
        assert_eq!(
            DEFAULT_CHARACTERISTIC_ID.to_string(),
            DEFAULT_CHARACTERISTIC_UUID
        );
    }

    #[test]
    fn test_read_slice_offset() {
        let value = DEFAULT_READ_TEXT.as_bytes();
        assert_eq!(read_slice(value, 0), Ok(value));
        assert_eq!(read_slice(value, 5), Ok(&b"BLE"[..]));
        assert_eq!(read_slice(value, value.len()), Ok(&b""[..]));
        assert_eq!(read_slice(value, value.len() + 1), Err(GattStatus::InvalidOffset));
    }

    #[test]
    fn test_advertising_payload_len() {
        assert_eq!(advertising_payload_len(1, None), 21);
        assert!(advertising_payload_len(1, None) <= MAX_LEGACY_ADVERTISING_DATA);
        // A typical phone name pushes a 128-bit service advertisement over the limit
        assert!(advertising_payload_len(1, Some("Pixel 8 Pro")) > MAX_LEGACY_ADVERTISING_DATA);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GattStatus::Success.code(), 0);
        assert_eq!(GattStatus::InvalidOffset.code(), 0x07);
        assert_eq!(GattStatus::Failure.to_string(), "Failure (0x101)");
        assert_eq!(AdvertiseErrorCode::DataTooLarge.code(), 1);
    }
}

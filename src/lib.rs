//! BLE GATT sample: a central that finds a peripheral by service and
//! reads/writes one characteristic, and a peripheral hosting it.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{GattError, Result};

//! Bluetooth Module
//!
//! Provides both GATT roles: a central that finds a peripheral by service
//! and reads/writes one characteristic, and a peripheral that hosts that
//! characteristic.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │     BluetoothService     │        │       HostService        │
//! │  (central coordinator)   │        │ (peripheral coordinator) │
//! └────────────┬─────────────┘        └────────────┬─────────────┘
//!              │                                   │
//!       ┌──────┴───────┐                  ┌────────┴────────┐
//!       ▼              ▼                  ▼                 ▼
//! ┌───────────┐  ┌───────────┐    ┌──────────────┐  ┌────────────┐
//! │  Session  │─►│  Scanner  │    │    Server    │─►│ Advertiser │
//! │ - connect │  │ - filtered│    │ - read/write │  │ - one ad   │
//! │ - read    │  │   discovery│   │   requests   │  │   at a time│
//! │ - write   │  └───────────┘    └──────────────┘  └────────────┘
//! └───────────┘
//!              \___________ Protocol (ids, status codes) ________/
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Identifiers, status codes and wire limits
//! - [`scanner`] - Filtered BLE discovery with a bounded window
//! - [`session`] - Central session state machine
//! - [`advertiser`] - Single-advertisement ownership
//! - [`server`] - Peripheral GATT server
//! - [`service`] - Central-role coordinator
//! - [`host`] - Peripheral-role coordinator

pub mod advertiser;
pub mod host;
pub mod protocol;
pub mod scanner;
pub mod server;
pub mod service;
pub mod session;

// Re-export the coordinators for convenience
pub use host::HostService;
pub use service::BluetoothService;

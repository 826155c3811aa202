//! # tuya-lan
//!
//! A local-network client for Tuya-compatible smart devices (plugs, switches,
//! lights, gateways, etc.), speaking the LAN protocol directly over TCP/UDP
//! on the local network so control never depends on Tuya's cloud.
//!
//! ## Key Features
//! - **Local LAN control**: frame, encrypt, and exchange messages directly
//!   with a device's TCP listener.
//! - **Asynchronous architecture**: built on `tokio`.
//! - **Protocol coverage**: versions 3.1, 3.2 (via the `device22` profile),
//!   3.3, 3.4, and 3.5, including the 3.4+ session-key handshake.
//! - **Discovery**: UDP broadcast listener/solicitation for device
//!   announcements.
//! - **Gateway integration**: sub-devices (e.g. Zigbee nodes) addressed by
//!   `cid` through a gateway `Device`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_lan::Device;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize a device with its ID, IP, local key, and protocol version.
//!     // "Auto" resolves the address via discovery on first use.
//!     let device = Device::new("DEVICE_ID", "DEVICE_IP", b"0123456789abcdef".to_vec(), "3.3");
//!
//!     // Set DP 1 (Power) to true
//!     device.set_value(1, json!(true), false).await;
//! }
//! ```

#[macro_use]
pub mod macros;
pub mod buffer;
pub mod catalog;
pub mod crypto;
pub mod device;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod scanner;

pub use device::{Device, DeviceConfig, SubDevice, VersionRequest};
pub use error::TuyaError;
pub use manager::{Manager, ManagerEvent};
pub use protocol::{CommandType, Version};
pub use scanner::{DiscoveryResult, Scanner};

//! Discovers ranging accessories, runs the configuration handshake with each
//! of them, manages one ranging session per device and derives a 2-D
//! position from two anchors.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{AppEvent, Device, DeviceId, DeviceStatus};
pub use infrastructure::bluetooth::{AccessoryService, ServiceCommand, ServiceInput};

//! Bluetooth Module
//!
//! Provides BLE communication with ranging accessories.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    AccessoryService                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - Scan    │  │ - Links    │  │ - UUIDs   │
//! │ - Eviction│  │ - Channels │  │ - Tags    │
//! │           │  │ - Reconnect│  │ - Decoding│
//! └───────────┘  └─────┬──────┘  └───────────┘
//!                      │
//!                      ▼
//!               ┌────────────┐
//!               │ Transport  │
//!               │ (radio)    │
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Accessory message tags, encoding and decoding
//! - [`scanner`] - Accessory discovery and eviction bookkeeping
//! - [`connection`] - Link lifecycle, channel resolution and reconnection
//! - [`transport`] - Seam to the radio stack
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

// Re-export main service for convenience
pub use service::{AccessoryService, ServiceCommand, ServiceInput};
